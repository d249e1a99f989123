//! Pump addressing on the shared line.
//!
//! Every pump on the multi-drop bus answers to a decimal address in `0..=99`.
//! Resolution is a pure range check; bus exclusion lives in the session.

use std::fmt;

use serde::Deserialize;

use crate::error::{PumpError, Result};

/// Highest address a pump can be configured to.
pub const MAX_ADDRESS: u8 = 99;

/// A validated network address of one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PumpAddress(u8);

impl PumpAddress {
    /// Every address the bus can carry, in ascending order.
    pub fn all() -> impl Iterator<Item = PumpAddress> {
        (0..=MAX_ADDRESS).map(PumpAddress)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for PumpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl TryFrom<i64> for PumpAddress {
    type Error = PumpError;

    fn try_from(index: i64) -> Result<Self> {
        resolve(index)
    }
}

/// Maps a logical pump index to its bus address.
pub fn resolve(index: i64) -> Result<PumpAddress> {
    match u8::try_from(index) {
        Ok(a) if a <= MAX_ADDRESS => Ok(PumpAddress(a)),
        _ => Err(PumpError::InvalidAddress(index)),
    }
}

/// Which pumps a program step is aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    One(PumpAddress),
    Many(Vec<PumpAddress>),
    /// Every pump the sequencer knows about.
    All,
}

impl Target {
    /// Expands the target into concrete addresses, in the order they will be
    /// addressed.
    pub fn expand(&self, known: &[PumpAddress]) -> Vec<PumpAddress> {
        match self {
            Target::One(a) => vec![*a],
            Target::Many(list) => list.clone(),
            Target::All => known.to_vec(),
        }
    }
}

impl From<PumpAddress> for Target {
    fn from(address: PumpAddress) -> Self {
        Target::One(address)
    }
}

/// Target as written in a program document: an index, a list of indices, or
/// the string `"all"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetSpec {
    One(i64),
    Many(Vec<i64>),
    Keyword(String),
}

impl TargetSpec {
    pub fn resolve(&self) -> Result<Target> {
        match self {
            TargetSpec::One(i) => Ok(Target::One(resolve(*i)?)),
            TargetSpec::Many(list) => list
                .iter()
                .map(|i| resolve(*i))
                .collect::<Result<Vec<_>>>()
                .map(Target::Many),
            TargetSpec::Keyword(k) if k.eq_ignore_ascii_case("all") => Ok(Target::All),
            TargetSpec::Keyword(k) => Err(PumpError::InvalidArgument {
                name: "address".into(),
                reason: format!("expected an index, a list or \"all\", got {k:?}"),
            }),
        }
    }
}
