//! Session settings and program documents.
//!
//! Two program layouts are accepted. The step list is an object with a
//! `steps` array:
//!
//! ```json
//! { "steps": [
//!     { "target": "all", "command": "set_rate",
//!       "args": { "value": 5, "volume_unit": "ml", "time_unit": "h" } },
//!     { "target": 0, "command": "start",
//!       "wait": { "until": ["stopped"], "poll_ms": 200, "timeout_ms": 60000 } }
//! ] }
//! ```
//!
//! The phase layout is an array of pump groups, each holding the phases of a
//! pumping program as the pump's own front panel would enter them:
//!
//! ```json
//! [ { "address": [0, 1], "diameter": 14.43,
//!     "program": [
//!       { "function": "rate", "rate": { "value": 5, "volume_unit": "ml", "time_unit": "min" },
//!         "volume": { "value": 2.5, "unit": "ml" }, "direction": "infuse" },
//!       { "function": "pause", "time": 10 },
//!       { "function": "stop" } ] } ]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value as Json;
use serialport::{DataBits, Parity, SerialPort, StopBits};

use crate::address::TargetSpec;
use crate::command::{Args, Command, PhaseFunction};
use crate::error::{PumpError, Result};
use crate::frame::Prompt;
use crate::program::{Program, ProgramStep, WaitCondition, DEFAULT_POLL};
use crate::pump::PumpBus;

/// Phases a pump can store.
const MAX_PHASES: usize = 41;

fn default_baud_rate() -> u32 {
    19200
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_read_poll_ms() -> u64 {
    10
}

/// How to open the serial line. Framing is always 8N1.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Deadline for one request/response exchange.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Blocking slice of a single port read.
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
}

impl SessionConfig {
    pub fn new(port: impl Into<String>) -> Self {
        SessionConfig {
            port: port.into(),
            baud_rate: default_baud_rate(),
            timeout_ms: default_timeout_ms(),
            read_poll_ms: default_read_poll_ms(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        SessionConfig::from_json(&read_document(path.as_ref())?)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn open(&self) -> Result<Box<dyn SerialPort>> {
        let port = serialport::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(self.read_poll_ms))
            .open()?;
        Ok(port)
    }

    /// Opens the port and wraps it in a [`PumpBus`].
    pub fn connect(&self) -> Result<PumpBus<Box<dyn SerialPort>>> {
        Ok(PumpBus::with_timeout(self.open()?, self.timeout()))
    }
}

fn read_document(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| PumpError::ConfigFile {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WaitDocument {
    until: Vec<Prompt>,
    poll_ms: Option<u64>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepDocument {
    target: TargetSpec,
    command: String,
    #[serde(default)]
    args: Args,
    wait: Option<WaitDocument>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepListDocument {
    steps: Vec<StepDocument>,
}

impl StepListDocument {
    fn compile(self) -> Result<Program> {
        self.steps
            .into_iter()
            .map(|doc| {
                let mut step =
                    ProgramStep::new(doc.target.resolve()?, Command::build(&doc.command, &doc.args)?);
                if let Some(wait) = doc.wait {
                    if wait.until.is_empty() {
                        return Err(PumpError::invalid_argument("until", "no prompt to wait for"));
                    }
                    step = step.wait_for(
                        WaitCondition::new(wait.until, Duration::from_millis(wait.timeout_ms))
                            .poll_every(wait.poll_ms.map_or(DEFAULT_POLL, Duration::from_millis)),
                    );
                }
                if let Some(delay) = doc.delay_ms {
                    step = step.then_delay(Duration::from_millis(delay));
                }
                Ok(step)
            })
            .collect::<Result<Vec<_>>>()
            .map(Program::new)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateDocument {
    value: f64,
    volume_unit: Option<String>,
    time_unit: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VolumeDocument {
    value: Option<f64>,
    unit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhaseDocument {
    function: String,
    rate: Option<RateDocument>,
    volume: Option<VolumeDocument>,
    direction: Option<String>,
    /// Function data under any key (`phase`, `count`, `time`, ...).
    #[serde(flatten)]
    data: Args,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PumpProgramDocument {
    address: TargetSpec,
    diameter: Option<f64>,
    program: Vec<PhaseDocument>,
}

fn object(pairs: impl IntoIterator<Item = (&'static str, Json)>) -> Args {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

impl PumpProgramDocument {
    // PHN n, FUN, then RAT/VOL/DIR for rate phases.
    fn compile_into(self, steps: &mut Vec<ProgramStep>) -> Result<()> {
        if self.program.len() > MAX_PHASES {
            return Err(PumpError::invalid_argument(
                "program",
                format!("{} phases, at most {MAX_PHASES} fit", self.program.len()),
            ));
        }
        let target = self.address.resolve()?;
        let mut push = |command: Command| steps.push(ProgramStep::new(target.clone(), command));

        if let Some(mm) = self.diameter {
            push(Command::set_diameter(mm)?);
        }
        for (index, phase) in self.program.into_iter().enumerate() {
            push(Command::set_phase(index as u8 + 1)?);

            if phase.data.len() > 1 {
                return Err(PumpError::invalid_argument(
                    "function",
                    format!("phase {} carries more than one data value", index + 1),
                ));
            }
            let mut args = object([("function", Json::from(phase.function))]);
            if let Some(data) = phase.data.into_iter().next().map(|(_, v)| v) {
                args.insert("data".into(), data);
            }
            let function = Command::build("set_function", &args)?;
            let is_rate = match function.wire_args() {
                [code, rest @ ..] => PhaseFunction::from_parts(
                    code,
                    rest.first().and_then(|d| d.parse().ok()),
                )
                .map_or(false, PhaseFunction::is_rate_function),
                [] => false,
            };
            push(function);

            let has_rate_settings =
                phase.rate.is_some() || phase.volume.is_some() || phase.direction.is_some();
            if has_rate_settings && !is_rate {
                return Err(PumpError::invalid_argument(
                    "function",
                    format!("phase {} sets rate, volume or direction on a non-rate function", index + 1),
                ));
            }

            if let Some(rate) = phase.rate {
                let mut args = object([("value", Json::from(rate.value))]);
                if let Some(unit) = rate.volume_unit {
                    args.insert("volume_unit".into(), unit.into());
                }
                if let Some(unit) = rate.time_unit {
                    args.insert("time_unit".into(), unit.into());
                }
                push(Command::build("set_rate", &args)?);
            }
            if let Some(volume) = phase.volume {
                if volume.value.is_none() && volume.unit.is_none() {
                    return Err(PumpError::invalid_argument(
                        "volume",
                        "needs a value, a unit or both",
                    ));
                }
                if let Some(value) = volume.value {
                    push(Command::set_volume(value)?);
                }
                if let Some(unit) = volume.unit {
                    push(Command::build("set_volume_unit", &object([("unit", Json::from(unit))]))?);
                }
            }
            if let Some(direction) = phase.direction {
                push(Command::build(
                    "set_direction",
                    &object([("direction", Json::from(direction))]),
                )?);
            }
        }
        Ok(())
    }
}

/// Parses a program document in either layout.
pub fn parse_program(text: &str) -> Result<Program> {
    let document: Json = serde_json::from_str(text)?;
    if document.is_array() {
        let groups: Vec<PumpProgramDocument> = serde_json::from_value(document)?;
        let mut steps = Vec::new();
        for group in groups {
            group.compile_into(&mut steps)?;
        }
        Ok(Program::new(steps))
    } else {
        serde_json::from_value::<StepListDocument>(document)?.compile()
    }
}

pub fn load_program(path: impl AsRef<Path>) -> Result<Program> {
    parse_program(&read_document(path.as_ref())?)
}
