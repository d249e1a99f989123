//! Typed parameter values exchanged with the pumps.

use crate::error::{PumpError, Result};

/// Volume unit of the syringe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeUnit {
    Microliters,
    Milliliters,
}

impl VolumeUnit {
    pub fn code(self) -> &'static str {
        match self {
            VolumeUnit::Microliters => "U",
            VolumeUnit::Milliliters => "M",
        }
    }

    pub fn from_code(c: char) -> Option<VolumeUnit> {
        match c {
            'U' => Some(VolumeUnit::Microliters),
            'M' => Some(VolumeUnit::Milliliters),
            _ => None,
        }
    }
}

/// Time base of a pumping rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    PerMinute,
    PerHour,
}

impl TimeUnit {
    pub fn code(self) -> &'static str {
        match self {
            TimeUnit::PerMinute => "M",
            TimeUnit::PerHour => "H",
        }
    }

    pub fn from_code(c: char) -> Option<TimeUnit> {
        match c {
            'M' => Some(TimeUnit::PerMinute),
            'H' => Some(TimeUnit::PerHour),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateUnits {
    pub volume: VolumeUnit,
    pub time: TimeUnit,
}

/// Pumping rate. Units are optional on set; the pump keeps its current ones.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rate {
    pub value: f64,
    pub units: Option<RateUnits>,
}

impl Rate {
    pub fn new(value: f64, volume: VolumeUnit, time: TimeUnit) -> Rate {
        Rate {
            value,
            units: Some(RateUnits { volume, time }),
        }
    }

    /// Parses `5.5MH` style replies.
    pub(crate) fn parse(data: &str) -> Result<Rate> {
        let (value, units) = split_suffix(data, 2)?;
        let mut units = units.chars();
        let volume = units.next().and_then(VolumeUnit::from_code);
        let time = units.next().and_then(TimeUnit::from_code);
        match (volume, time) {
            (Some(volume), Some(time)) => Ok(Rate::new(parse_number(value)?, volume, time)),
            _ => Err(PumpError::malformed(format!("unknown rate units in {data:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Volume {
    pub value: f64,
    pub unit: VolumeUnit,
}

impl Volume {
    /// Parses `10.00ML` style replies.
    pub(crate) fn parse(data: &str) -> Result<Volume> {
        let (value, unit) = split_suffix(data, 2)?;
        Ok(Volume {
            value: parse_number(value)?,
            unit: parse_volume_unit(unit)?,
        })
    }
}

/// Pumping direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Infuse,
    Withdraw,
    /// Reverse the current direction.
    Reverse,
}

impl Direction {
    pub fn code(self) -> &'static str {
        match self {
            Direction::Infuse => "INF",
            Direction::Withdraw => "WDR",
            Direction::Reverse => "REV",
        }
    }

    pub(crate) fn parse(data: &str) -> Result<Direction> {
        match data {
            "INF" => Ok(Direction::Infuse),
            "WDR" => Ok(Direction::Withdraw),
            "REV" => Ok(Direction::Reverse),
            other => Err(PumpError::malformed(format!("unknown direction {other:?}"))),
        }
    }
}

/// External trigger setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Falling edge starts or stops the program.
    FootSwitch,
    /// Rising edge starts, falling edge stops.
    LevelControl,
    /// Falling edge starts the program.
    StartOnly,
}

impl Trigger {
    pub fn code(self) -> &'static str {
        match self {
            Trigger::FootSwitch => "FT",
            Trigger::LevelControl => "LE",
            Trigger::StartOnly => "ST",
        }
    }

    pub(crate) fn parse(data: &str) -> Result<Trigger> {
        match data {
            "FT" => Ok(Trigger::FootSwitch),
            "LE" => Ok(Trigger::LevelControl),
            "ST" => Ok(Trigger::StartOnly),
            other => Err(PumpError::malformed(format!("unknown trigger {other:?}"))),
        }
    }
}

/// Communications mode. Safe mode alarms when no valid packet arrives within
/// the timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComMode {
    Basic,
    Safe { timeout_s: u8 },
}

impl ComMode {
    pub(crate) fn from_timeout(timeout: u8) -> ComMode {
        match timeout {
            0 => ComMode::Basic,
            t => ComMode::Safe { timeout_s: t },
        }
    }

    pub fn timeout(self) -> u8 {
        match self {
            ComMode::Basic => 0,
            ComMode::Safe { timeout_s } => timeout_s,
        }
    }
}

/// Function of one pumping program phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseFunction {
    Rate,
    Increment,
    Decrement,
    Stop,
    /// Jump to phase n.
    Jump(u8),
    /// Loop back to the loop start n times.
    LoopFor(u8),
    LoopStart,
    LoopEnd,
    /// Pause n seconds; 0 waits for the trigger.
    Pause(u8),
    /// Jump to phase n if the program input pin is low.
    If(u8),
    EventTrap(u8),
    EventReset,
    Beep,
    /// Set the programmable output pin.
    Output(u8),
}

impl PhaseFunction {
    pub fn code(self) -> &'static str {
        match self {
            PhaseFunction::Rate => "RAT",
            PhaseFunction::Increment => "INC",
            PhaseFunction::Decrement => "DEC",
            PhaseFunction::Stop => "STP",
            PhaseFunction::Jump(_) => "JMP",
            PhaseFunction::LoopFor(_) => "LOP",
            PhaseFunction::LoopStart => "LPS",
            PhaseFunction::LoopEnd => "LPE",
            PhaseFunction::Pause(_) => "PAS",
            PhaseFunction::If(_) => "IF",
            PhaseFunction::EventTrap(_) => "EVN",
            PhaseFunction::EventReset => "EVR",
            PhaseFunction::Beep => "BEP",
            PhaseFunction::Output(_) => "OUT",
        }
    }

    pub fn data(self) -> Option<u8> {
        match self {
            PhaseFunction::Jump(n)
            | PhaseFunction::LoopFor(n)
            | PhaseFunction::Pause(n)
            | PhaseFunction::If(n)
            | PhaseFunction::EventTrap(n)
            | PhaseFunction::Output(n) => Some(n),
            _ => None,
        }
    }

    /// Rate, increment and decrement phases carry rate, volume and direction.
    pub fn is_rate_function(self) -> bool {
        matches!(
            self,
            PhaseFunction::Rate | PhaseFunction::Increment | PhaseFunction::Decrement
        )
    }

    /// Legal data range for a function code, or `None` if it takes no data.
    pub fn data_range(code: &str) -> Option<(i64, i64)> {
        match code {
            "JMP" | "IF" | "EVN" => Some((1, 41)),
            "LOP" => Some((1, 99)),
            "PAS" => Some((0, 99)),
            "OUT" => Some((0, 1)),
            _ => None,
        }
    }

    pub fn from_parts(code: &str, data: Option<u8>) -> Option<PhaseFunction> {
        let f = match (code, data) {
            ("RAT", None) => PhaseFunction::Rate,
            ("INC", None) => PhaseFunction::Increment,
            ("DEC", None) => PhaseFunction::Decrement,
            ("STP", None) => PhaseFunction::Stop,
            ("LPS", None) => PhaseFunction::LoopStart,
            ("LPE", None) => PhaseFunction::LoopEnd,
            ("EVR", None) => PhaseFunction::EventReset,
            ("BEP", None) => PhaseFunction::Beep,
            ("PAS", None) => PhaseFunction::Pause(0),
            ("JMP", Some(n)) => PhaseFunction::Jump(n),
            ("LOP", Some(n)) => PhaseFunction::LoopFor(n),
            ("PAS", Some(n)) => PhaseFunction::Pause(n),
            ("IF", Some(n)) => PhaseFunction::If(n),
            ("EVN", Some(n)) => PhaseFunction::EventTrap(n),
            ("OUT", Some(n)) => PhaseFunction::Output(n),
            _ => return None,
        };
        Some(f)
    }

    /// Parses `PAS10` or `LPS` style replies; data is the trailing two digits.
    pub(crate) fn parse(data: &str) -> Result<PhaseFunction> {
        let split = data.len().saturating_sub(2);
        let (code, number) = match data.get(split..) {
            Some(tail) if data.len() > 2 && tail.bytes().all(|b| b.is_ascii_digit()) => {
                (&data[..split], tail.parse::<u8>().ok())
            }
            _ => (data, None),
        };
        PhaseFunction::from_parts(code, number)
            .ok_or_else(|| PumpError::malformed(format!("unknown phase function {data:?}")))
    }
}

/// Volumes dispensed since the last clear, per direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dispensed {
    pub infused: f64,
    pub withdrawn: f64,
    pub unit: VolumeUnit,
}

impl Dispensed {
    /// Parses `I1.234W0.500ML` style replies.
    pub(crate) fn parse(data: &str) -> Result<Dispensed> {
        let (amounts, unit) = split_suffix(data, 2)?;
        let (infused, withdrawn) = amounts
            .strip_prefix('I')
            .and_then(|rest| rest.split_once('W'))
            .ok_or_else(|| {
                PumpError::malformed(format!("infusion/withdrawal keys missing in {data:?}"))
            })?;
        Ok(Dispensed {
            infused: parse_number(infused)?,
            withdrawn: parse_number(withdrawn)?,
            unit: parse_volume_unit(unit)?,
        })
    }
}

fn split_suffix(data: &str, len: usize) -> Result<(&str, &str)> {
    if data.len() <= len || !data.is_char_boundary(data.len() - len) {
        return Err(PumpError::malformed(format!("{data:?} is too short")));
    }
    Ok(data.split_at(data.len() - len))
}

fn parse_number(text: &str) -> Result<f64> {
    text.parse()
        .map_err(|_| PumpError::malformed(format!("{text:?} is not a number")))
}

fn parse_volume_unit(unit: &str) -> Result<VolumeUnit> {
    match unit {
        "UL" => Ok(VolumeUnit::Microliters),
        "ML" => Ok(VolumeUnit::Milliliters),
        other => Err(PumpError::malformed(format!("unknown volume unit {other:?}"))),
    }
}

/// Formats a quantity the way the pumps accept it: at most four digits and
/// at most three of them after the decimal point.
///
/// Returns `None` when the value cannot be expressed in four digits.
pub fn format_quantity(value: f64) -> Option<String> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    // -0.0 would print with a sign.
    let value = if value == 0.0 { 0.0 } else { value };
    for decimals in (0..=3).rev() {
        let text = format!("{value:.decimals$}");
        let digits = text.bytes().filter(u8::is_ascii_digit).count();
        if digits <= 4 {
            let text = if text.contains('.') {
                text.trim_end_matches('0').trim_end_matches('.').to_string()
            } else {
                text
            };
            return Some(text);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_keeps_four_significant_digits() {
        assert_eq!(format_quantity(0.5).as_deref(), Some("0.5"));
        assert_eq!(format_quantity(1.2346).as_deref(), Some("1.235"));
        assert_eq!(format_quantity(14.43).as_deref(), Some("14.43"));
        assert_eq!(format_quantity(123.456).as_deref(), Some("123.5"));
        assert_eq!(format_quantity(9999.0).as_deref(), Some("9999"));
        assert_eq!(format_quantity(5.0).as_deref(), Some("5"));
        assert_eq!(format_quantity(9.9996).as_deref(), Some("10"));
        assert_eq!(format_quantity(-0.0).as_deref(), Some("0"));
        assert_eq!(format_quantity(0.0004).as_deref(), Some("0"));
    }

    #[test]
    fn quantity_rejects_unrepresentable() {
        assert_eq!(format_quantity(10000.0), None);
        assert_eq!(format_quantity(9999.7), None);
        assert_eq!(format_quantity(-1.0), None);
        assert_eq!(format_quantity(f64::NAN), None);
    }

    #[test]
    fn parse_rate_reply() {
        let rate = Rate::parse("5.5MH").unwrap();
        assert_eq!(rate, Rate::new(5.5, VolumeUnit::Milliliters, TimeUnit::PerHour));
        assert!(Rate::parse("5.5XX").is_err());
        assert!(Rate::parse("MH").is_err());
    }

    #[test]
    fn parse_volume_and_dispensed() {
        let volume = Volume::parse("0.250UL").unwrap();
        assert_eq!(volume.value, 0.25);
        assert_eq!(volume.unit, VolumeUnit::Microliters);

        let dispensed = Dispensed::parse("I1.234W0.500ML").unwrap();
        assert_eq!(dispensed.infused, 1.234);
        assert_eq!(dispensed.withdrawn, 0.5);
        assert_eq!(dispensed.unit, VolumeUnit::Milliliters);
        assert!(Dispensed::parse("1.234W0.5ML").is_err());
    }

    #[test]
    fn parse_phase_functions() {
        assert_eq!(PhaseFunction::parse("RAT").unwrap(), PhaseFunction::Rate);
        assert_eq!(PhaseFunction::parse("PAS10").unwrap(), PhaseFunction::Pause(10));
        assert_eq!(PhaseFunction::parse("JMP03").unwrap(), PhaseFunction::Jump(3));
        assert_eq!(PhaseFunction::parse("LPS").unwrap(), PhaseFunction::LoopStart);
        assert!(PhaseFunction::parse("RAT05").is_err());
        assert!(PhaseFunction::parse("XYZ").is_err());
    }
}
