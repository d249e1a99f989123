//! Typed command set.
//!
//! Commands are built by name from loosely typed arguments (as they arrive
//! from a program document) or through the typed constructors below. Both
//! paths validate against the [`catalogue`] before anything reaches the wire.

pub mod catalogue;
pub mod values;

use log::warn;
use serde_json::{json, Map, Value as Json};

use crate::error::{PumpError, Result};
use crate::frame::{Response, Shape, Status, Value};

use catalogue::{ArgKind, ArgSpec, Choice, CommandSpec, ReplyKind, INPUT_PINS};
pub use values::{
    format_quantity, ComMode, Direction, Dispensed, PhaseFunction, Rate, RateUnits, TimeUnit,
    Trigger, Volume, VolumeUnit,
};

/// Named arguments of a command.
pub type Args = Map<String, Json>;

/// A validated command, ready to be encoded for any address.
#[derive(Debug, Clone)]
pub struct Command {
    spec: &'static CommandSpec,
    args: Vec<String>,
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.spec.name == other.spec.name && self.args == other.args
    }
}

impl Command {
    /// Builds `name` from named arguments, checking presence, type and range.
    pub fn build(name: &str, args: &Args) -> Result<Command> {
        let spec =
            catalogue::lookup(name).ok_or_else(|| PumpError::UnknownCommand(name.to_string()))?;

        if let Some(extra) = args
            .keys()
            .find(|key| !spec.args.iter().any(|a| a.name == key.as_str()))
        {
            return Err(PumpError::invalid_argument(
                extra,
                format!("not accepted by {name}"),
            ));
        }

        let rewritten = pause_for_trigger(spec.name, args);
        let args = rewritten.as_ref().unwrap_or(args);

        let mut wire = Vec::with_capacity(spec.args.len() + 1);
        if !spec.prefix.is_empty() {
            wire.push(spec.prefix.to_string());
        }
        for arg in spec.args {
            match args.get(arg.name) {
                Some(value) => wire.push(encode_arg(arg, value)?),
                None if arg.required => {
                    return Err(PumpError::invalid_argument(arg.name, "missing"));
                }
                None => {}
            }
        }
        check_combination(spec, args, &wire)?;

        Ok(Command { spec, args: wire })
    }

    /// Like [`Command::build`], with the arguments given as a JSON object.
    pub fn build_json(name: &str, args: &str) -> Result<Command> {
        let args: Args = serde_json::from_str(args)?;
        Command::build(name, &args)
    }

    /// Builds an argument-less command; used for getters and actions.
    pub fn get(parameter: &str) -> Result<Command> {
        let name = format!("get_{parameter}");
        Command::build(&name, &Args::new())
    }

    fn simple(name: &str) -> Command {
        let spec = catalogue::lookup(name)
            .unwrap_or_else(|| unreachable!("{name} is missing from the catalogue"));
        Command {
            spec,
            args: Vec::new(),
        }
    }

    /// Empty command; the pump answers with its prompt only.
    pub fn status() -> Command {
        Command::simple("status")
    }

    pub fn firmware_version() -> Command {
        Command::simple("firmware_version")
    }

    pub fn start() -> Command {
        Command::simple("start")
    }

    pub fn stop() -> Command {
        Command::simple("stop")
    }

    pub fn pause() -> Command {
        Command::simple("pause")
    }

    pub fn dispensed() -> Command {
        Command::simple("dispensed")
    }

    pub fn set_diameter(mm: f64) -> Result<Command> {
        Command::build("set_diameter", &object(json!({ "diameter": mm })))
    }

    pub fn set_rate(rate: Rate) -> Result<Command> {
        let mut args = object(json!({ "value": rate.value }));
        if let Some(units) = rate.units {
            args.insert("volume_unit".into(), units.volume.code().into());
            args.insert("time_unit".into(), units.time.code().into());
        }
        Command::build("set_rate", &args)
    }

    pub fn set_volume(value: f64) -> Result<Command> {
        Command::build("set_volume", &object(json!({ "value": value })))
    }

    pub fn set_volume_unit(unit: VolumeUnit) -> Result<Command> {
        let code = format!("{}L", unit.code());
        Command::build("set_volume_unit", &object(json!({ "unit": code })))
    }

    pub fn set_direction(direction: Direction) -> Result<Command> {
        Command::build(
            "set_direction",
            &object(json!({ "direction": direction.code() })),
        )
    }

    pub fn set_phase(phase: u8) -> Result<Command> {
        Command::build("set_phase", &object(json!({ "phase": phase })))
    }

    pub fn set_function(function: PhaseFunction) -> Result<Command> {
        let mut args = object(json!({ "function": function.code() }));
        if let Some(data) = function.data() {
            args.insert("data".into(), data.into());
        }
        Command::build("set_function", &args)
    }

    pub fn set_com_mode(mode: ComMode) -> Result<Command> {
        Command::build("set_com_mode", &object(json!({ "timeout": mode.timeout() })))
    }

    pub fn set_trigger(trigger: Trigger) -> Result<Command> {
        Command::build("set_trigger", &object(json!({ "trigger": trigger.code() })))
    }

    pub fn set_flag(parameter: &str, enabled: bool) -> Result<Command> {
        let name = format!("set_{parameter}");
        Command::build(&name, &object(json!({ "enabled": enabled })))
    }

    pub fn set_buzzer(on: bool, count: Option<u8>) -> Result<Command> {
        let mut args = object(json!({ "on": on }));
        if let Some(count) = count {
            args.insert("count".into(), count.into());
        }
        Command::build("set_buzzer", &args)
    }

    pub fn clear_dispensed(direction: Direction) -> Result<Command> {
        Command::build(
            "clear_dispensed",
            &object(json!({ "direction": direction.code() })),
        )
    }

    pub fn ttl_output(level: u8) -> Result<Command> {
        Command::build("ttl_output", &object(json!({ "level": level })))
    }

    pub fn ttl_input(pin: u8) -> Result<Command> {
        Command::build("ttl_input", &object(json!({ "pin": pin })))
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn mnemonic(&self) -> &'static str {
        self.spec.mnemonic
    }

    /// Encoded arguments, in wire order.
    pub fn wire_args(&self) -> &[String] {
        &self.args
    }

    pub fn reply_kind(&self) -> ReplyKind {
        self.spec.reply
    }

    pub fn reply_shape(&self) -> Shape {
        self.spec.reply.shape()
    }
}

fn object(value: Json) -> Args {
    match value {
        Json::Object(map) => map,
        _ => Args::new(),
    }
}

fn encode_arg(arg: &ArgSpec, value: &Json) -> Result<String> {
    match &arg.kind {
        ArgKind::Quantity {
            min,
            max,
            min_exclusive,
        } => {
            let v = value
                .as_f64()
                .ok_or_else(|| PumpError::invalid_argument(arg.name, "expected a number"))?;
            let below = if *min_exclusive { v <= *min } else { v < *min };
            if below || v > *max {
                let lower = if *min_exclusive { "(" } else { "[" };
                return Err(PumpError::invalid_argument(
                    arg.name,
                    format!("{v} is outside {lower}{min}, {max}]"),
                ));
            }
            let text = format_quantity(v).ok_or_else(|| {
                PumpError::invalid_argument(arg.name, format!("{v} does not fit in four digits"))
            })?;
            if *min_exclusive && text.parse::<f64>().map_or(true, |sent| sent <= *min) {
                return Err(PumpError::invalid_argument(
                    arg.name,
                    format!("{v} rounds to {text} on the wire"),
                ));
            }
            Ok(text)
        }
        ArgKind::Integer { min, max } => {
            let v = integer(arg.name, value)?;
            if v < *min || v > *max {
                return Err(PumpError::invalid_argument(
                    arg.name,
                    format!("{v} is outside [{min}, {max}]"),
                ));
            }
            Ok(v.to_string())
        }
        ArgKind::Choice(choices) => {
            let text = value
                .as_str()
                .ok_or_else(|| PumpError::invalid_argument(arg.name, "expected a string"))?;
            choose(choices, text)
                .map(|c| c.code.to_string())
                .ok_or_else(|| {
                    PumpError::invalid_argument(arg.name, format!("unknown value {text:?}"))
                })
        }
        ArgKind::Flag => match value {
            Json::Bool(b) => Ok(if *b { "1" } else { "0" }.to_string()),
            other => match integer(arg.name, other)? {
                0 => Ok("0".to_string()),
                1 => Ok("1".to_string()),
                v => Err(PumpError::invalid_argument(
                    arg.name,
                    format!("{v} is not a flag"),
                )),
            },
        },
    }
}

/// `PAS` data may be given as `"trigger"`, which the pump spells `0`.
fn pause_for_trigger(name: &str, args: &Args) -> Option<Args> {
    if name != "set_function" || args.get("data").and_then(Json::as_str) != Some("trigger") {
        return None;
    }
    let mut args = args.clone();
    args.insert("data".into(), Json::from(0));
    Some(args)
}

fn integer(name: &str, value: &Json) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| PumpError::invalid_argument(name, "expected an integer"))
}

fn choose<'a>(choices: &'a [Choice], text: &str) -> Option<&'a Choice> {
    choices
        .iter()
        .find(|c| c.code == text || c.names.contains(&text))
}

/// Constraints spanning more than one argument.
fn check_combination(spec: &CommandSpec, args: &Args, wire: &[String]) -> Result<()> {
    match spec.name {
        "set_rate" => {
            if args.contains_key("volume_unit") != args.contains_key("time_unit") {
                return Err(PumpError::invalid_argument(
                    "volume_unit",
                    "volume and time units must be given together",
                ));
            }
        }
        "set_function" => {
            let code = wire[0].as_str();
            match (PhaseFunction::data_range(code), args.get("data")) {
                (None, Some(_)) => {
                    return Err(PumpError::invalid_argument(
                        "data",
                        format!("function {code} takes no data"),
                    ))
                }
                (Some((min, max)), Some(value)) => {
                    let v = integer("data", value)?;
                    if v < min || v > max {
                        return Err(PumpError::invalid_argument(
                            "data",
                            format!("{v} is outside [{min}, {max}] for {code}"),
                        ));
                    }
                }
                (Some(_), None) if code != "PAS" => {
                    return Err(PumpError::invalid_argument(
                        "data",
                        format!("function {code} needs data"),
                    ))
                }
                _ => {}
            }
        }
        "ttl_input" => {
            let pin = integer("pin", &args["pin"])?;
            if !INPUT_PINS.contains(&pin) {
                return Err(PumpError::invalid_argument(
                    "pin",
                    format!("pin {pin} is not an input (expected one of {INPUT_PINS:?})"),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Result of a command once the reply has been interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Done,
    Status(Status),
    Text(String),
    Number(f64),
    Integer(i64),
    Flag(bool),
    Rate(Rate),
    Volume(Volume),
    Direction(Direction),
    Function(PhaseFunction),
    Trigger(Trigger),
    ComMode(ComMode),
    Dispensed(Dispensed),
}

macro_rules! reply_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(self) -> Result<$ty> {
            match self {
                Reply::$variant(v) => Ok(v),
                other => Err(PumpError::malformed(format!(
                    concat!("expected ", stringify!($variant), " reply, got {:?}"),
                    other
                ))),
            }
        }
    };
}

impl Reply {
    reply_accessor!(into_status, Status, Status);
    reply_accessor!(into_text, Text, String);
    reply_accessor!(into_number, Number, f64);
    reply_accessor!(into_integer, Integer, i64);
    reply_accessor!(into_flag, Flag, bool);
    reply_accessor!(into_rate, Rate, Rate);
    reply_accessor!(into_volume, Volume, Volume);
    reply_accessor!(into_direction, Direction, Direction);
    reply_accessor!(into_function, Function, PhaseFunction);
    reply_accessor!(into_trigger, Trigger, Trigger);
    reply_accessor!(into_com_mode, ComMode, ComMode);
    reply_accessor!(into_dispensed, Dispensed, Dispensed);
}

/// Maps a decoded response onto the command's result.
///
/// Alarms always fail the command, even when a value was also returned.
pub fn interpret(command: &Command, response: &Response) -> Result<Reply> {
    let address = response.address;
    match &response.status {
        Status::Alarm(alarm) => {
            warn!("pump {address} alarm on {}: {alarm}", command.name());
            return Err(PumpError::PumpAlarm {
                address,
                alarm: *alarm,
            });
        }
        Status::Unknown(raw) => {
            warn!(
                "pump {address} answered {} with unknown status {raw:?}",
                command.name()
            );
        }
        Status::Prompt(_) => {}
    }

    if let Some(code) = &response.error {
        warn!("pump {address} rejected {}: {code}", command.name());
        return Err(PumpError::CommandRejected {
            address,
            code: code.clone(),
        });
    }

    let kind = command.reply_kind();
    if matches!(kind, ReplyKind::None) {
        return Ok(Reply::Done);
    }
    if matches!(kind, ReplyKind::Status) {
        return Ok(Reply::Status(response.status.clone()));
    }

    let value = response.value.as_ref().ok_or_else(|| {
        PumpError::malformed(format!("{} returned no data", command.name()))
    })?;
    let reply = match (kind, value) {
        (ReplyKind::Text, v) => Reply::Text(v.as_text()),
        (ReplyKind::Number, Value::Number(n)) => Reply::Number(*n),
        (ReplyKind::Integer, Value::Number(n)) => Reply::Integer(whole(*n)?),
        (ReplyKind::Flag, Value::Number(n)) => Reply::Flag(whole(*n)? != 0),
        (ReplyKind::ComMode, Value::Number(n)) => {
            let timeout = u8::try_from(whole(*n)?)
                .map_err(|_| PumpError::malformed(format!("timeout {n} out of range")))?;
            Reply::ComMode(ComMode::from_timeout(timeout))
        }
        (ReplyKind::Rate, Value::Text(t)) => Reply::Rate(Rate::parse(t)?),
        (ReplyKind::Volume, Value::Text(t)) => Reply::Volume(Volume::parse(t)?),
        (ReplyKind::Direction, Value::Text(t)) => Reply::Direction(Direction::parse(t)?),
        (ReplyKind::Function, Value::Text(t)) => Reply::Function(PhaseFunction::parse(t)?),
        (ReplyKind::Trigger, Value::Text(t)) => Reply::Trigger(Trigger::parse(t)?),
        (ReplyKind::Dispensed, Value::Text(t)) => Reply::Dispensed(Dispensed::parse(t)?),
        (kind, value) => {
            return Err(PumpError::malformed(format!(
                "{value:?} does not fit a {kind:?} reply"
            )))
        }
    };
    Ok(reply)
}

fn whole(n: f64) -> Result<i64> {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(n as i64)
    } else {
        Err(PumpError::malformed(format!("{n} is not an integer")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::resolve;
    use crate::frame::{decode, encode, AlarmKind, ErrorCode, Prompt};

    fn exchange(command: &Command, reply: &[u8]) -> Result<Reply> {
        let frame = encode(resolve(0).unwrap(), command);
        let response = decode(reply, &frame)?;
        interpret(command, &response)
    }

    #[test]
    fn firmware_version_scenario() {
        let reply = exchange(&Command::firmware_version(), b"00NE1000V3.934\r").unwrap();
        assert_eq!(reply, Reply::Text("NE1000V3.934".into()));
    }

    #[test]
    fn unknown_status_still_yields_the_number() {
        let reply = exchange(&Command::get("diameter").unwrap(), b"00X14.43\r").unwrap();
        assert_eq!(reply, Reply::Number(14.43));
    }

    #[test]
    fn negative_rate_is_rejected_before_encoding() {
        let err = Command::build_json("set_rate", r#"{"value": -5}"#).unwrap_err();
        assert!(matches!(err, PumpError::InvalidArgument { ref name, .. } if name == "value"));
        assert!(Command::set_rate(Rate { value: 0.0, units: None }).is_err());
    }

    #[test]
    fn quantities_never_reach_the_wire_as_zero_or_negative_zero() {
        let err = Command::set_rate(Rate::new(
            0.0004,
            VolumeUnit::Milliliters,
            TimeUnit::PerMinute,
        ))
        .unwrap_err();
        assert!(matches!(err, PumpError::InvalidArgument { ref name, .. } if name == "value"));

        let volume = Command::set_volume(-0.0).unwrap();
        assert_eq!(encode(resolve(0).unwrap(), &volume).bytes, b"00VOL0\r");
    }

    #[test]
    fn pause_data_accepts_trigger() {
        let command =
            Command::build_json("set_function", r#"{"function": "pause", "data": "trigger"}"#)
                .unwrap();
        assert_eq!(command.wire_args(), ["PAS", "0"]);

        assert!(Command::build_json("set_function", r#"{"function": "pause", "data": "later"}"#)
            .is_err());
    }

    #[test]
    fn set_rate_encodes_units_in_order() {
        let command =
            Command::set_rate(Rate::new(14.5, VolumeUnit::Milliliters, TimeUnit::PerHour))
                .unwrap();
        assert_eq!(encode(resolve(1).unwrap(), &command).bytes, b"01RAT14.5MH\r");

        let bare = Command::build_json("set_rate", r#"{"value": 2}"#).unwrap();
        assert_eq!(encode(resolve(1).unwrap(), &bare).bytes, b"01RAT2\r");
    }

    #[test]
    fn rate_units_must_come_together() {
        let err = Command::build_json("set_rate", r#"{"value": 2, "volume_unit": "ml"}"#)
            .unwrap_err();
        assert!(matches!(err, PumpError::InvalidArgument { .. }));
    }

    #[test]
    fn build_reports_missing_wrong_type_and_unknown_arguments() {
        assert!(matches!(
            Command::build_json("set_diameter", "{}"),
            Err(PumpError::InvalidArgument { ref name, .. }) if name == "diameter"
        ));
        assert!(matches!(
            Command::build_json("set_diameter", r#"{"diameter": "wide"}"#),
            Err(PumpError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::build_json("set_diameter", r#"{"diameter": 60}"#),
            Err(PumpError::InvalidArgument { .. })
        ));
        assert!(matches!(
            Command::build_json("set_diameter", r#"{"diameter": 10, "colour": "red"}"#),
            Err(PumpError::InvalidArgument { ref name, .. }) if name == "colour"
        ));
        assert!(matches!(
            Command::build_json("warp", "{}"),
            Err(PumpError::UnknownCommand(_))
        ));
    }

    #[test]
    fn choices_accept_aliases_and_codes() {
        let by_name = Command::build_json("set_direction", r#"{"direction": "withdraw"}"#).unwrap();
        let by_code = Command::build_json("set_direction", r#"{"direction": "WDR"}"#).unwrap();
        assert_eq!(by_name, by_code);
        assert_eq!(by_name.wire_args(), ["WDR"]);

        let unit = Command::build_json("set_volume_unit", r#"{"unit": "cc"}"#).unwrap();
        assert_eq!(unit.wire_args(), ["ML"]);
        assert_eq!(Command::set_volume_unit(VolumeUnit::Microliters).unwrap().wire_args(), ["UL"]);
    }

    #[test]
    fn function_data_ranges() {
        let jump = Command::set_function(PhaseFunction::Jump(3)).unwrap();
        assert_eq!(jump.wire_args(), ["JMP", "3"]);
        assert!(Command::set_function(PhaseFunction::Jump(0)).is_err());
        assert!(Command::set_function(PhaseFunction::Output(2)).is_err());
        assert!(Command::build_json("set_function", r#"{"function": "rate", "data": 1}"#).is_err());
        assert!(Command::build_json("set_function", r#"{"function": "jump"}"#).is_err());
        assert!(Command::build_json("set_function", r#"{"function": "pause"}"#).is_ok());
    }

    #[test]
    fn flags_and_pins() {
        let beep = Command::set_flag("key_beep", true).unwrap();
        assert_eq!(encode(resolve(0).unwrap(), &beep).bytes, b"00BP1\r");
        assert!(Command::build_json("set_key_beep", r#"{"enabled": 2}"#).is_err());

        let out = Command::ttl_output(1).unwrap();
        assert_eq!(encode(resolve(0).unwrap(), &out).bytes, b"00OUT51\r");
        assert!(Command::ttl_input(5).is_err());
        assert!(Command::ttl_input(6).is_ok());
    }

    #[test]
    fn alarm_always_fails_even_with_value() {
        let command = Command::get("diameter").unwrap();
        let err = exchange(&command, b"\x0200A?S14.43\x03").unwrap_err();
        assert!(matches!(
            err,
            PumpError::PumpAlarm {
                alarm: AlarmKind::Stalled,
                ..
            }
        ));

        let err = exchange(&Command::start(), b"\x0200A?R\x03").unwrap_err();
        assert!(matches!(err, PumpError::PumpAlarm { alarm: AlarmKind::Reset, .. }));
    }

    #[test]
    fn rejection_surfaces_error_code() {
        let err = exchange(&Command::start(), b"\x0200S?OOR\x03").unwrap_err();
        assert!(matches!(
            err,
            PumpError::CommandRejected {
                code: ErrorCode::OutOfRange,
                ..
            }
        ));
    }

    #[test]
    fn typed_replies() {
        let rate = exchange(&Command::get("rate").unwrap(), b"\x0200S250.0UM\x03")
            .and_then(Reply::into_rate)
            .unwrap();
        assert_eq!(rate, Rate::new(250.0, VolumeUnit::Microliters, TimeUnit::PerMinute));

        let mode = exchange(&Command::get("com_mode").unwrap(), b"\x0200S20\x03")
            .and_then(Reply::into_com_mode)
            .unwrap();
        assert_eq!(mode, ComMode::Safe { timeout_s: 20 });

        let phase = exchange(&Command::get("phase").unwrap(), b"\x0200S03\x03")
            .and_then(Reply::into_integer)
            .unwrap();
        assert_eq!(phase, 3);

        let status = exchange(&Command::status(), b"\x0200I\x03")
            .and_then(Reply::into_status)
            .unwrap();
        assert_eq!(status, Status::Prompt(Prompt::Infusing));

        let done = exchange(&Command::start(), b"\x0200I\x03").unwrap();
        assert_eq!(done, Reply::Done);
    }

    #[test]
    fn getter_without_data_is_malformed() {
        let err = exchange(&Command::get("diameter").unwrap(), b"\x0200S\x03").unwrap_err();
        assert!(matches!(err, PumpError::MalformedFrame(_)));
    }
}
