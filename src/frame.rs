//! Wire framing for the pump protocol.
//!
//! Requests are `AA<mnemonic><args>\r` with a two digit address. Pumps answer
//! `<STX>AA<status><data><ETX>`; some firmware drops STX/ETX and ends the
//! reply with `\r`, so both terminators are accepted on decode.

use std::fmt;

use serde::Deserialize;

use crate::address::{resolve, PumpAddress};
use crate::command::Command;
use crate::error::{PumpError, Result};

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const CR: u8 = b'\r';

/// Terminator appended to every request.
pub const REQUEST_TERMINATOR: u8 = CR;

/// True for any byte that ends a response frame.
pub fn is_terminator(byte: u8) -> bool {
    byte == ETX || byte == CR
}

/// Operational state a pump reports in its prompt character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    Infusing,
    Withdrawing,
    Stopped,
    Paused,
    /// Inside a timed pause phase of the pumping program.
    PausePhase,
    /// Waiting for an operational trigger.
    UserWait,
}

impl Prompt {
    pub fn from_char(c: char) -> Option<Prompt> {
        match c {
            'I' => Some(Prompt::Infusing),
            'W' => Some(Prompt::Withdrawing),
            'S' => Some(Prompt::Stopped),
            'P' => Some(Prompt::Paused),
            'T' => Some(Prompt::PausePhase),
            'U' => Some(Prompt::UserWait),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Prompt::Infusing => 'I',
            Prompt::Withdrawing => 'W',
            Prompt::Stopped => 'S',
            Prompt::Paused => 'P',
            Prompt::PausePhase => 'T',
            Prompt::UserWait => 'U',
        }
    }

    /// Whether the pumping program is currently moving the plunger or
    /// counting down a pause phase.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            Prompt::Infusing | Prompt::Withdrawing | Prompt::PausePhase | Prompt::UserWait
        )
    }
}

/// Alarm reported as `A?x`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmKind {
    /// Power was interrupted.
    Reset,
    Stalled,
    /// Safe-mode communications timed out.
    SafeModeTimeout,
    ProgramError,
    PhaseOutOfRange,
    Other(char),
}

impl AlarmKind {
    pub fn from_char(c: char) -> AlarmKind {
        match c {
            'R' => AlarmKind::Reset,
            'S' => AlarmKind::Stalled,
            'T' => AlarmKind::SafeModeTimeout,
            'E' => AlarmKind::ProgramError,
            'O' => AlarmKind::PhaseOutOfRange,
            other => AlarmKind::Other(other),
        }
    }

    pub fn as_char(self) -> char {
        match self {
            AlarmKind::Reset => 'R',
            AlarmKind::Stalled => 'S',
            AlarmKind::SafeModeTimeout => 'T',
            AlarmKind::ProgramError => 'E',
            AlarmKind::PhaseOutOfRange => 'O',
            AlarmKind::Other(c) => c,
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmKind::Reset => f.write_str("pump was reset (power was interrupted)"),
            AlarmKind::Stalled => f.write_str("pump motor stalled"),
            AlarmKind::SafeModeTimeout => f.write_str("safe mode communications time out"),
            AlarmKind::ProgramError => f.write_str("pumping program error"),
            AlarmKind::PhaseOutOfRange => f.write_str("pumping program phase is out of range"),
            AlarmKind::Other(c) => write!(f, "unrecognised alarm {c:?}"),
        }
    }
}

/// Pump-side rejection carried after a `?` in the data field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    NotRecognized,
    NotApplicable,
    OutOfRange,
    InvalidPacket,
    /// Ignored because a new phase started at the same time.
    Ignored,
    Other(String),
}

impl ErrorCode {
    pub fn parse(code: &str) -> ErrorCode {
        match code {
            "" => ErrorCode::NotRecognized,
            "NA" => ErrorCode::NotApplicable,
            "OOR" => ErrorCode::OutOfRange,
            "COM" => ErrorCode::InvalidPacket,
            "IGN" => ErrorCode::Ignored,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::NotRecognized => f.write_str("command is not recognized"),
            ErrorCode::NotApplicable => f.write_str("command is not currently applicable"),
            ErrorCode::OutOfRange => f.write_str("command data is out of range"),
            ErrorCode::InvalidPacket => f.write_str("invalid communications packet received"),
            ErrorCode::Ignored => {
                f.write_str("command ignored due to a simultaneous new phase start")
            }
            ErrorCode::Other(code) => write!(f, "unrecognised error code {code:?}"),
        }
    }
}

/// Status field of a decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Prompt(Prompt),
    Alarm(AlarmKind),
    /// Status character outside the known set, kept verbatim.
    Unknown(String),
}

impl Status {
    /// The prompt, or the reason there is none.
    pub fn require_prompt(&self, address: PumpAddress) -> Result<Prompt> {
        match self {
            Status::Prompt(p) => Ok(*p),
            Status::Alarm(alarm) => Err(PumpError::PumpAlarm {
                address,
                alarm: *alarm,
            }),
            Status::Unknown(raw) => Err(PumpError::UnknownStatus { raw: raw.clone() }),
        }
    }
}

/// What the data field of a reply must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    None,
    Numeric,
    Text,
}

/// Returned data after shape validation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_text(&self) -> String {
        match self {
            Value::Number(n) => n.to_string(),
            Value::Text(t) => t.clone(),
        }
    }
}

/// One decoded reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub address: PumpAddress,
    pub status: Status,
    pub value: Option<Value>,
    /// Pump-side rejection, if the data field started with `?`.
    pub error: Option<ErrorCode>,
}

/// An encoded request, remembering what the reply should look like.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub address: PumpAddress,
    pub mnemonic: &'static str,
    pub expects: Shape,
    pub bytes: Vec<u8>,
}

/// Builds the wire frame for `command` aimed at `address`.
pub fn encode(address: PumpAddress, command: &Command) -> Frame {
    let mut text = format!("{address}{}", command.mnemonic());
    for arg in command.wire_args() {
        text.push_str(arg);
    }
    let mut bytes = text.into_bytes();
    bytes.push(REQUEST_TERMINATOR);
    Frame {
        address,
        mnemonic: command.mnemonic(),
        expects: command.reply_shape(),
        bytes,
    }
}

/// Address and body of a request as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub address: PumpAddress,
    pub body: String,
}

/// Splits a request frame back into address and body. Used by bus monitors
/// and simulated pumps.
pub fn parse_request(raw: &[u8]) -> Result<Request> {
    let end = raw
        .iter()
        .position(|&b| b == REQUEST_TERMINATOR)
        .ok_or_else(|| PumpError::malformed("request has no terminator"))?;
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|_| PumpError::malformed("request is not ASCII"))?;
    let digits = text.bytes().take_while(u8::is_ascii_digit).count().min(2);
    if digits == 0 {
        return Err(PumpError::malformed("request has no address"));
    }
    let index: i64 = text[..digits]
        .parse()
        .map_err(|_| PumpError::malformed("request address is not decimal"))?;
    Ok(Request {
        address: resolve(index)?,
        body: text[digits..].to_string(),
    })
}

/// Decodes a raw reply to `request`.
pub fn decode(raw: &[u8], request: &Frame) -> Result<Response> {
    let raw = raw.strip_prefix(&[STX]).unwrap_or(raw);
    let end = raw
        .iter()
        .position(|&b| is_terminator(b))
        .ok_or_else(|| PumpError::malformed("missing terminator"))?;
    let text = std::str::from_utf8(&raw[..end])
        .map_err(|_| PumpError::malformed("reply is not ASCII"))?;

    if text.len() < 3 || !text.is_char_boundary(2) {
        return Err(PumpError::malformed(format!("reply {text:?} is too short")));
    }
    let (echo, rest) = text.split_at(2);
    if !echo.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PumpError::malformed(format!(
            "address echo {echo:?} is not decimal"
        )));
    }
    let echoed: u8 = echo
        .parse()
        .map_err(|_| PumpError::malformed(format!("address echo {echo:?} is not decimal")))?;
    if echoed != request.address.get() {
        return Err(PumpError::malformed(format!(
            "address echo {echo} does not match request to {}",
            request.address
        )));
    }

    let mut chars = rest.chars();
    let first = chars.next().unwrap_or_default();
    let (status, data) = if let Some(prompt) = Prompt::from_char(first) {
        (Status::Prompt(prompt), chars.as_str())
    } else if first == 'A' && chars.as_str().starts_with('?') {
        let mut alarm = chars.as_str()[1..].chars();
        let kind = alarm
            .next()
            .ok_or_else(|| PumpError::malformed("alarm without a type"))?;
        (Status::Alarm(AlarmKind::from_char(kind)), alarm.as_str())
    } else if request.expects == Shape::Text {
        // Without a known status character the boundary is unknowable, so the
        // whole remainder is the payload.
        (Status::Unknown(first.to_string()), rest)
    } else {
        (Status::Unknown(first.to_string()), chars.as_str())
    };

    let mut response = Response {
        address: request.address,
        status,
        value: None,
        error: None,
    };

    if let Some(code) = data.strip_prefix('?') {
        response.error = Some(ErrorCode::parse(code));
        return Ok(response);
    }

    response.value = match (request.expects, data.is_empty()) {
        (_, true) => None,
        (Shape::None, false) => {
            return Err(PumpError::malformed(format!(
                "{} returned unexpected data {data:?}",
                request.mnemonic
            )))
        }
        (Shape::Numeric, false) => Some(Value::Number(data.parse().map_err(|_| {
            PumpError::malformed(format!("{data:?} is not a number"))
        })?)),
        (Shape::Text, false) => Some(Value::Text(data.to_string())),
    };
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;

    fn pump(index: i64) -> PumpAddress {
        resolve(index).unwrap()
    }

    #[test]
    fn encode_pads_address_and_terminates() {
        let frame = encode(pump(0), &Command::firmware_version());
        assert_eq!(frame.bytes, b"00VER\r");

        let frame = encode(pump(7), &Command::status());
        assert_eq!(frame.bytes, b"07\r");
    }

    #[test]
    fn request_round_trip_recovers_address_and_mnemonic() {
        let commands = [
            Command::firmware_version(),
            Command::start(),
            Command::build_json("set_rate", r#"{"value": 12.5, "volume_unit": "ml", "time_unit": "h"}"#)
                .unwrap(),
            Command::build_json("set_direction", r#"{"direction": "withdraw"}"#).unwrap(),
        ];
        for index in [0, 9, 10, 99] {
            for command in &commands {
                let frame = encode(pump(index), command);
                let request = parse_request(&frame.bytes).unwrap();
                assert_eq!(request.address, pump(index));
                assert!(request.body.starts_with(command.mnemonic()));
            }
        }
    }

    #[test]
    fn decode_firmware_version_without_status() {
        let request = encode(pump(0), &Command::firmware_version());
        let response = decode(b"00NE1000V3.934\r", &request).unwrap();
        assert_eq!(response.value, Some(Value::Text("NE1000V3.934".into())));
        assert_eq!(response.status, Status::Unknown("N".into()));
        assert_eq!(response.error, None);
    }

    #[test]
    fn decode_stx_etx_reply_with_prompt() {
        let request = encode(pump(1), &Command::firmware_version());
        let response = decode(b"\x0201SNE1000V3.934\x03", &request).unwrap();
        assert_eq!(response.status, Status::Prompt(Prompt::Stopped));
        assert_eq!(response.value, Some(Value::Text("NE1000V3.934".into())));
    }

    #[test]
    fn decode_alarm_keeps_trailing_value() {
        let request = encode(pump(2), &Command::get("diameter").unwrap());
        let response = decode(b"\x0202A?S14.43\x03", &request).unwrap();
        assert_eq!(response.status, Status::Alarm(AlarmKind::Stalled));
        assert_eq!(response.value, Some(Value::Number(14.43)));
    }

    #[test]
    fn decode_pump_rejection() {
        let request = encode(pump(0), &Command::start());
        let response = decode(b"\x0200S?NA\x03", &request).unwrap();
        assert_eq!(response.error, Some(ErrorCode::NotApplicable));

        let response = decode(b"\x0200S?\x03", &request).unwrap();
        assert_eq!(response.error, Some(ErrorCode::NotRecognized));
    }

    #[test]
    fn decode_rejects_missing_terminator() {
        let request = encode(pump(0), &Command::status());
        assert!(matches!(
            decode(b"\x0200S", &request),
            Err(PumpError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_wrong_address_echo() {
        let request = encode(pump(3), &Command::status());
        assert!(matches!(
            decode(b"\x0204S\x03", &request),
            Err(PumpError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_shape_mismatch() {
        let numeric = encode(pump(0), &Command::get("diameter").unwrap());
        assert!(matches!(
            decode(b"\x0200Sabc\x03", &numeric),
            Err(PumpError::MalformedFrame(_))
        ));

        let none = encode(pump(0), &Command::start());
        assert!(matches!(
            decode(b"\x0200I12\x03", &none),
            Err(PumpError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_status_before_a_number_is_soft() {
        let request = encode(pump(0), &Command::get("diameter").unwrap());
        let response = decode(b"00X14.43\r", &request).unwrap();
        assert_eq!(response.status, Status::Unknown("X".into()));
        assert_eq!(response.value, Some(Value::Number(14.43)));
    }

    #[test]
    fn decode_rejects_signed_address_echo() {
        let request = encode(pump(1), &Command::status());
        assert!(matches!(
            decode(b"+1S\r", &request),
            Err(PumpError::MalformedFrame(_))
        ));
    }

    #[test]
    fn unknown_status_is_soft() {
        let request = encode(pump(0), &Command::status());
        let response = decode(b"\x0200X\x03", &request).unwrap();
        assert_eq!(response.status, Status::Unknown("X".into()));
        assert!(matches!(
            response.status.require_prompt(pump(0)),
            Err(PumpError::UnknownStatus { raw }) if raw == "X"
        ));
    }
}
