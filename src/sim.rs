//! # Simulated pump bus
//!
//! Software stand-in for a line of syringe pumps. Each simulated pump keeps
//! the state a real one would (diameter, rate, volume, direction, program
//! phases, ...) and answers requests with byte-identical replies, so the
//! engine can be exercised without hardware.
//!
//! [`SimulatedBus`] implements [`Line`]. Clones share the same pumps, which
//! lets a test hand one clone to a session and inspect traffic through
//! another.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::command::values::format_quantity;
use crate::command::{Direction, PhaseFunction, Trigger, VolumeUnit};
use crate::frame::{parse_request, AlarmKind, Prompt, CR, ETX, STX};
use crate::transport::Line;

/// How long a read of an empty bus blocks, like a serial port read timeout.
const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Number of program phases a pump stores.
pub const PHASES: usize = 41;

// Pump-side failures, sent back after a `?`.
#[derive(Debug, PartialEq)]
enum Rejection {
    NotRecognized,
    NotApplicable,
    OutOfRange,
}

impl Rejection {
    fn code(&self) -> &'static str {
        match self {
            Rejection::NotRecognized => "",
            Rejection::NotApplicable => "NA",
            Rejection::OutOfRange => "OOR",
        }
    }
}

// Parsed request body. `None` arguments are queries.
#[derive(Debug, PartialEq)]
enum SimCommand {
    Status,
    Version,
    Run,
    Stop,
    Diameter(Option<f64>),
    Rate(Option<(f64, Option<(char, char)>)>),
    Volume(Option<f64>),
    VolumeUnit(VolumeUnit),
    Direction(Option<Direction>),
    Phase(Option<usize>),
    Function(Option<PhaseFunction>),
    SafeMode(Option<u8>),
    AlarmBuzzer(Option<bool>),
    PowerFail(Option<bool>),
    Trigger(Option<Trigger>),
    KeyBeep(Option<bool>),
    Buzzer(Option<bool>),
    Dispensed,
    ClearDispensed(Direction),
    Output(bool),
    Input(u8),
}

/// State of one simulated pump.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPump {
    pub firmware: String,
    pub prompt: Prompt,
    /// Alarm reported (once) in the next reply.
    pub pending_alarm: Option<AlarmKind>,
    pub diameter: f64,
    pub rate: f64,
    pub rate_units: (VolumeUnit, char),
    pub volume: f64,
    pub volume_unit: VolumeUnit,
    pub direction: Direction,
    /// Phase currently selected for editing, 1-based.
    pub phase: usize,
    pub functions: [PhaseFunction; PHASES],
    pub safe_timeout: u8,
    pub alarm_buzzer: bool,
    pub power_fail: bool,
    pub key_beep: bool,
    pub buzzer: bool,
    pub trigger: Trigger,
    pub infused: f64,
    pub withdrawn: f64,
    pub ttl_output: bool,
    pub ttl_inputs: [bool; 7],
    /// Requests a started program keeps running for before it stops.
    pub run_length: u32,
    remaining: u32,
}

impl Default for SimulatedPump {
    fn default() -> Self {
        SimulatedPump {
            firmware: String::from("NE1000V3.934"),
            prompt: Prompt::Stopped,
            pending_alarm: None,
            diameter: 26.59,
            rate: 0.0,
            rate_units: (VolumeUnit::Milliliters, 'H'),
            volume: 0.0,
            volume_unit: VolumeUnit::Milliliters,
            direction: Direction::Infuse,
            phase: 1,
            functions: [PhaseFunction::Rate; PHASES],
            safe_timeout: 0,
            alarm_buzzer: false,
            power_fail: false,
            key_beep: true,
            buzzer: false,
            trigger: Trigger::FootSwitch,
            infused: 0.0,
            withdrawn: 0.0,
            ttl_output: false,
            ttl_inputs: [false; 7],
            run_length: 3,
            remaining: 0,
        }
    }
}

impl SimulatedPump {
    /// Processes a request body (address already stripped) and returns the
    /// status field plus data of the reply.
    pub fn process_command(&mut self, body: &str) -> String {
        self.advance();
        let data = match self.parse_command(body) {
            Ok(command) => match self.execute_command(command) {
                Ok(data) => data,
                Err(rejection) => format!("?{}", rejection.code()),
            },
            Err(rejection) => format!("?{}", rejection.code()),
        };
        let status = match self.pending_alarm.take() {
            Some(alarm) => format!("A?{}", alarm.as_char()),
            None => self.prompt.as_char().to_string(),
        };
        status + &data
    }

    /// Moves a running program one step closer to its end.
    fn advance(&mut self) {
        if !self.prompt.is_running() {
            return;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            match self.direction {
                Direction::Withdraw => self.withdrawn += self.volume,
                _ => self.infused += self.volume,
            }
            self.prompt = Prompt::Stopped;
        }
    }

    fn parse_command(&self, body: &str) -> Result<SimCommand, Rejection> {
        const MNEMONICS: [&str; 19] = [
            "VER", "RUN", "STP", "DIA", "RAT", "VOL", "DIR", "PHN", "FUN", "SAF", "AL", "PF",
            "TRG", "BP", "BUZ", "DIS", "CLD", "OUT", "IN",
        ];
        if body.is_empty() {
            return Ok(SimCommand::Status);
        }
        let mnemonic = MNEMONICS
            .iter()
            .find(|m| body.starts_with(*m))
            .ok_or(Rejection::NotRecognized)?;
        let arg = &body[mnemonic.len()..];
        let query = arg.is_empty();

        let command = match *mnemonic {
            "VER" if query => SimCommand::Version,
            "RUN" if query => SimCommand::Run,
            "STP" if query => SimCommand::Stop,
            "DIS" if query => SimCommand::Dispensed,
            "DIA" => SimCommand::Diameter(optional(arg, number)?),
            "RAT" => SimCommand::Rate(optional(arg, parse_rate)?),
            "VOL" => match arg {
                "UL" => SimCommand::VolumeUnit(VolumeUnit::Microliters),
                "ML" => SimCommand::VolumeUnit(VolumeUnit::Milliliters),
                _ => SimCommand::Volume(optional(arg, number)?),
            },
            "DIR" => SimCommand::Direction(optional(arg, direction)?),
            "PHN" => SimCommand::Phase(optional(arg, |a| integer(a).map(|n| n as usize))?),
            "FUN" => SimCommand::Function(optional(arg, function)?),
            "SAF" => SimCommand::SafeMode(optional(arg, |a| {
                u8::try_from(integer(a)?).map_err(|_| Rejection::OutOfRange)
            })?),
            "AL" => SimCommand::AlarmBuzzer(optional(arg, flag)?),
            "PF" => SimCommand::PowerFail(optional(arg, flag)?),
            "BP" => SimCommand::KeyBeep(optional(arg, flag)?),
            "BUZ" => SimCommand::Buzzer(optional(arg, |a| {
                flag(a.get(..1).ok_or(Rejection::OutOfRange)?)
            })?),
            "TRG" => SimCommand::Trigger(optional(arg, trigger)?),
            "CLD" => match direction(arg)? {
                Direction::Reverse => return Err(Rejection::OutOfRange),
                d => SimCommand::ClearDispensed(d),
            },
            "OUT" => match arg.strip_prefix('5') {
                Some(level) => SimCommand::Output(flag(level)?),
                None => return Err(Rejection::OutOfRange),
            },
            "IN" => SimCommand::Input(u8::try_from(integer(arg)?).map_err(|_| Rejection::OutOfRange)?),
            _ => return Err(Rejection::NotRecognized),
        };
        Ok(command)
    }

    fn execute_command(&mut self, command: SimCommand) -> Result<String, Rejection> {
        let running = self.prompt.is_running();
        let reply = match command {
            SimCommand::Status => String::new(),
            SimCommand::Version => self.firmware.clone(),
            SimCommand::Run => {
                if running {
                    return Err(Rejection::NotApplicable);
                }
                self.prompt = match self.direction {
                    Direction::Withdraw => Prompt::Withdrawing,
                    _ => Prompt::Infusing,
                };
                self.remaining = self.run_length.max(1);
                String::new()
            }
            SimCommand::Stop => {
                self.prompt = if running {
                    Prompt::Paused
                } else {
                    Prompt::Stopped
                };
                String::new()
            }
            SimCommand::Diameter(None) => quantity(self.diameter),
            SimCommand::Diameter(Some(mm)) => {
                if running {
                    return Err(Rejection::NotApplicable);
                }
                if !(0.1..=50.0).contains(&mm) {
                    return Err(Rejection::OutOfRange);
                }
                self.diameter = mm;
                String::new()
            }
            SimCommand::Rate(None) => format!(
                "{}{}{}",
                quantity(self.rate),
                self.rate_units.0.code(),
                self.rate_units.1
            ),
            SimCommand::Rate(Some((value, units))) => {
                if value <= 0.0 {
                    return Err(Rejection::OutOfRange);
                }
                self.rate = value;
                if let Some((volume, time)) = units {
                    let volume = VolumeUnit::from_code(volume).ok_or(Rejection::OutOfRange)?;
                    self.rate_units = (volume, time);
                }
                String::new()
            }
            SimCommand::Volume(None) => {
                format!("{}{}L", quantity(self.volume), self.volume_unit.code())
            }
            SimCommand::Volume(Some(value)) => {
                self.volume = value;
                String::new()
            }
            SimCommand::VolumeUnit(unit) => {
                self.volume_unit = unit;
                String::new()
            }
            SimCommand::Direction(None) => self.direction.code().to_string(),
            SimCommand::Direction(Some(Direction::Reverse)) => {
                self.direction = match self.direction {
                    Direction::Withdraw => Direction::Infuse,
                    _ => Direction::Withdraw,
                };
                String::new()
            }
            SimCommand::Direction(Some(d)) => {
                self.direction = d;
                String::new()
            }
            SimCommand::Phase(None) => format!("{:02}", self.phase),
            SimCommand::Phase(Some(n)) => {
                if !(1..=PHASES).contains(&n) {
                    return Err(Rejection::OutOfRange);
                }
                self.phase = n;
                String::new()
            }
            SimCommand::Function(None) => {
                let f = self.functions[self.phase - 1];
                match f.data() {
                    Some(n) => format!("{}{n:02}", f.code()),
                    None => f.code().to_string(),
                }
            }
            SimCommand::Function(Some(f)) => {
                if running {
                    return Err(Rejection::NotApplicable);
                }
                self.functions[self.phase - 1] = f;
                String::new()
            }
            SimCommand::SafeMode(None) => self.safe_timeout.to_string(),
            SimCommand::SafeMode(Some(t)) => {
                self.safe_timeout = t;
                String::new()
            }
            SimCommand::AlarmBuzzer(v) => toggle(&mut self.alarm_buzzer, v),
            SimCommand::PowerFail(v) => toggle(&mut self.power_fail, v),
            SimCommand::KeyBeep(v) => toggle(&mut self.key_beep, v),
            SimCommand::Buzzer(v) => toggle(&mut self.buzzer, v),
            SimCommand::Trigger(None) => self.trigger.code().to_string(),
            SimCommand::Trigger(Some(t)) => {
                self.trigger = t;
                String::new()
            }
            SimCommand::Dispensed => format!(
                "I{}W{}{}L",
                quantity(self.infused),
                quantity(self.withdrawn),
                self.volume_unit.code()
            ),
            SimCommand::ClearDispensed(Direction::Withdraw) => {
                self.withdrawn = 0.0;
                String::new()
            }
            SimCommand::ClearDispensed(_) => {
                self.infused = 0.0;
                String::new()
            }
            SimCommand::Output(level) => {
                self.ttl_output = level;
                String::new()
            }
            SimCommand::Input(pin) => match pin {
                2 | 3 | 4 | 6 => u8::from(self.ttl_inputs[pin as usize]).to_string(),
                _ => return Err(Rejection::OutOfRange),
            },
        };
        Ok(reply)
    }
}

fn optional<T>(
    arg: &str,
    parse: impl Fn(&str) -> Result<T, Rejection>,
) -> Result<Option<T>, Rejection> {
    if arg.is_empty() {
        Ok(None)
    } else {
        parse(arg).map(Some)
    }
}

fn number(arg: &str) -> Result<f64, Rejection> {
    arg.parse().map_err(|_| Rejection::OutOfRange)
}

fn integer(arg: &str) -> Result<i64, Rejection> {
    arg.parse().map_err(|_| Rejection::OutOfRange)
}

fn flag(arg: &str) -> Result<bool, Rejection> {
    match arg {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(Rejection::OutOfRange),
    }
}

fn parse_rate(arg: &str) -> Result<(f64, Option<(char, char)>), Rejection> {
    let digits = arg.trim_end_matches(|c: char| c.is_ascii_alphabetic());
    let units: Vec<char> = arg[digits.len()..].chars().collect();
    let units = match units.as_slice() {
        [] => None,
        [v, t @ ('M' | 'H')] => Some((*v, *t)),
        _ => return Err(Rejection::OutOfRange),
    };
    Ok((number(digits)?, units))
}

fn direction(arg: &str) -> Result<Direction, Rejection> {
    match arg {
        "INF" => Ok(Direction::Infuse),
        "WDR" => Ok(Direction::Withdraw),
        "REV" => Ok(Direction::Reverse),
        _ => Err(Rejection::OutOfRange),
    }
}

fn trigger(arg: &str) -> Result<Trigger, Rejection> {
    match arg {
        "FT" => Ok(Trigger::FootSwitch),
        "LE" => Ok(Trigger::LevelControl),
        "ST" => Ok(Trigger::StartOnly),
        _ => Err(Rejection::OutOfRange),
    }
}

fn function(arg: &str) -> Result<PhaseFunction, Rejection> {
    let split = arg
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(arg.len());
    let (code, data) = arg.split_at(split);
    let data = optional(data, |d| u8::try_from(integer(d)?).map_err(|_| Rejection::OutOfRange))?;
    match PhaseFunction::data_range(code) {
        Some((min, max)) if data.map_or(false, |n| i64::from(n) < min || i64::from(n) > max) => {
            Err(Rejection::OutOfRange)
        }
        _ => PhaseFunction::from_parts(code, data).ok_or(Rejection::OutOfRange),
    }
}

fn toggle(field: &mut bool, value: Option<bool>) -> String {
    match value {
        Some(v) => {
            *field = v;
            String::new()
        }
        None => u8::from(*field).to_string(),
    }
}

fn quantity(value: f64) -> String {
    format_quantity(value).unwrap_or_else(|| String::from("9999"))
}

#[derive(Debug, Default)]
struct BusState {
    pumps: BTreeMap<u8, SimulatedPump>,
    inbox: Vec<u8>,
    outbox: VecDeque<u8>,
    requests: Vec<String>,
    truncate_next: bool,
    fail_io: bool,
}

impl BusState {
    // Handles one complete request line. Requests that do not parse or that
    // address a pump not on the bus get no reply.
    fn handle(&mut self, raw: &[u8]) {
        let mut frame = raw.to_vec();
        frame.push(CR);
        let request = match parse_request(&frame) {
            Ok(request) => request,
            Err(_) => return,
        };
        self.requests
            .push(String::from_utf8_lossy(raw).into_owned());
        let index = request.address.get();
        let Some(pump) = self.pumps.get_mut(&index) else {
            return;
        };
        let reply = pump.process_command(&request.body);

        let mut bytes = vec![STX];
        bytes.extend_from_slice(format!("{index:02}{reply}").as_bytes());
        bytes.push(ETX);
        if self.truncate_next {
            self.truncate_next = false;
            bytes.truncate(bytes.len() - 1);
        }
        self.outbox.extend(bytes);
    }
}

/// A bus of simulated pumps, usable wherever a serial line is.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// A bus with default pumps at the given addresses.
    pub fn with_pumps(addresses: &[u8]) -> Self {
        let bus = SimulatedBus::default();
        {
            let mut state = bus.lock();
            for &address in addresses {
                state.pumps.insert(address, SimulatedPump::default());
            }
        }
        bus
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes the state of the pump at `address`, if present.
    pub fn configure(&self, address: u8, f: impl FnOnce(&mut SimulatedPump)) {
        if let Some(pump) = self.lock().pumps.get_mut(&address) {
            f(pump);
        }
    }

    /// Snapshot of the pump at `address`.
    pub fn pump(&self, address: u8) -> Option<SimulatedPump> {
        self.lock().pumps.get(&address).cloned()
    }

    /// Makes the pump report `alarm` in its next reply.
    pub fn raise_alarm(&self, address: u8, alarm: AlarmKind) {
        self.configure(address, |pump| pump.pending_alarm = Some(alarm));
    }

    /// Drops the terminator of the next reply.
    pub fn truncate_next_reply(&self) {
        self.lock().truncate_next = true;
    }

    /// Makes every later read and write fail like an unplugged adapter.
    pub fn fail_io(&self) {
        self.lock().fail_io = true;
    }

    /// Every request seen so far, without terminators.
    pub fn requests(&self) -> Vec<String> {
        self.lock().requests.clone()
    }

    /// Reply bytes not yet read.
    pub fn pending_output(&self) -> usize {
        self.lock().outbox.len()
    }
}

fn unplugged() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "simulated line unplugged")
}

impl Write for SimulatedBus {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.fail_io {
            return Err(unplugged());
        }
        state.inbox.extend_from_slice(buf);
        while let Some(end) = state.inbox.iter().position(|&b| b == CR) {
            let line: Vec<u8> = state.inbox.drain(..=end).collect();
            let line = &line[..line.len() - 1];
            // Tolerate CRLF-terminated requests.
            let line = line.strip_prefix(b"\n").unwrap_or(line);
            state.handle(line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for SimulatedBus {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.lock();
            if state.fail_io {
                return Err(unplugged());
            }
            if !state.outbox.is_empty() {
                let n = buf.len().min(state.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        thread::sleep(READ_TIMEOUT);
        Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
    }
}

impl Line for SimulatedBus {
    fn discard_input(&mut self) -> io::Result<()> {
        self.lock().outbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(bus: &mut SimulatedBus, request: &str) -> Option<String> {
        bus.write_all(request.as_bytes()).unwrap();
        let mut buf = [0u8; 128];
        match bus.read(&mut buf) {
            Ok(n) => Some(String::from_utf8_lossy(&buf[..n]).into_owned()),
            Err(_) => None,
        }
    }

    // --- Tests for basic parsing and addressing ---

    #[test]
    fn status_query_returns_prompt() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200S\x03"));
    }

    #[test]
    fn ignore_command_for_other_address() {
        let mut bus = SimulatedBus::with_pumps(&[31]);
        assert_eq!(reply(&mut bus, "02VER\r"), None);
        assert_eq!(bus.requests(), vec!["02VER"]);
        assert!(reply(&mut bus, "31VER\r").is_some());
    }

    #[test]
    fn ignore_garbage_without_address() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        assert_eq!(reply(&mut bus, "VER\r"), None);
        assert!(bus.requests().is_empty());
    }

    #[test]
    fn accepts_crlf_and_unpadded_addresses() {
        let mut bus = SimulatedBus::with_pumps(&[3]);
        assert_eq!(
            reply(&mut bus, "3VER\r\n").as_deref(),
            Some("\x0203SNE1000V3.934\x03")
        );
        assert_eq!(reply(&mut bus, "03DIA\r").as_deref(), Some("\x0203S26.59\x03"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        assert_eq!(reply(&mut bus, "00XYZ\r").as_deref(), Some("\x0200S?\x03"));
        assert_eq!(reply(&mut bus, "00DIA99\r").as_deref(), Some("\x0200S?OOR\x03"));
    }

    // --- Tests for specific command logic ---

    #[test]
    fn set_and_query_rate() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        assert_eq!(reply(&mut bus, "00RAT14.5UM\r").as_deref(), Some("\x0200S\x03"));
        assert_eq!(reply(&mut bus, "00RAT\r").as_deref(), Some("\x0200S14.5UM\x03"));
    }

    #[test]
    fn run_pause_stop_cycle() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        bus.configure(0, |p| p.run_length = 10);
        assert_eq!(reply(&mut bus, "00RUN\r").as_deref(), Some("\x0200I\x03"));
        assert_eq!(reply(&mut bus, "00RUN\r").as_deref(), Some("\x0200I?NA\x03"));
        assert_eq!(reply(&mut bus, "00STP\r").as_deref(), Some("\x0200P\x03"));
        assert_eq!(reply(&mut bus, "00STP\r").as_deref(), Some("\x0200S\x03"));
    }

    #[test]
    fn program_runs_to_completion() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        bus.configure(0, |p| {
            p.run_length = 2;
            p.volume = 1.5;
        });
        reply(&mut bus, "00RUN\r");
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200I\x03"));
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200S\x03"));
        assert_eq!(
            reply(&mut bus, "00DIS\r").as_deref(),
            Some("\x0200SI1.5W0ML\x03")
        );
    }

    #[test]
    fn phase_functions_are_stored_per_phase() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        reply(&mut bus, "00PHN2\r");
        reply(&mut bus, "00FUNPAS10\r");
        assert_eq!(reply(&mut bus, "00FUN\r").as_deref(), Some("\x0200SPAS10\x03"));
        assert_eq!(reply(&mut bus, "00FUNJMP50\r").as_deref(), Some("\x0200S?OOR\x03"));
        let pump = bus.pump(0).unwrap();
        assert_eq!(pump.functions[1], PhaseFunction::Pause(10));
        assert_eq!(pump.functions[0], PhaseFunction::Rate);
    }

    #[test]
    fn alarm_is_reported_once() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        bus.raise_alarm(0, AlarmKind::Stalled);
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200A?S\x03"));
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200S\x03"));
    }

    #[test]
    fn truncated_reply_has_no_terminator() {
        let mut bus = SimulatedBus::with_pumps(&[0]);
        bus.truncate_next_reply();
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200S"));
        assert_eq!(reply(&mut bus, "00\r").as_deref(), Some("\x0200S\x03"));
    }
}
