//! Typed caller API over one open line.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};

use crate::address::PumpAddress;
use crate::command::catalogue::lookup_mnemonic;
use crate::command::{
    interpret, ComMode, Command, Direction, Dispensed, PhaseFunction, Rate, Reply, Trigger,
    Volume, VolumeUnit,
};
use crate::error::{PumpError, Result};
use crate::frame::{
    decode, encode, parse_request, ErrorCode, Frame, Prompt, Response, Shape, Status,
};
use crate::program::{CancelToken, Program, ProgramResult, Sequencer};
use crate::transport::{Line, Session};

/// Request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

/// How many times `stop` re-sends STP while the pump stays paused.
const MAX_STOP_ATTEMPTS: usize = 3;

/// The pumps on one shared line.
///
/// Every call is one synchronous request/response exchange; calls from
/// several threads queue on the session.
pub struct PumpBus<L: Line> {
    session: Session<L>,
    timeout: Duration,
    known: Mutex<Vec<PumpAddress>>,
}

impl<L: Line> PumpBus<L> {
    pub fn new(line: L) -> Self {
        PumpBus::with_timeout(line, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(line: L, timeout: Duration) -> Self {
        PumpBus {
            session: Session::new(line),
            timeout,
            known: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Session<L> {
        &self.session
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replaces a failed line.
    pub fn reopen(&self, line: L) {
        self.session.reopen(line);
    }

    /// Sends `command` to `address` and interprets the reply.
    pub fn execute(&self, address: PumpAddress, command: &Command) -> Result<Reply> {
        let frame = encode(address, command);
        let response = self.exchange(&frame)?;
        interpret(command, &response)
    }

    /// Sends a request line typed by hand, such as `01RAT`, without
    /// validating it against the command set.
    pub fn send_raw(&self, request: &str) -> Result<Response> {
        let mut bytes = request.trim_end().as_bytes().to_vec();
        bytes.push(b'\r');
        let parsed = parse_request(&bytes)?;
        let frame = Frame {
            address: parsed.address,
            mnemonic: lookup_mnemonic(&parsed.body).map_or("", |spec| spec.mnemonic),
            expects: Shape::Text,
            bytes,
        };
        self.exchange(&frame)
    }

    fn exchange(&self, frame: &Frame) -> Result<Response> {
        let raw = self.session.send_receive(frame, self.timeout)?;
        let response = decode(&raw, frame)?;
        self.session
            .record_status(response.address, response.status.clone());
        Ok(response)
    }

    pub fn firmware_version(&self, address: PumpAddress) -> Result<String> {
        self.execute(address, &Command::firmware_version())?
            .into_text()
    }

    pub fn status(&self, address: PumpAddress) -> Result<Status> {
        self.execute(address, &Command::status())?.into_status()
    }

    /// Current prompt; an unknown status is an error here.
    pub fn prompt(&self, address: PumpAddress) -> Result<Prompt> {
        self.status(address)?.require_prompt(address)
    }

    pub fn diameter(&self, address: PumpAddress) -> Result<f64> {
        self.execute(address, &Command::get("diameter")?)?
            .into_number()
    }

    pub fn set_diameter(&self, address: PumpAddress, mm: f64) -> Result<()> {
        self.execute(address, &Command::set_diameter(mm)?)
            .map(drop)
    }

    pub fn rate(&self, address: PumpAddress) -> Result<Rate> {
        self.execute(address, &Command::get("rate")?)?.into_rate()
    }

    pub fn set_rate(&self, address: PumpAddress, rate: Rate) -> Result<()> {
        self.execute(address, &Command::set_rate(rate)?).map(drop)
    }

    pub fn volume(&self, address: PumpAddress) -> Result<Volume> {
        self.execute(address, &Command::get("volume")?)?
            .into_volume()
    }

    pub fn set_volume(&self, address: PumpAddress, value: f64) -> Result<()> {
        self.execute(address, &Command::set_volume(value)?)
            .map(drop)
    }

    pub fn set_volume_unit(&self, address: PumpAddress, unit: VolumeUnit) -> Result<()> {
        self.execute(address, &Command::set_volume_unit(unit)?)
            .map(drop)
    }

    pub fn direction(&self, address: PumpAddress) -> Result<Direction> {
        self.execute(address, &Command::get("direction")?)?
            .into_direction()
    }

    pub fn set_direction(&self, address: PumpAddress, direction: Direction) -> Result<()> {
        self.execute(address, &Command::set_direction(direction)?)
            .map(drop)
    }

    pub fn phase(&self, address: PumpAddress) -> Result<u8> {
        let phase = self
            .execute(address, &Command::get("phase")?)?
            .into_integer()?;
        u8::try_from(phase).map_err(|_| PumpError::malformed(format!("phase {phase} out of range")))
    }

    pub fn set_phase(&self, address: PumpAddress, phase: u8) -> Result<()> {
        self.execute(address, &Command::set_phase(phase)?)
            .map(drop)
    }

    /// Function of the currently selected phase.
    pub fn function(&self, address: PumpAddress) -> Result<PhaseFunction> {
        self.execute(address, &Command::get("function")?)?
            .into_function()
    }

    pub fn set_function(&self, address: PumpAddress, function: PhaseFunction) -> Result<()> {
        self.execute(address, &Command::set_function(function)?)
            .map(drop)
    }

    pub fn com_mode(&self, address: PumpAddress) -> Result<ComMode> {
        self.execute(address, &Command::get("com_mode")?)?
            .into_com_mode()
    }

    pub fn set_com_mode(&self, address: PumpAddress, mode: ComMode) -> Result<()> {
        self.execute(address, &Command::set_com_mode(mode)?)
            .map(drop)
    }

    pub fn trigger(&self, address: PumpAddress) -> Result<Trigger> {
        self.execute(address, &Command::get("trigger")?)?
            .into_trigger()
    }

    pub fn set_trigger(&self, address: PumpAddress, trigger: Trigger) -> Result<()> {
        self.execute(address, &Command::set_trigger(trigger)?)
            .map(drop)
    }

    /// Reads an on/off setting: `alarm_buzzer`, `power_fail`, `key_beep`
    /// or `buzzer`.
    pub fn flag(&self, address: PumpAddress, parameter: &str) -> Result<bool> {
        self.execute(address, &Command::get(parameter)?)?
            .into_flag()
    }

    /// Writes `alarm_buzzer`, `power_fail` or `key_beep`.
    pub fn set_flag(&self, address: PumpAddress, parameter: &str, enabled: bool) -> Result<()> {
        self.execute(address, &Command::set_flag(parameter, enabled)?)
            .map(drop)
    }

    /// Turns the buzzer on or off, optionally beeping `count` times.
    pub fn set_buzzer(&self, address: PumpAddress, on: bool, count: Option<u8>) -> Result<()> {
        self.execute(address, &Command::set_buzzer(on, count)?)
            .map(drop)
    }

    pub fn dispensed(&self, address: PumpAddress) -> Result<Dispensed> {
        self.execute(address, &Command::dispensed())?
            .into_dispensed()
    }

    pub fn clear_dispensed(&self, address: PumpAddress, direction: Direction) -> Result<()> {
        self.execute(address, &Command::clear_dispensed(direction)?)
            .map(drop)
    }

    pub fn set_ttl_output(&self, address: PumpAddress, high: bool) -> Result<()> {
        self.execute(address, &Command::ttl_output(u8::from(high))?)
            .map(drop)
    }

    pub fn ttl_input(&self, address: PumpAddress, pin: u8) -> Result<bool> {
        self.execute(address, &Command::ttl_input(pin)?)?
            .into_flag()
    }

    /// Starts the pumping program.
    pub fn start(&self, address: PumpAddress) -> Result<()> {
        self.execute(address, &Command::start()).map(drop)
    }

    /// Pauses a running program. Resume with [`PumpBus::start`].
    ///
    /// Fails with [`ErrorCode::NotApplicable`] when the pump does not report
    /// paused afterwards, e.g. because nothing was running.
    pub fn pause(&self, address: PumpAddress) -> Result<()> {
        self.execute(address, &Command::pause())?;
        match self.session.last_status(address) {
            Some(Status::Prompt(Prompt::Paused)) => Ok(()),
            other => {
                debug!("pump {address} answered pause with {other:?}");
                Err(PumpError::CommandRejected {
                    address,
                    code: ErrorCode::NotApplicable,
                })
            }
        }
    }

    /// Stops the program. A running pump only pauses on the first STP, so
    /// the request is repeated until the pump reports stopped.
    pub fn stop(&self, address: PumpAddress) -> Result<()> {
        for _ in 0..MAX_STOP_ATTEMPTS {
            self.execute(address, &Command::stop())?;
            match self.session.last_status(address) {
                Some(Status::Prompt(Prompt::Paused)) => {
                    debug!("pump {address} paused, sending STP again");
                }
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    /// Probes every address in `range` with a status request and remembers
    /// the ones that answer. A pump raising an alarm still counts as present.
    pub fn scan(
        &self,
        range: impl IntoIterator<Item = PumpAddress>,
    ) -> Result<Vec<PumpAddress>> {
        let mut found = Vec::new();
        for address in range {
            match self.status(address) {
                Ok(_) | Err(PumpError::PumpAlarm { .. }) | Err(PumpError::CommandRejected { .. }) => {
                    info!("found pump at address {address}");
                    found.push(address);
                }
                Err(PumpError::Timeout(_)) | Err(PumpError::MalformedFrame(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.set_known(found.clone());
        Ok(found)
    }

    /// Addresses that `all` targets expand to.
    pub fn known_pumps(&self) -> Vec<PumpAddress> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_known(&self, addresses: Vec<PumpAddress>) {
        *self.known.lock().unwrap_or_else(PoisonError::into_inner) = addresses;
    }

    /// Runs `program` fail-fast against the known pumps.
    pub fn run_program(&self, program: &Program) -> ProgramResult {
        self.run_program_with_cancel(program, &CancelToken::new())
    }

    pub fn run_program_with_cancel(&self, program: &Program, cancel: &CancelToken) -> ProgramResult {
        Sequencer::new(self, self.known_pumps())
            .with_cancel(cancel.clone())
            .run(program)
    }

    /// Closes the bus and hands back the line.
    pub fn close(self) -> L {
        self.session.close()
    }
}
