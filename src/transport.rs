//! Transport session over the shared half-duplex line.
//!
//! One request/response exchange at a time: the bus mutex is held from the
//! first byte written until the terminator is read or the deadline passes.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, log_enabled, Level};
use serialport::{ClearBuffer, SerialPort};

use crate::address::PumpAddress;
use crate::error::{PumpError, Result};
use crate::frame::{is_terminator, Frame, Status};

/// Pause between polls of a line that returned no data.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// A byte channel to the pumps.
pub trait Line: Read + Write + Send {
    /// Drops any bytes already received but not yet read.
    fn discard_input(&mut self) -> io::Result<()>;
}

impl Line for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

impl Line for Box<dyn Line> {
    fn discard_input(&mut self) -> io::Result<()> {
        (**self).discard_input()
    }
}

struct Bus<L> {
    line: L,
    usable: bool,
}

/// An open line plus the last status seen from each pump.
pub struct Session<L: Line> {
    bus: Mutex<Bus<L>>,
    statuses: Mutex<HashMap<PumpAddress, Status>>,
}

impl<L: Line> Session<L> {
    pub fn new(line: L) -> Self {
        Session {
            bus: Mutex::new(Bus { line, usable: true }),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    fn lock_bus(&self) -> MutexGuard<'_, Bus<L>> {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes `frame` and reads until a terminator or `timeout`.
    ///
    /// Returns the reply up to and including the terminator.
    pub fn send_receive(&self, frame: &Frame, timeout: Duration) -> Result<Vec<u8>> {
        let mut bus = self.lock_bus();
        if !bus.usable {
            return Err(PumpError::TransportFailure(io::Error::new(
                io::ErrorKind::NotConnected,
                "session unusable after a transport failure; reopen it",
            )));
        }

        match exchange(&mut bus.line, &frame.bytes, timeout) {
            Err(PumpError::TransportFailure(e)) => {
                error!("transport failure talking to pump {}: {e}", frame.address);
                bus.usable = false;
                Err(PumpError::TransportFailure(e))
            }
            other => other,
        }
    }

    /// Replaces the line, making the session usable again.
    pub fn reopen(&self, line: L) {
        let mut bus = self.lock_bus();
        bus.line = line;
        bus.usable = true;
    }

    pub fn is_usable(&self) -> bool {
        self.lock_bus().usable
    }

    pub fn record_status(&self, address: PumpAddress, status: Status) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address, status);
    }

    /// Last status decoded from `address`, if it ever answered.
    pub fn last_status(&self, address: PumpAddress) -> Option<Status> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// Closes the session and hands back the line.
    pub fn close(self) -> L {
        self.bus
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .line
    }
}

fn exchange<L: Line>(line: &mut L, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    // A reply that missed an earlier deadline must not answer this request.
    line.discard_input().map_err(PumpError::TransportFailure)?;
    log_bytes("TX", request);
    line.write_all(request)
        .and_then(|_| line.flush())
        .map_err(PumpError::TransportFailure)?;

    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut chunk = [0u8; 64];
    loop {
        if Instant::now() >= deadline {
            log_bytes("RX (discarded)", &reply);
            line.discard_input().map_err(PumpError::TransportFailure)?;
            return Err(PumpError::Timeout(timeout));
        }
        match line.read(&mut chunk) {
            Ok(0) => thread::sleep(IDLE_POLL),
            Ok(n) => {
                reply.extend_from_slice(&chunk[..n]);
                if let Some(end) = reply.iter().position(|&b| is_terminator(b)) {
                    reply.truncate(end + 1);
                    log_bytes("RX", &reply);
                    return Ok(reply);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(PumpError::TransportFailure(e)),
        }
    }
}

fn log_bytes(prefix: &str, bytes: &[u8]) {
    if bytes.is_empty() || !log_enabled!(Level::Debug) {
        return;
    }
    let mut line = String::with_capacity(prefix.len() + bytes.len() * 3);
    line.push_str(prefix);
    line.push(':');
    for byte in bytes {
        let _ = write!(line, " {byte:02X}");
    }
    debug!("{line}");
}
