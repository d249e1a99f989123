//! # Syringe Pump Bus Library
//!
//! This library drives syringe pumps sharing one RS-232 multi-drop line.
//! Commands are validated against the pump command set, framed with the
//! pump's address, exchanged over a session that holds the line for the whole
//! round trip, and decoded into typed replies. Multi-step programs are
//! replayed fail-fast by the sequencer.
//!
//! ```no_run
//! use syringe_bus::{resolve, SessionConfig};
//!
//! let bus = SessionConfig::new("/dev/ttyUSB0").connect()?;
//! let pump = resolve(0)?;
//! println!("firmware {}", bus.firmware_version(pump)?);
//! # Ok::<(), syringe_bus::PumpError>(())
//! ```

pub mod address;
pub mod command;
pub mod config;
pub mod error;
pub mod frame;
pub mod program;
pub mod pump;
pub mod sim;
pub mod transport;

pub use address::{resolve, PumpAddress, Target, TargetSpec};
pub use command::{interpret, Command, Reply};
pub use config::{load_program, parse_program, SessionConfig};
pub use error::{PumpError, Result};
pub use frame::{decode, encode, AlarmKind, ErrorCode, Frame, Prompt, Response, Status};
pub use program::{CancelToken, Program, ProgramResult, ProgramStep, Sequencer, WaitCondition};
pub use pump::PumpBus;
pub use sim::SimulatedBus;
pub use transport::{Line, Session};
