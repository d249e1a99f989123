//! Multi-step pump programs and the sequencer that replays them.
//!
//! A [`Program`] is a flat, immutable list of steps, so a failure is always
//! reported by its step index. Execution is sequential and fail-fast: the
//! first failing step halts the program and nothing already applied is
//! undone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::address::{PumpAddress, Target};
use crate::command::{Command, Reply};
use crate::error::{PumpError, Result};
use crate::frame::{Prompt, Status};
use crate::pump::PumpBus;
use crate::transport::Line;

/// Poll interval used when a wait does not set one.
pub const DEFAULT_POLL: Duration = Duration::from_millis(100);

/// Polls pump status after a step until it shows one of `until`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitCondition {
    pub until: Vec<Prompt>,
    pub poll: Duration,
    pub timeout: Duration,
}

impl WaitCondition {
    pub fn new(until: Vec<Prompt>, timeout: Duration) -> Self {
        WaitCondition {
            until,
            poll: DEFAULT_POLL,
            timeout,
        }
    }

    pub fn poll_every(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramStep {
    pub target: Target,
    pub command: Command,
    pub wait: Option<WaitCondition>,
    /// Pause after the step before the next one is issued.
    pub delay: Option<Duration>,
}

impl ProgramStep {
    pub fn new(target: impl Into<Target>, command: Command) -> Self {
        ProgramStep {
            target: target.into(),
            command,
            wait: None,
            delay: None,
        }
    }

    pub fn wait_for(mut self, wait: WaitCondition) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn then_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// An ordered, validated list of steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    steps: Vec<ProgramStep>,
}

impl Program {
    pub fn new(steps: Vec<ProgramStep>) -> Self {
        Program { steps }
    }

    pub fn steps(&self) -> &[ProgramStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl FromIterator<ProgramStep> for Program {
    fn from_iter<I: IntoIterator<Item = ProgramStep>>(iter: I) -> Self {
        Program::new(iter.into_iter().collect())
    }
}

/// Reply of one pump to one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step: usize,
    pub address: PumpAddress,
    pub reply: Reply,
}

/// What a program run did, including how far it got.
#[derive(Debug)]
pub struct ProgramResult {
    /// Every exchange that succeeded, in order.
    pub outcomes: Vec<StepOutcome>,
    /// Index of the step that halted the program.
    pub failed_at: Option<usize>,
    /// Pump the failing step was addressing, if it got that far.
    pub failed_address: Option<PumpAddress>,
    pub error: Option<PumpError>,
}

impl ProgramResult {
    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }

    /// Converts a halted run into [`PumpError::ProgramHalted`].
    pub fn into_result(self) -> Result<Vec<StepOutcome>> {
        match (self.failed_at, self.error) {
            (Some(step), Some(error)) => Err(PumpError::ProgramHalted {
                step,
                address: self.failed_address,
                source: Box::new(error),
            }),
            _ => Ok(self.outcomes),
        }
    }
}

/// Cooperative cancellation, checked before each exchange a program issues.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives a program through a [`PumpBus`], one exchange at a time.
pub struct Sequencer<'a, L: Line> {
    bus: &'a PumpBus<L>,
    known: Vec<PumpAddress>,
    cancel: CancelToken,
}

impl<'a, L: Line> Sequencer<'a, L> {
    /// `known` is what an `all` target expands to.
    pub fn new(bus: &'a PumpBus<L>, known: Vec<PumpAddress>) -> Self {
        Sequencer {
            bus,
            known,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(&self, program: &Program) -> ProgramResult {
        let mut result = ProgramResult {
            outcomes: Vec::new(),
            failed_at: None,
            failed_address: None,
            error: None,
        };

        for (index, step) in program.steps().iter().enumerate() {
            let addresses = step.target.expand(&self.known);
            if addresses.is_empty() {
                warn!("step {index} ({}) targets no pumps", step.command.name());
            }

            for address in addresses {
                if self.cancel.is_cancelled() {
                    warn!("program cancelled before step {index}");
                    result.failed_at = Some(index);
                    result.error = Some(PumpError::Cancelled);
                    return result;
                }

                info!("step {index}: {} -> pump {address}", step.command.name());
                match self.run_on(step, address) {
                    Ok(reply) => result.outcomes.push(StepOutcome {
                        step: index,
                        address,
                        reply,
                    }),
                    Err(e) => {
                        warn!("program halted at step {index} on pump {address}: {e}");
                        result.failed_at = Some(index);
                        result.failed_address = Some(address);
                        result.error = Some(e);
                        return result;
                    }
                }
            }

            if let Some(delay) = step.delay {
                thread::sleep(delay);
            }
        }
        result
    }

    fn run_on(&self, step: &ProgramStep, address: PumpAddress) -> Result<Reply> {
        let reply = self.bus.execute(address, &step.command)?;
        if let Some(wait) = &step.wait {
            self.wait_until(address, wait)?;
        }
        Ok(reply)
    }

    fn wait_until(&self, address: PumpAddress, wait: &WaitCondition) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.bus.status(address)? {
                Status::Prompt(prompt) if wait.until.contains(&prompt) => return Ok(()),
                Status::Unknown(raw) => {
                    warn!("pump {address} reported unknown status {raw:?} while waiting");
                }
                _ => {}
            }
            if started.elapsed() >= wait.timeout {
                return Err(PumpError::ReadyTimeout {
                    address,
                    expected: wait.until.clone(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(wait.poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::resolve;
    use crate::command::{Direction, Rate, TimeUnit, VolumeUnit};
    use crate::frame::{AlarmKind, ErrorCode};
    use crate::sim::SimulatedBus;

    fn pump(index: i64) -> PumpAddress {
        resolve(index).unwrap()
    }

    fn bus_with(addresses: &[u8]) -> (SimulatedBus, PumpBus<SimulatedBus>) {
        let sim = SimulatedBus::with_pumps(addresses);
        let bus = PumpBus::with_timeout(sim.clone(), Duration::from_millis(50));
        (sim, bus)
    }

    #[test]
    fn failing_step_halts_the_program() {
        let (sim, bus) = bus_with(&[0]);
        sim.configure(0, |p| p.run_length = 100);
        let program: Program = [
            ProgramStep::new(pump(0), Command::start()),
            // Rejected while running.
            ProgramStep::new(pump(0), Command::set_diameter(10.0).unwrap()),
            ProgramStep::new(pump(0), Command::set_direction(Direction::Withdraw).unwrap()),
        ]
        .into_iter()
        .collect();

        let result = Sequencer::new(&bus, vec![]).run(&program);
        assert_eq!(result.failed_at, Some(1));
        assert_eq!(result.failed_address, Some(pump(0)));
        assert_eq!(result.outcomes.len(), 1);
        assert!(matches!(
            result.error,
            Some(PumpError::CommandRejected {
                code: ErrorCode::NotApplicable,
                ..
            })
        ));
        assert!(!sim.requests().iter().any(|r| r.starts_with("00DIR")));
    }

    #[test]
    fn halted_result_converts_to_program_halted() {
        let (sim, bus) = bus_with(&[0]);
        sim.raise_alarm(0, AlarmKind::Stalled);
        let program = Program::new(vec![ProgramStep::new(pump(0), Command::start())]);
        let err = bus.run_program(&program).into_result().unwrap_err();
        match err {
            PumpError::ProgramHalted {
                step,
                address,
                source,
            } => {
                assert_eq!(step, 0);
                assert_eq!(address, Some(pump(0)));
                assert!(matches!(*source, PumpError::PumpAlarm { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn all_expands_over_known_pumps_in_order() {
        let (sim, bus) = bus_with(&[1, 2, 5]);
        let rate = Rate::new(3.0, VolumeUnit::Milliliters, TimeUnit::PerHour);
        let program = Program::new(vec![
            ProgramStep::new(Target::All, Command::set_rate(rate).unwrap()),
            ProgramStep::new(Target::Many(vec![pump(5), pump(1)]), Command::firmware_version()),
        ]);

        let outcomes = Sequencer::new(&bus, vec![pump(1), pump(2), pump(5)])
            .run(&program)
            .into_result()
            .unwrap();
        assert_eq!(outcomes.len(), 5);
        assert_eq!(
            sim.requests(),
            vec!["01RAT3MH", "02RAT3MH", "05RAT3MH", "05VER", "01VER"]
        );
        assert_eq!(outcomes[3].reply, Reply::Text("NE1000V3.934".into()));
    }

    #[test]
    fn failure_inside_expansion_skips_remaining_pumps() {
        let (sim, bus) = bus_with(&[1, 2, 3]);
        sim.raise_alarm(2, AlarmKind::Stalled);
        let program = Program::new(vec![ProgramStep::new(Target::All, Command::start())]);

        let result = Sequencer::new(&bus, vec![pump(1), pump(2), pump(3)]).run(&program);
        assert_eq!(result.failed_at, Some(0));
        assert_eq!(result.failed_address, Some(pump(2)));
        assert_eq!(sim.requests(), vec!["01RUN", "02RUN"]);
    }

    #[test]
    fn wait_polls_until_the_pump_stops() {
        let (sim, bus) = bus_with(&[0]);
        sim.configure(0, |p| p.run_length = 3);
        let wait = WaitCondition::new(vec![Prompt::Stopped], Duration::from_secs(1))
            .poll_every(Duration::from_millis(1));
        let program = Program::new(vec![
            ProgramStep::new(pump(0), Command::start()).wait_for(wait),
            ProgramStep::new(pump(0), Command::dispensed()),
        ]);

        let outcomes = bus.run_program(&program).into_result().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(sim.pump(0).unwrap().prompt, Prompt::Stopped);
        let polls = sim.requests().iter().filter(|r| *r == "00").count();
        assert_eq!(polls, 3);
    }

    #[test]
    fn wait_gives_up_after_its_timeout() {
        let (sim, bus) = bus_with(&[0]);
        sim.configure(0, |p| p.run_length = 10_000);
        let wait = WaitCondition::new(vec![Prompt::Stopped], Duration::from_millis(20))
            .poll_every(Duration::from_millis(5));
        let program = Program::new(vec![ProgramStep::new(pump(0), Command::start()).wait_for(wait)]);

        let result = bus.run_program(&program);
        assert_eq!(result.failed_at, Some(0));
        assert!(matches!(
            result.error,
            Some(PumpError::ReadyTimeout { ref expected, .. }) if expected == &[Prompt::Stopped]
        ));
    }

    #[test]
    fn cancelled_program_issues_nothing() {
        let (sim, bus) = bus_with(&[0]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let program = Program::new(vec![ProgramStep::new(pump(0), Command::start())]);

        let result = bus.run_program_with_cancel(&program, &cancel);
        assert_eq!(result.failed_at, Some(0));
        assert!(matches!(result.error, Some(PumpError::Cancelled)));
        assert!(sim.requests().is_empty());
    }

    #[test]
    fn absent_pump_times_out_and_halts() {
        let (_sim, bus) = bus_with(&[0]);
        let program = Program::new(vec![
            ProgramStep::new(pump(7), Command::status()),
            ProgramStep::new(pump(0), Command::status()),
        ]);
        let result = bus.run_program(&program);
        assert_eq!(result.failed_at, Some(0));
        assert!(matches!(result.error, Some(PumpError::Timeout(_))));
        assert!(result.outcomes.is_empty());
    }
}
