use std::sync::Arc;
use std::thread;
use std::time::Duration;

use syringe_bus::command::{Direction, Rate, TimeUnit, VolumeUnit};
use syringe_bus::{
    parse_program, resolve, AlarmKind, ErrorCode, Prompt, PumpAddress, PumpBus, PumpError, SimulatedBus,
};

fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

fn pump(index: i64) -> PumpAddress {
    resolve(index).unwrap()
}

fn bus_with(addresses: &[u8]) -> (SimulatedBus, PumpBus<SimulatedBus>) {
    init_logging();
    let sim = SimulatedBus::with_pumps(addresses);
    let bus = PumpBus::with_timeout(sim.clone(), Duration::from_millis(50));
    (sim, bus)
}

#[test]
fn phase_program_document_configures_every_pump() {
    let (sim, bus) = bus_with(&[0, 1]);
    let program = parse_program(
        r#"[ { "address": "all", "diameter": 26.7, "program": [
            { "function": "rate",
              "rate": { "value": 1.5, "volume_unit": "ml", "time_unit": "min" },
              "volume": { "value": 3, "unit": "ml" },
              "direction": "withdraw" },
            { "function": "pause", "time": 5 },
            { "function": "jump", "phase": 1 }
        ] } ]"#,
    )
    .unwrap();

    bus.scan((0..4).map(pump)).unwrap();
    let outcomes = bus.run_program(&program).into_result().unwrap();
    assert_eq!(outcomes.len(), program.len() * 2);

    for index in [0, 1] {
        let state = sim.pump(index).unwrap();
        assert_eq!(state.diameter, 26.7);
        assert_eq!(state.rate, 1.5);
        assert_eq!(state.volume, 3.0);
        assert_eq!(state.direction, Direction::Withdraw);
        assert_eq!(state.phase, 3);
    }

    assert_eq!(
        bus.rate(pump(1)).unwrap(),
        Rate::new(1.5, VolumeUnit::Milliliters, TimeUnit::PerMinute)
    );
}

#[test]
fn step_program_runs_until_pumps_stop() {
    let (sim, bus) = bus_with(&[3]);
    sim.configure(3, |p| {
        p.run_length = 4;
        p.volume = 0.25;
    });
    let program = parse_program(
        r#"{ "steps": [
            { "target": 3, "command": "set_direction", "args": { "direction": "infuse" } },
            { "target": 3, "command": "start",
              "wait": { "until": ["stopped"], "poll_ms": 1, "timeout_ms": 2000 } },
            { "target": 3, "command": "dispensed" }
        ] }"#,
    )
    .unwrap();

    bus.run_program(&program).into_result().unwrap();
    let dispensed = bus.dispensed(pump(3)).unwrap();
    assert_eq!(dispensed.infused, 0.25);
    assert_eq!(dispensed.withdrawn, 0.0);
}

#[test]
fn rejected_step_halts_the_rest_of_the_program() {
    let (sim, bus) = bus_with(&[0]);
    sim.configure(0, |p| p.run_length = 100);
    let program = parse_program(
        r#"{ "steps": [
            { "target": 0, "command": "set_volume", "args": { "value": 1 } },
            { "target": 0, "command": "start" },
            { "target": 0, "command": "start" },
            { "target": 0, "command": "set_volume", "args": { "value": 2 } }
        ] }"#,
    )
    .unwrap();

    let err = bus.run_program(&program).into_result().unwrap_err();
    match err {
        PumpError::ProgramHalted {
            step,
            address,
            source,
        } => {
            assert_eq!(step, 2);
            assert_eq!(address, Some(pump(0)));
            assert!(matches!(
                *source,
                PumpError::CommandRejected {
                    code: ErrorCode::NotApplicable,
                    ..
                }
            ));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(sim.requests(), vec!["00VOL1", "00RUN", "00RUN"]);
    assert_eq!(sim.pump(0).unwrap().volume, 1.0);
}

#[test]
fn alarm_during_wait_halts_the_program() {
    let (sim, bus) = bus_with(&[0]);
    sim.configure(0, |p| p.run_length = 100_000);
    let program = parse_program(
        r#"{ "steps": [
            { "target": 0, "command": "start",
              "wait": { "until": ["stopped"], "poll_ms": 1, "timeout_ms": 1000 } }
        ] }"#,
    )
    .unwrap();

    let alarm_source = sim.clone();
    let raiser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        alarm_source.raise_alarm(0, AlarmKind::Stalled);
    });
    let result = bus.run_program(&program);
    raiser.join().unwrap();

    assert_eq!(result.failed_at, Some(0));
    assert!(matches!(
        result.error,
        Some(PumpError::PumpAlarm {
            alarm: AlarmKind::Stalled,
            ..
        })
    ));
}

#[test]
fn callers_on_several_threads_share_the_line() {
    let (sim, bus) = bus_with(&[0, 1, 2]);
    let bus = Arc::new(bus);

    let handles: Vec<_> = (0..3)
        .map(|index| {
            let bus = Arc::clone(&bus);
            thread::spawn(move || {
                for _ in 0..5 {
                    bus.set_direction(pump(index), Direction::Withdraw).unwrap();
                    assert_eq!(bus.direction(pump(index)).unwrap(), Direction::Withdraw);
                    assert_eq!(bus.prompt(pump(index)).unwrap(), Prompt::Stopped);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(sim.requests().len(), 45);
}

#[test]
fn lost_line_needs_reopen() {
    let (sim, bus) = bus_with(&[0]);
    sim.fail_io();
    assert!(matches!(
        bus.firmware_version(pump(0)),
        Err(PumpError::TransportFailure(_))
    ));
    assert!(!bus.session().is_usable());

    bus.reopen(SimulatedBus::with_pumps(&[0]));
    assert_eq!(bus.firmware_version(pump(0)).unwrap(), "NE1000V3.934");
}
