use std::io::{self, BufRead, Write};

use log::error;
use syringe_bus::{
    load_program, Line, PumpAddress, PumpBus, PumpError, Response, SessionConfig, SimulatedBus,
};

// The main entry point for the pump console.
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=========================");
    println!("  Syringe Pump Console   ");
    println!("=========================");

    let bus = loop {
        println!("\nSelect line:");
        println!("  1. Serial Port");
        println!("  2. Simulated Pumps");
        println!("  3. Exit");
        match read_line("> ").as_str() {
            "1" => {
                if let Some(bus) = open_serial() {
                    break bus;
                }
            }
            "2" => break open_simulated(),
            "3" => return,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, or 3."),
        }
    };

    // Main menu loop.
    loop {
        println!("\nSelect mode:");
        println!("  1. Manual Command Input");
        println!("  2. Apply Program File");
        println!("  3. Scan Bus");
        println!("  4. Exit");

        match read_line("> ").as_str() {
            "1" => run_manual_mode(&bus),
            "2" => run_program_mode(&bus),
            "3" => run_scan(&bus),
            "4" => break,
            _ => eprintln!("[ERROR] Invalid choice. Please enter 1, 2, 3, or 4."),
        }
    }
}

fn read_line(label: &str) -> String {
    print!("{label}");
    let _ = io::stdout().flush();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return String::new();
    }
    input.trim().to_string()
}

// Lets the user pick a port and baud rate, then opens it.
fn open_serial() -> Option<PumpBus<Box<dyn Line>>> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            eprintln!("[ERROR] Could not enumerate serial ports: {}", e);
            return None;
        }
    };

    if ports.is_empty() {
        eprintln!("[ERROR] No serial ports found.");
        return None;
    }

    println!("Available serial ports:");
    for (i, port) in ports.iter().enumerate() {
        println!("  {}: {}", i, port.port_name);
    }
    let port_index: usize = match read_line("Select a port (number): ").parse() {
        Ok(i) if i < ports.len() => i,
        _ => {
            eprintln!("[ERROR] Invalid port selection.");
            return None;
        }
    };

    let baud_rates = [1200, 2400, 9600, 19200];
    println!("Available baud rates:");
    for (i, &rate) in baud_rates.iter().enumerate() {
        println!("  {}: {}", i, rate);
    }
    let baud_index: usize = match read_line("Select a baud rate (number, default 19200): ").as_str() {
        "" => 3,
        s => match s.parse() {
            Ok(i) if i < baud_rates.len() => i,
            _ => {
                eprintln!("[ERROR] Invalid baud rate selection.");
                return None;
            }
        },
    };

    let mut config = SessionConfig::new(ports[port_index].port_name.clone());
    config.baud_rate = baud_rates[baud_index];
    match config.open() {
        Ok(port) => {
            println!("Connected to {} at {} baud.", config.port, config.baud_rate);
            let line: Box<dyn Line> = Box::new(port);
            Some(PumpBus::with_timeout(line, config.timeout()))
        }
        Err(e) => {
            eprintln!("[ERROR] Failed to open port '{}': {}", config.port, e);
            None
        }
    }
}

fn open_simulated() -> PumpBus<Box<dyn Line>> {
    let line: Box<dyn Line> = Box::new(SimulatedBus::with_pumps(&[0, 1]));
    println!("Simulated pumps at addresses 00 and 01.");
    PumpBus::new(line)
}

// Sends raw requests such as `00VER` or `01RAT5.5MH`.
fn run_manual_mode(bus: &PumpBus<Box<dyn Line>>) {
    println!("\n--- Manual Mode ---");
    println!("Enter requests (address then command, e.g. 00VER), or type 'back' to return to the main menu.");
    print!("> ");
    let _ = io::stdout().flush();

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(input) = line else { break };
        let request = input.trim();

        if request == "back" {
            break;
        }

        if !request.is_empty() {
            match bus.send_raw(request) {
                Ok(response) => display_response(&response),
                Err(e) => report(&e),
            }
            warn_if_unusable(bus);
        }
        print!("> ");
        let _ = io::stdout().flush();
    }
}

fn run_program_mode(bus: &PumpBus<Box<dyn Line>>) {
    println!("\n--- Program Mode ---");
    let path = read_line("Program file: ");
    let program = match load_program(&path) {
        Ok(program) => program,
        Err(e) => {
            report(&e);
            return;
        }
    };
    println!("Loaded {} steps from {}.", program.len(), path);

    let result = bus.run_program(&program);
    for outcome in &result.outcomes {
        println!("  step {} pump {}: {:?}", outcome.step, outcome.address, outcome.reply);
    }
    match (result.failed_at, &result.error) {
        (Some(step), Some(e)) => {
            eprintln!("[ERROR] Program halted at step {}: {}", step, e);
            eprintln!("        Steps before it were applied and are not rolled back.");
        }
        _ => println!("Program applied."),
    }
    warn_if_unusable(bus);
}

fn run_scan(bus: &PumpBus<Box<dyn Line>>) {
    println!("\n--- Scanning addresses 00-99 ---");
    match bus.scan(PumpAddress::all()) {
        Ok(found) if found.is_empty() => println!("No pumps answered."),
        Ok(found) => {
            for address in found {
                match bus.firmware_version(address) {
                    Ok(version) => println!("  {}: {}", address, version),
                    Err(e) => println!("  {}: ({})", address, e),
                }
            }
        }
        Err(e) => report(&e),
    }
}

fn display_response(response: &Response) {
    print!("< {:?}", response.status);
    if let Some(value) = &response.value {
        print!(" {}", value.as_text());
    }
    if let Some(code) = &response.error {
        print!(" rejected: {}", code);
    }
    println!();
}

fn report(e: &PumpError) {
    eprintln!("[ERROR] {}", e);
}

fn warn_if_unusable(bus: &PumpBus<Box<dyn Line>>) {
    if !bus.session().is_usable() {
        error!("line failed; restart the console to reconnect");
    }
}
