//! Motor tester for the vending machine.
//!
//! Run with: cargo run --bin motor_tester --features gpiod -- <command>
//!
//! Without a command it starts the interactive tester ("1 f 10").

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use gethostname::gethostname;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use vending_motors::calibration::StdioConsole;
use vending_motors::config_loader::{config_path, load_machine_settings_from};
use vending_motors::gpio::open_output_lines;
use vending_motors::operations::Operations;
use vending_motors::pins::Direction;

#[derive(Parser, Debug)]
#[command(name = "motor_tester", about = "Vending machine motor tester and slot calibration")]
struct Cli {
    /// Path to vending_machine.yaml (default: VENDING_CONFIG or the crate directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host block to use (default: this machine's hostname)
    #[arg(long)]
    host: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one logical slot
    Dispense {
        slot: u8,
        /// forward/f or reverse/r
        #[arg(default_value = "forward")]
        direction: Direction,
        #[arg(default_value_t = 1.0)]
        seconds: f64,
    },
    /// Read commands like "1 f 10" until 'q'
    Interactive,
    /// Run every slot forward in sequence
    RunAll {
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,
        /// Pause between motors, seconds
        #[arg(long, default_value_t = 1.0)]
        pause: f64,
    },
    /// Discover the logical -> physical slot mapping with an operator
    Calibrate,
    /// Print which line each logical slot drives
    ShowMapping,
}

/// One line of interactive input.
#[derive(Debug, PartialEq)]
enum ReplCommand {
    Quit,
    Help,
    Run { slot: u8, direction: Direction, seconds: f64 },
}

const USAGE: &str = "Please use format: 1 f 10  (motor, f/r, seconds)";

fn parse_repl_line(line: &str) -> Result<ReplCommand> {
    let line = line.trim().to_lowercase();
    match line.as_str() {
        "q" => return Ok(ReplCommand::Quit),
        "h" => return Ok(ReplCommand::Help),
        _ => {}
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(anyhow!(USAGE));
    }
    let slot = parts[0].parse().map_err(|_| anyhow!(USAGE))?;
    let direction = parts[1].parse()?;
    let seconds = parts[2].parse().map_err(|_| anyhow!(USAGE))?;
    Ok(ReplCommand::Run { slot, direction, seconds })
}

fn show_help(ops: &Operations) {
    println!("\nUsage: motor_tester dispense <motor> [direction] [seconds]");
    println!("\nExample commands:");
    println!("  1 f 10    # Run motor 1 forward for 10 seconds");
    println!("  2 r 5     # Run motor 2 reverse for 5 seconds");
    println!("\nParameters:");
    println!("  motor: 1-{}", ops.settings().logical_slots);
    println!("  direction: f (forward) or r (reverse)");
    println!("  seconds: how long to run (max {})", ops.settings().max_dispense_seconds);
    println!("\nType 'q' to quit, 'h' for help");
}

fn interactive(ops: &Operations) -> Result<()> {
    println!("\nMotor Tester - Interactive Mode");
    println!("Enter commands like: 1 f 10");
    println!("Type 'q' to quit, 'h' for help");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("\nCommand: ");
        io::stdout().flush()?;

        let Some(line) = lines.next() else { break; };
        match parse_repl_line(&line?) {
            Ok(ReplCommand::Quit) => break,
            Ok(ReplCommand::Help) => show_help(ops),
            Ok(ReplCommand::Run { slot, direction, seconds }) => {
                println!("Running motor {} {} for {} seconds...", slot, direction, seconds);
                match ops.dispense(slot, direction, seconds) {
                    Ok(_) => println!("Done!"),
                    Err(e) => {
                        println!("Error: {}", e);
                        if e.is_fatal() {
                            println!("Check the motor wiring, then restart the tester.");
                            break;
                        }
                    }
                }
            }
            Err(e) => println!("{}", e),
        }
    }
    Ok(())
}

fn run_all(ops: &Operations, seconds: f64, pause: f64) -> Result<()> {
    let pause = Duration::try_from_secs_f64(pause).map_err(|e| anyhow!("Invalid pause: {}", e))?;

    println!("\nStarting sequential forward test of all motors");
    for slot in ops.mapping_report() {
        println!(" Motor {}: line {} (forward), {} (reverse)", slot.logical_slot, slot.forward_line, slot.reverse_line);
    }
    println!("\nWill run each motor forward for {} seconds...", seconds);
    print!("Press Enter to begin...");
    io::stdout().flush()?;
    io::stdin().lock().read_line(&mut String::new())?;

    let results = ops.run_all(seconds, pause);
    for (slot, result) in &results {
        match result {
            Ok(_) => println!("Motor {} complete!", slot),
            Err(e) => println!("Error running motor {}: {}", slot, e),
        }
    }
    println!("\nTest complete! {}/{} motors ran", results.iter().filter(|(_, r)| r.is_ok()).count(), results.len());
    Ok(())
}

fn calibrate(ops: &Operations) -> Result<()> {
    println!("\nSlot calibration: each slot's motor runs forward for {}s.", ops.settings().calibration_seconds);
    println!("Watch the machine and report which slot actually moved.\n");

    let stdin = io::stdin();
    let mut console = StdioConsole::new(stdin.lock(), io::stdout());
    let entries = ops.calibrate(&mut console)?;

    println!("\nNew mapping:");
    for e in &entries {
        println!("  slot {} -> physical {}{}", e.logical_slot, e.physical_slot, if e.invert { " (inverted)" } else { "" });
    }
    Ok(())
}

fn show_mapping(ops: &Operations) {
    println!("Host: {}  mapping file: {}", ops.settings().hostname, ops.settings().mapping_file.display());
    println!("{:>7} {:>9} {:>7} {:>13} {:>13}", "logical", "physical", "invert", "forward line", "reverse line");
    for r in ops.mapping_report() {
        println!("{:>7} {:>9} {:>7} {:>13} {:>13}", r.logical_slot, r.physical_slot, r.invert, r.forward_line, r.reverse_line);
    }
}

/// Shut the hardware down from the interrupt handler, if `main` still owns it.
fn interrupt_cleanup(ops: &Weak<Operations>) -> bool {
    let Some(ops) = ops.upgrade() else { return false; };
    if let Err(e) = ops.cleanup() {
        log::error!("{:#}", e);
    }
    true
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let ops = if cli.config.is_none() && cli.host.is_none() {
        Operations::new()?
    } else {
        let path = cli.config.clone().unwrap_or_else(config_path);
        let host = cli.host.clone().unwrap_or_else(|| gethostname().to_string_lossy().to_string());
        let settings = load_machine_settings_from(&path, &host)?;
        let lines = open_output_lines(&settings);
        Operations::with_lines(settings, lines)?
    };
    let ops = Arc::new(ops);

    // Ctrl-C: wait for any in-flight pulse, drive everything low, exit.
    // Weak so a panicking main still drops Operations and releases the lines.
    let signal_ops = Arc::downgrade(&ops);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping motors...");
        interrupt_cleanup(&signal_ops);
        std::process::exit(130);
    })?;

    let outcome = match cli.command.unwrap_or(Command::Interactive) {
        Command::Dispense { slot, direction, seconds } => {
            println!("Running motor {} {} for {} seconds...", slot, direction, seconds);
            ops.dispense(slot, direction, seconds)
                .map(|done| println!("Done! (physical slot {}, line {})", done.physical_slot, done.pin))
                .map_err(anyhow::Error::from)
        }
        Command::Interactive => interactive(&ops),
        Command::RunAll { seconds, pause } => run_all(&ops, seconds, pause),
        Command::Calibrate => calibrate(&ops),
        Command::ShowMapping => {
            show_mapping(&ops);
            Ok(())
        }
    };

    let cleaned = ops.cleanup();
    outcome?;
    cleaned
}
