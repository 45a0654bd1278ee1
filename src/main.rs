//! SIP flow monitor CLI
//!
//! Runs the flow engine against a simulated sensor fed by valve vectors on
//! stdin, and inspects the usage log, baselines and settings on disk.

use chrono::Local;
use clap::{Parser, Subcommand};
use sip_flow_monitor::{
    config::Config,
    core::{share_board, Channel, StationBoard},
    engine::FlowEngine,
    notify::{NotificationGate, TracingNotifier},
    sensor::SimulatedSource,
    settings::FlowSettings,
    store::{
        export::{format_rate, log_csv, rate_unit, rates_csv},
        BaselineStore, EventLogStore,
    },
    SharedStationBoard, VERSION,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "sip-flow")]
#[command(author = "SIP")]
#[command(version = VERSION)]
#[command(about = "Water flow monitor for the SIP irrigation controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the flow engine, reading valve vectors (e.g. `1,0,0,1`) from stdin
    Start {
        /// Station names, comma separated
        #[arg(long, default_value = "S01,S02,S03,S04,S05,S06,S07,S08")]
        stations: String,

        /// Master valve station number (0 for none)
        #[arg(long, default_value = "0")]
        master: usize,

        /// Simulated pulses per second for each open station
        #[arg(long, default_value = "3")]
        simulate_rate: u32,

        /// Simulated pulses per second with every valve closed
        #[arg(long, default_value = "0")]
        leak: u32,

        /// Serve the HTTP status surface (requires server feature)
        #[arg(long)]
        http: bool,
    },

    /// Show the usage log
    Log,

    /// Export the usage log as CSV
    Export {
        /// Output file (stdout when omitted)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Show the recorded per-station flow rates
    Rates {
        /// Print as CSV
        #[arg(long)]
        csv: bool,
    },

    /// Delete every usage log entry
    ClearLog,

    /// Show configuration
    Config,

    /// Show flow settings
    Settings,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            stations,
            master,
            simulate_rate,
            leak,
            http,
        } => {
            cmd_start(&stations, master, simulate_rate, leak, http);
        }
        Commands::Log => {
            cmd_log();
        }
        Commands::Export { output } => {
            cmd_export(output);
        }
        Commands::Rates { csv } => {
            cmd_rates(csv);
        }
        Commands::ClearLog => {
            cmd_clear_log();
        }
        Commands::Config => {
            cmd_config();
        }
        Commands::Settings => {
            cmd_settings();
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sip_flow_monitor=info,sip_flow=info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config, using defaults: {e}");
            Config::default()
        }
    }
}

fn cmd_start(stations: &str, master: usize, simulate_rate: u32, leak: u32, http: bool) {
    println!("SIP Flow Monitor v{VERSION}");
    println!();

    let names: Vec<String> = stations
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if names.is_empty() {
        eprintln!("Error: At least one station name is required");
        std::process::exit(1);
    }
    if master > names.len() {
        eprintln!("Error: Master station {master} is not one of the {} stations", names.len());
        std::process::exit(1);
    }

    let config = load_config();
    if let Err(e) = config.ensure_directories() {
        eprintln!("Warning: Could not create directories: {e}");
    }

    println!("Starting flow monitor...");
    println!("  Stations: {}", names.join(", "));
    println!(
        "  Master valve: {}",
        if master == 0 {
            "none".to_string()
        } else {
            names[master - 1].clone()
        }
    );
    println!("  Simulated rate: {simulate_rate} pulses/s per station, leak {leak} pulses/s");
    println!("  Data directory: {:?}", config.data_path);

    let board = share_board(StationBoard::new(names, master));

    let gate = NotificationGate::new();
    for channel in Channel::ALL {
        gate.register(channel, Box::new(TracingNotifier::new(format!("{channel} log"))));
    }

    let engine = Arc::new(FlowEngine::new(config.clone(), board.clone(), gate));

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone());

    let source = Box::new(SimulatedSource::new(board.clone(), simulate_rate).with_leak(leak));
    let handles = match engine.spawn(source, running.clone()) {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("Error starting flow threads: {e}");
            std::process::exit(1);
        }
    };

    #[cfg(feature = "server")]
    let _server = if http {
        start_server(config.http_port, engine.clone())
    } else {
        None
    };
    #[cfg(not(feature = "server"))]
    if http {
        eprintln!("Warning: --http flag ignored (server feature not enabled at compile time)");
    }

    spawn_valve_feed(board, engine.clone());

    println!();
    println!("Enter valve vectors such as 1,0,0,1 to switch stations.");
    println!("Press Ctrl+C to stop");
    println!();

    let mut last_status = String::new();
    while running.load(Ordering::SeqCst) {
        let status = engine.status();
        let line = format!(
            "{} {} | water used {} | {}",
            status.flow_rate, status.volume_measure, status.water_use, status.valve_status
        );
        if line != last_status {
            println!("[{}] {}", Local::now().format("%H:%M:%S"), line);
            last_status = line;
        }
        thread::sleep(Duration::from_secs(1));
    }

    println!();
    println!("Stopping...");
    for handle in handles {
        if handle.join().is_err() {
            eprintln!("Warning: A flow thread panicked");
        }
    }

    println!("Total pulses: {}", engine.total_pulses());
    println!("Log entries: {}", engine.log_entries().len());
}

/// Read valve vectors from stdin and publish them as scheduler changes.
fn spawn_valve_feed(board: SharedStationBoard, engine: Arc<FlowEngine>) {
    let spawned = thread::Builder::new()
        .name("valve-feed".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Could not read valve vector: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let states = StationBoard::parse_vector(&line);
                match board.write() {
                    Ok(mut board) => board.requested_on = states,
                    Err(poisoned) => poisoned.into_inner().requested_on = states,
                }
                engine.notify_zone_change();
            }
            tracing::debug!("Valve feed closed");
        });
    if let Err(e) = spawned {
        eprintln!("Warning: Could not start valve feed: {e}");
    }
}

#[cfg(feature = "server")]
fn start_server(
    port: u16,
    engine: Arc<FlowEngine>,
) -> Option<(tokio::runtime::Runtime, tokio::sync::oneshot::Sender<()>)> {
    use sip_flow_monitor::server::{run, ServerConfig};

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Warning: Could not start HTTP runtime: {e}");
            return None;
        }
    };
    match runtime.block_on(run(ServerConfig::new(port), engine)) {
        Ok((addr, shutdown)) => {
            println!("  HTTP: http://{addr}/flow-data");
            Some((runtime, shutdown))
        }
        Err(e) => {
            eprintln!("Warning: Could not start HTTP server: {e}");
            None
        }
    }
}

fn cmd_log() {
    let config = load_config();
    let store = EventLogStore::new(config.log_path());

    let entries: Vec<_> = store.read().collect();
    if entries.is_empty() {
        println!("No flow log entries in {:?}", store.path());
        return;
    }

    println!("{:<10}  {:<8}  {:>6}  {:>10}  Stations", "Date", "Start", "Length", "Usage");
    for entry in &entries {
        println!(
            "{:<10}  {:<8}  {:>6}  {:>10}  {}",
            entry.date,
            entry.start,
            entry.duration,
            format!("{} {}", entry.usage, entry.measure),
            entry.stations
        );
    }
    println!();
    println!("{} entries", entries.len());
}

fn cmd_export(output: Option<PathBuf>) {
    let config = load_config();
    let store = EventLogStore::new(config.log_path());
    let entries: Vec<_> = store.read().collect();
    let csv = match log_csv(&entries) {
        Ok(csv) => csv,
        Err(e) => {
            eprintln!("Error building export: {e}");
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => match std::fs::write(&path, csv) {
            Ok(()) => println!("Exported {} entries to {path:?}", entries.len()),
            Err(e) => {
                eprintln!("Error writing export: {e}");
                std::process::exit(1);
            }
        },
        None => print!("{csv}"),
    }
}

fn cmd_rates(csv: bool) {
    let config = load_config();
    let settings = FlowSettings::load(&config.settings_path());
    let baselines = BaselineStore::new(config.baseline_path()).load();
    let station_name = |i: usize| format!("Station {}", i + 1);

    if csv {
        match rates_csv(&baselines, station_name, &settings) {
            Ok(csv) => print!("{csv}"),
            Err(e) => {
                eprintln!("Error building export: {e}");
                std::process::exit(1);
            }
        }
        return;
    }
    if baselines.is_empty() {
        println!("No flow rates recorded yet.");
        return;
    }

    println!("Recorded flow rates ({})", rate_unit(&settings));
    println!("=========================");
    for (station, history) in &baselines {
        println!(
            "  {:<12} {:>10}  recorded {}",
            station_name(*station),
            format_rate(history.rate, &settings),
            history.time.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn cmd_clear_log() {
    let config = load_config();
    let store = EventLogStore::new(config.log_path());
    match store.clear() {
        Ok(()) => println!("Flow log cleared."),
        Err(e) => {
            eprintln!("Error clearing flow log: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_config() {
    let config = load_config();

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_settings() {
    let config = load_config();
    let path = config.settings_path();
    let settings = FlowSettings::load(&path);

    println!("Flow settings");
    println!("=============");
    println!();
    println!("Settings file: {path:?}");
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&settings).unwrap_or_else(|_| "Error".to_string())
    );
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) {
    if let Err(e) = ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    }) {
        eprintln!("Warning: Could not set Ctrl+C handler: {e}");
    }
}
