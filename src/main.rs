//! Audioloop - adaptive-rate audio loopback
//!
//! Entry point for the command line application.

mod simulate;

use anyhow::{anyhow, Result};
use audioloop::audio::engine::AudioEngine;
use audioloop::{LoopbackConfig, StatsStore};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

use simulate::Simulation;

/// Command line options besides the module arguments
#[derive(Debug, Default)]
struct Options {
    config_file: Option<PathBuf>,
    save_config: Option<PathBuf>,
    stats_file: Option<PathBuf>,
    simulate: bool,
    drift_ppm: f64,
    duration: Option<Duration>,
    modargs: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("audioloop=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let options = match parse_args(&args)? {
        Some(options) => options,
        None => return Ok(()),
    };

    let mut config = match &options.config_file {
        Some(path) => LoopbackConfig::load(path),
        None => LoopbackConfig::default(),
    };
    if !options.modargs.is_empty() {
        config.apply_modargs(&join_modargs(&options.modargs))?;
    }
    if options.simulate {
        // virtual devices answer to any name
        config.source.get_or_insert_with(|| "virtual-source".to_string());
        config.sink.get_or_insert_with(|| "virtual-sink".to_string());
    }
    config.validate()?;

    if let Some(path) = &options.save_config {
        config.save(path)?;
    }

    println!("audioloop v{}", audioloop::VERSION);
    println!(
        "{} -> {} | latency {} ms | adjust every {} s",
        config.source.as_deref().unwrap_or_default(),
        config.sink.as_deref().unwrap_or_default(),
        config.latency_msec,
        config.adjust_time_sec
    );
    println!();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let stats = if options.simulate {
        info!(drift_ppm = options.drift_ppm, "Starting simulated loopback");
        let simulation = Simulation::start(&config, options.drift_ppm)?;
        let stats = simulation.stats();
        monitor(&stats, &running, options.duration);
        println!();
        println!("Stopping...");
        simulation.stop()?;
        stats
    } else {
        let mut engine = AudioEngine::new();
        if let Err(e) = engine.start(&config) {
            error!("Failed to start engine: {}", e);
            return Err(e.into());
        }
        let stats = engine
            .stats()
            .ok_or_else(|| anyhow!("engine started without statistics"))?;
        monitor(&stats, &running, options.duration);
        println!();
        println!("Stopping...");
        engine.stop()?;
        stats
    };

    if let Some(path) = &options.stats_file {
        write_history(&stats, path)?;
    }
    println!("Done.");
    Ok(())
}

/// Parse the command line; `None` means the run is already complete
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options::default();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--version" | "-v" => {
                println!("audioloop {} ({})", audioloop::VERSION, audioloop::BUILD_DATE);
                return Ok(None);
            }
            "--config" | "-c" => {
                options.config_file = Some(PathBuf::from(value_of(args, i, "--config")?));
                i += 2;
                continue;
            }
            "--save-config" => {
                options.save_config = Some(PathBuf::from(value_of(args, i, "--save-config")?));
                i += 2;
                continue;
            }
            "--stats" => {
                options.stats_file = Some(PathBuf::from(value_of(args, i, "--stats")?));
                i += 2;
                continue;
            }
            "--simulate" | "-s" => options.simulate = true,
            "--drift" => {
                let raw = value_of(args, i, "--drift")?;
                options.drift_ppm = raw
                    .parse()
                    .map_err(|_| anyhow!("Invalid drift: {}", raw))?;
                i += 2;
                continue;
            }
            "--duration" | "-d" => {
                let raw = value_of(args, i, "--duration")?;
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| anyhow!("Invalid duration: {}", raw))?;
                options.duration = Some(Duration::from_secs(secs));
                i += 2;
                continue;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
            arg => options.modargs.push(arg.to_string()),
        }
        i += 1;
    }

    Ok(Some(options))
}

fn value_of<'a>(args: &'a [String], i: usize, name: &str) -> Result<&'a String> {
    args.get(i + 1)
        .ok_or_else(|| anyhow!("{} requires a value", name))
}

/// Rebuild a module argument string, quoting values the shell already split
fn join_modargs(args: &[String]) -> String {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) if value.chars().any(char::is_whitespace) => {
                format!("{}=\"{}\"", key, value.replace('\\', "\\\\").replace('"', "\\\""))
            }
            _ => arg.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_help() {
    println!("Usage: audioloop [OPTIONS] source=NAME sink=NAME [key=value ...]");
    println!();
    println!("Options:");
    println!("  -c, --config FILE       Load settings from a JSON file");
    println!("      --save-config FILE  Write the resolved settings to a JSON file");
    println!("      --stats FILE        Write the cycle history as JSON on exit");
    println!("  -s, --simulate          Loop between two virtual devices");
    println!("      --drift PPM         Source clock offset in simulation (default: 0)");
    println!("  -d, --duration SECS     Stop after SECS seconds");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Arguments:");
    println!("  latency_msec, max_latency_msec, adjust_time,");
    println!("  fast_adjust_threshold_msec, rate, channels");
    println!();
    println!("Examples:");
    println!("  audioloop source=\"USB Mic\" sink=default latency_msec=60");
    println!("  audioloop --simulate --drift 150 adjust_time=2 --duration 60");
}

/// Print a status line whenever the controller's numbers change
fn monitor(stats: &Arc<Mutex<StatsStore>>, running: &AtomicBool, duration: Option<Duration>) {
    println!("Monitoring started. Press Ctrl+C to stop.");
    println!();
    println!("Status:");
    println!("────────────────────────────────────────");

    let started = Instant::now();
    let mut last_status = String::new();
    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }

        let status_line = match stats.lock() {
            Ok(store) => {
                let s = store.stats();
                format!(
                    "Latency: {:>7.2}ms | Min latency: {:>6.2}ms | Rate: {:>6} Hz ({:+}) | Cycles: {:>5} | Fast: {:>3} | Underruns: {:>3}",
                    s.current_latency,
                    s.minimum_latency,
                    s.rate,
                    s.rate as i64 - s.base_rate as i64,
                    s.cycle_count,
                    s.fast_adjust_count,
                    s.total_underruns
                )
            }
            Err(_) => break,
        };

        // Only print if changed (reduce spam)
        if status_line != last_status {
            println!("{}", status_line);
            last_status = status_line;
        }

        std::thread::sleep(Duration::from_millis(100));
    }
}

fn write_history(stats: &Arc<Mutex<StatsStore>>, path: &std::path::Path) -> Result<()> {
    let store = stats
        .lock()
        .map_err(|_| anyhow!("statistics lock poisoned"))?;
    let json = serde_json::to_string_pretty(store.history())?;
    std::fs::write(path, json)?;
    info!(path = %path.display(), cycles = store.history().len(), "Cycle history written");
    Ok(())
}
