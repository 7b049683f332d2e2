//! CLI Entry Point for pinscan
//!
//! Provides command-line access to the sensor engine:
//! - Listing the loaded plugins and assignment options
//! - Running a GPIO scan (all pins or one pin) or an I2C scan
//! - Polling assigned pins for a number of ticks
//!
//! # Usage
//!
//! ```bash
//! pinscan plugins
//! pinscan scan-gpio --pin 17
//! pinscan --backend mock scan-i2c
//! pinscan watch --assign 17=DHT22 --ticks 3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pinscan::config::BackendKind;
use pinscan::engine::{PinKey, PinState, ScanHandle};
use pinscan::{logging, EngineConfig, EngineError, SensorEngine};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pinscan")]
#[command(about = "GPIO/I2C sensor scanner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hardware backend, overriding the configuration
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List loaded plugins and assignment options
    Plugins,

    /// Scan GPIO pins for sensors
    ScanGpio {
        /// Scan only this BCM pin
        #[arg(long)]
        pin: Option<u8>,
    },

    /// Probe the I2C bus
    ScanI2c,

    /// Poll assigned pins
    Watch {
        /// Number of poll ticks before exiting
        #[arg(long, default_value = "3")]
        ticks: u32,

        /// Manual assignments, e.g. `17=DHT22` or `23=TM1637:CLK`
        #[arg(long = "assign", value_name = "PIN=TARGET")]
        assignments: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
    .context("Failed to load configuration")?;
    if let Some(backend) = cli.backend {
        config.hardware.backend = backend;
    }
    config.validate()?;

    if let Err(e) = logging::init_from_config(&config) {
        eprintln!("⚠️  Logging not initialised: {}", e);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: EngineConfig) -> Result<()> {
    println!("🔌 pinscan - GPIO/I2C sensor scanner");

    let (engine, load_errors) = SensorEngine::from_config(config).await;
    for error in load_errors {
        eprintln!("⚠️  {}", EngineError::PluginLoad(error));
    }
    println!("   Backend: {:?}", engine.config().hardware.backend);
    println!("   Plugins: {}", engine.registry().len());
    println!();

    let result = match command {
        Commands::Plugins => {
            list_plugins(&engine);
            Ok(())
        }
        Commands::ScanGpio { pin } => {
            let handle = match pin {
                Some(pin) => engine.start_single_pin_scan(pin)?,
                None => engine.start_gpio_scan()?,
            };
            finish_scan(&engine, handle).await
        }
        Commands::ScanI2c => {
            let handle = engine.start_i2c_scan()?;
            finish_scan(&engine, handle).await
        }
        Commands::Watch { ticks, assignments } => watch(&engine, ticks, &assignments).await,
    };

    engine.shutdown().await;
    result
}

fn list_plugins(engine: &SensorEngine) {
    println!("📦 Loaded plugins:");
    for handle in engine.registry().handles() {
        let d = &handle.descriptor;
        println!(
            "   {:<14} bus={:<5} roles={:<12} auto={}",
            d.name,
            d.bus_type.to_string(),
            d.pin_roles.join(","),
            d.auto_detectable
        );
    }
    println!();
    println!("🎯 Assignment options: {}", engine.plugin_options().join(", "));
}

async fn finish_scan(engine: &SensorEngine, handle: ScanHandle) -> Result<()> {
    println!("🔍 Running {}...", handle.kind);

    let report = tokio::select! {
        report = handle.wait() => report?,
        _ = tokio::signal::ctrl_c() => {
            println!("⏹  Stopping scan");
            engine.stop_all();
            let mut state = engine.subscribe();
            state.wait_for(|s| !s.is_active()).await?;
            print_table(engine);
            return Ok(());
        }
    };

    engine.refresh_levels().await;
    print_table(engine);
    println!();
    println!(
        "✅ {} ({} visited, {} found, {} timeouts, {:.1}s)",
        report.state,
        report.visited,
        report.found.len(),
        report.timeouts,
        report.elapsed.as_secs_f64()
    );
    Ok(())
}

async fn watch(engine: &SensorEngine, ticks: u32, assignments: &[String]) -> Result<()> {
    for assignment in assignments {
        let (pin, target) = assignment
            .split_once('=')
            .with_context(|| format!("Expected PIN=TARGET, got '{}'", assignment))?;
        let pin: u8 = pin.trim().parse().context("Invalid pin number")?;
        engine.assign(pin, target.trim())?;
    }

    let interval = engine.config().poller.interval();
    for tick in 1..=ticks {
        let outcome = engine.poll_once().await;
        println!("⏱  Tick {}/{}: {:?}", tick, ticks, outcome);
        print_table(engine);
        if tick < ticks {
            tokio::time::sleep(interval).await;
        }
    }

    let stats = engine.poll_stats();
    println!();
    println!(
        "📊 {} ticks run, {} skipped, {} reads, {} failures",
        stats.ticks_run, stats.ticks_skipped, stats.reads, stats.failures
    );
    Ok(())
}

fn print_table(engine: &SensorEngine) {
    for banner in engine.banners() {
        println!("⚠️  {}", banner.message);
    }
    println!(
        "{:>4} {:>4} {:<10} {:<7} {:<5} {:<14} {}",
        "PIN", "BCM", "FUNCTION", "MODE", "LEVEL", "SENSOR", "INFO"
    );
    for row in engine.snapshot() {
        print_row(&row);
    }
}

fn print_row(row: &PinState) {
    let (phys, bcm) = match row.key {
        PinKey::Gpio(bcm) => (
            row.phys.map(|p| p.to_string()).unwrap_or_default(),
            bcm.to_string(),
        ),
        PinKey::I2c(_) => ("-".to_string(), "-".to_string()),
    };
    let info = if row.available {
        row.info.clone()
    } else {
        format!("{} (stale)", row.info)
    };
    println!(
        "{:>4} {:>4} {:<10} {:<7} {:<5} {:<14} {}",
        phys,
        bcm,
        row.function,
        row.mode.to_string(),
        row.level_label(),
        row.sensor_label(),
        info
    );
}
