//! Sensorlink CLI - Command-line interface
//!
//! Scan for sensors, stream their telemetry and drive configuration from a
//! terminal or script. Exit codes are listed in `sensorlink_core::cli`.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sensorlink_core::cli::{
    format_capture, format_record, CliResult, Columns, ExitCodes, OutputFormat,
};
use sensorlink_core::config::{self, AppConfig};
use sensorlink_core::core::logger::{generate_log_filename, TrafficLogger};
use sensorlink_core::core::protocol::{
    keys, Command, ProtocolResolver, ReturnRate, WitBle5Resolver, WitSerialResolver,
};
use sensorlink_core::core::sensor::{CalibrationKind, Sensor};
use sensorlink_core::core::session::DeviceSession;
use sensorlink_core::core::simulator::{VirtualSensor, VirtualSensorConfig};
use sensorlink_core::core::transport::{BleTransportManager, ByteChannel, TransportEvent};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const VIRTUAL_ADDRESS: &str = "VIRTUAL:00";

/// Frame layout spoken by the sensor
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Protocol {
    /// BLE 5.0 sensors (20-byte 0x61/0x71 frames)
    Ble5,
    /// Dual-mode sensors (11-byte checksummed frames)
    Serial,
}

/// Calibration procedure
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CalibrateKind {
    /// Accelerometer calibration
    Accel,
    /// Begin magnetic field calibration
    MagStart,
    /// End magnetic field calibration
    MagEnd,
}

impl From<CalibrateKind> for CalibrationKind {
    fn from(kind: CalibrateKind) -> Self {
        match kind {
            CalibrateKind::Accel => Self::Accelerometer,
            CalibrateKind::MagStart => Self::MagneticStart,
            CalibrateKind::MagEnd => Self::MagneticEnd,
        }
    }
}

/// Sensorlink CLI
#[derive(Parser, Debug)]
#[command(
    name = "sensorlink",
    version,
    about = "Session and telemetry tool for wireless inertial sensors",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Sensor address (as reported by `scan`)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Frame layout of the sensor
    #[arg(long, value_enum, default_value_t = Protocol::Ble5, global = true)]
    protocol: Protocol,

    /// Use a built-in virtual sensor instead of Bluetooth
    #[arg(long, global = true)]
    simulate: bool,

    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SENSORLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory for the rolling log file
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Record raw traffic to a file in the log directory
    #[arg(long, global = true)]
    traffic: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan for sensors
    Scan {
        /// Scan duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Print telemetry records as they arrive
    Stream {
        /// Stop after this many seconds (runs until Ctrl+C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Read a register
    ReadReg {
        /// Register address (hex)
        #[arg(value_parser = parse_hex_u8)]
        reg: u8,

        /// Response window in milliseconds (defaults to `[session] default_wait_ms`)
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// Write a register (unlock, write, save)
    WriteReg {
        /// Register address (hex)
        #[arg(value_parser = parse_hex_u8)]
        reg: u8,

        /// Value (decimal, or hex with a 0x prefix)
        #[arg(value_parser = parse_u16)]
        value: u16,
    },

    /// Run a calibration procedure
    Calibrate {
        /// Procedure
        #[arg(short, long, value_enum)]
        kind: CalibrateKind,
    },

    /// Change the output rate
    Rate {
        /// Rate in hertz (1, 2, 5, 10, 20, 50, 100, 200)
        #[arg(long)]
        hz: u32,
    },

    /// Send raw hex bytes and print what comes back
    SendHex {
        /// Bytes, e.g. "FF AA 27 03 00"
        data: String,

        /// Response window in milliseconds (defaults to `[session] default_wait_ms`)
        #[arg(short, long)]
        wait: Option<u64>,
    },

    /// List exit codes
    ExitCodes,
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid register '{}': {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u16::from_str_radix(digits, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid value '{}': {}", s, e))
}

fn parse_hex_bytes(s: &str) -> anyhow::Result<Vec<u8>> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(compact).with_context(|| format!("invalid hex data '{}'", s))
}

/// Install the stderr and daily-file subscribers
fn init_logging(
    cli: &Cli,
    app: &AppConfig,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        app.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = cli.log_dir.clone().or_else(|| app.logging.log_dir.clone());
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "sensorlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Log adapter events until the manager shuts down
fn log_transport_events(manager: &BleTransportManager) -> JoinHandle<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Found(device)) => {
                    tracing::debug!("Found {} ({})", device.name, device.address)
                }
                Ok(TransportEvent::Connected(address)) => tracing::info!("{} connected", address),
                Ok(TransportEvent::Disconnected(address)) => {
                    tracing::warn!("{} disconnected", address)
                }
                Ok(TransportEvent::ConnectionFailed { address, reason }) => {
                    tracing::warn!("{} connection failed: {}", address, reason)
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!("Missed {} transport events", missed)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Open link to one sensor; keeps the adapter alive while in use
struct Link {
    sensor: Sensor,
    manager: Option<(BleTransportManager, JoinHandle<()>)>,
    traffic: Option<Arc<TrafficLogger>>,
}

impl Link {
    async fn close(self) {
        self.sensor.close().await;
        if let Some(traffic) = &self.traffic {
            traffic.flush();
        }
        if let Some((manager, events)) = self.manager {
            manager.shutdown().await;
            events.abort();
        }
    }
}

fn resolver_for(protocol: Protocol) -> Box<dyn ProtocolResolver> {
    match protocol {
        Protocol::Ble5 => Box::new(WitBle5Resolver::new()),
        Protocol::Serial => Box::new(WitSerialResolver::new()),
    }
}

async fn connect(cli: &Cli, app: &AppConfig) -> anyhow::Result<Link> {
    let session_config = app.session.to_session_config();
    let (channel, manager): (Arc<dyn ByteChannel>, _) = if cli.simulate {
        let address = cli.address.as_deref().unwrap_or(VIRTUAL_ADDRESS);
        let device = VirtualSensor::new(address, VirtualSensorConfig::default());
        (Arc::new(device) as Arc<dyn ByteChannel>, None)
    } else {
        let address = cli
            .address
            .as_deref()
            .context("--address is required (run `scan` to list sensors)")?;
        let manager = BleTransportManager::new(app.bluetooth.clone());
        manager.init().await?;
        let events = log_transport_events(&manager);
        if !cli.quiet {
            eprintln!("Looking for {}...", address);
        }
        manager
            .scan(Duration::from_secs(app.bluetooth.scan_secs))
            .await?;
        let channel = manager.channel_for(address)?;
        (Arc::new(channel) as Arc<dyn ByteChannel>, Some((manager, events)))
    };

    let resolver = if cli.simulate {
        resolver_for(Protocol::Ble5)
    } else {
        resolver_for(cli.protocol)
    };
    let session = DeviceSession::with_channel(channel, resolver, session_config);

    let traffic = if cli.traffic || app.logging.traffic {
        let dir = cli
            .log_dir
            .clone()
            .or_else(|| app.logging.log_dir.clone())
            .or_else(config::log_dir)
            .context("no log directory available for traffic logging")?;
        std::fs::create_dir_all(&dir)?;
        let format = app.logging.traffic_format;
        let logger = TrafficLogger::create(
            dir.join(generate_log_filename("traffic", format)),
            format,
        )?;
        logger.attach(&session);
        Some(logger)
    } else {
        None
    };

    let sensor = Sensor::new(session.address().to_string(), session);
    sensor
        .open()
        .await
        .with_context(|| format!("opening {}", sensor.address()))?;
    if !cli.quiet {
        eprintln!("Connected to {}.", sensor.address());
    }

    Ok(Link {
        sensor,
        manager,
        traffic,
    })
}

async fn scan(cli: &Cli, app: &AppConfig, duration: Option<u64>) -> anyhow::Result<CliResult> {
    let devices = if cli.simulate {
        vec![(
            "WT901BLE-VIRTUAL".to_string(),
            VIRTUAL_ADDRESS.to_string(),
            None,
        )]
    } else {
        let secs = duration.unwrap_or(app.bluetooth.scan_secs);
        if !cli.quiet {
            eprintln!("Scanning for sensors for {} seconds...", secs);
        }
        let manager = BleTransportManager::new(app.bluetooth.clone());
        manager.init().await?;
        let events = log_transport_events(&manager);
        let found = manager.scan(Duration::from_secs(secs)).await;
        manager.shutdown().await;
        events.abort();
        let found = found?;
        found
            .into_iter()
            .map(|d| (d.name, d.address, d.rssi))
            .collect()
    };

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = devices
                .iter()
                .map(|(name, address, rssi)| {
                    serde_json::json!({ "name": name, "address": address, "rssi": rssi })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Csv => {
            println!("name,address,rssi");
            for (name, address, rssi) in &devices {
                let rssi = rssi.map(|r| r.to_string()).unwrap_or_default();
                println!("{},{},{}", name, address, rssi);
            }
        }
        OutputFormat::Text => {
            if devices.is_empty() {
                println!("No sensors found.");
            } else {
                println!("{:<30} {:<20} {:>8}", "Name", "Address", "RSSI");
                println!("{:-<60}", "");
                for (name, address, rssi) in &devices {
                    let rssi = rssi
                        .map(|r| format!("{} dBm", r))
                        .unwrap_or_else(|| "N/A".to_string());
                    println!("{:<30} {:<20} {:>8}", name, address, rssi);
                }
            }
        }
    }

    if devices.is_empty() {
        return Ok(CliResult::error(ExitCodes::DEVICE_NOT_FOUND, "no sensors found"));
    }
    Ok(CliResult::success())
}

async fn stream(cli: &Cli, link: &Link, duration: Option<u64>) -> anyhow::Result<CliResult> {
    let columns = Columns::new([
        keys::ACC_X,
        keys::ACC_Y,
        keys::ACC_Z,
        keys::GYRO_X,
        keys::GYRO_Y,
        keys::GYRO_Z,
        keys::ANGLE_X,
        keys::ANGLE_Y,
        keys::ANGLE_Z,
        keys::MAG_X,
        keys::MAG_Y,
        keys::MAG_Z,
        keys::TEMPERATURE,
    ]);
    if matches!(cli.format, OutputFormat::Csv) {
        println!("{}", columns.header());
    }

    let format = cli.format;
    let subscription = link.sensor.on_record(move |store| {
        println!("{}", format_record(&store.snapshot(), format, &columns));
    });

    let stop = Arc::new(Notify::new());
    let handler_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || handler_stop.notify_one())?;

    if !cli.quiet {
        eprintln!("Streaming. Press Ctrl+C to exit.");
    }
    match duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                _ = stop.notified() => {}
            }
        }
        None => stop.notified().await,
    }

    link.sensor.remove_record_observer(subscription);
    let session = link.sensor.session();
    let stats = session.resolver_stats();
    tracing::info!(
        "{}: {} frames decoded, {} bytes skipped",
        link.sensor.address(),
        stats.frames_decoded,
        stats.bytes_skipped
    );
    if let Some(traffic) = session.transport_stats() {
        tracing::info!(
            "{}: {} bytes received in {} notifications, {} bytes sent",
            link.sensor.address(),
            traffic.bytes_received,
            traffic.packets_received,
            traffic.bytes_sent
        );
    }
    Ok(CliResult::success())
}

async fn read_reg(
    cli: &Cli,
    link: &Link,
    reg: u8,
    wait: Option<u64>,
) -> anyhow::Result<CliResult> {
    let window = link
        .sensor
        .session()
        .config()
        .wait_window(wait.map(Duration::from_millis));
    let value = link
        .sensor
        .read_register(reg, window)
        .await
        .with_context(|| format!("reading register {:02X}", reg))?;

    let Some(value) = value else {
        return Ok(CliResult::error(
            ExitCodes::TIMEOUT,
            format!(
                "no reply for register {:02X} within {} ms",
                reg,
                window.as_millis()
            ),
        ));
    };

    match cli.format {
        OutputFormat::Text => println!("{:02X} = {} (0x{:04X})", reg, value, value),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "register": format!("{:02X}", reg), "value": value })
        ),
        OutputFormat::Csv => println!("{:02X},{}", reg, value),
    }
    Ok(CliResult::success())
}

async fn run(cli: &Cli, app: &AppConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::Scan { duration } => scan(cli, app, *duration).await,
        Commands::ExitCodes => {
            for code in [0u8, 1, 2, 3, 4, 8, 12, 13] {
                println!("{:>3}  {}", code, sensorlink_core::cli::exit_code_description(code));
            }
            Ok(CliResult::success())
        }
        Commands::Rate { hz } if ReturnRate::from_hz(*hz).is_none() => Ok(CliResult::error(
            ExitCodes::INVALID_ARGS,
            format!("unsupported rate {} Hz", hz),
        )),
        command => {
            let link = connect(cli, app).await?;
            let result = match command {
                Commands::Stream { duration } => stream(cli, &link, *duration).await,
                Commands::ReadReg { reg, wait } => read_reg(cli, &link, *reg, *wait).await,
                Commands::WriteReg { reg, value } => link
                    .sensor
                    .configure(&Command::WriteRegister {
                        reg: *reg,
                        value: *value,
                    })
                    .await
                    .map(|_| CliResult::success())
                    .with_context(|| format!("writing register {:02X}", reg)),
                Commands::Calibrate { kind } => link
                    .sensor
                    .calibrate((*kind).into())
                    .await
                    .map(|_| CliResult::success())
                    .context("calibration failed"),
                Commands::Rate { hz } => match ReturnRate::from_hz(*hz) {
                    Some(rate) => link
                        .sensor
                        .configure(&Command::SetReturnRate(rate))
                        .await
                        .map(|_| CliResult::success())
                        .context("setting output rate"),
                    None => Ok(CliResult::error(ExitCodes::INVALID_ARGS, "unsupported rate")),
                },
                Commands::SendHex { data, wait } => match parse_hex_bytes(data) {
                    Ok(bytes) => link
                        .sensor
                        .session()
                        .send_and_wait(
                            &bytes,
                            link.sensor
                                .session()
                                .config()
                                .wait_window(wait.map(Duration::from_millis)),
                        )
                        .await
                        .map(|capture| {
                            println!("{}", format_capture(&capture, cli.format));
                            CliResult::success()
                        })
                        .context("exchange failed"),
                    Err(e) => Ok(CliResult::error(ExitCodes::INVALID_ARGS, format!("{:#}", e))),
                },
                Commands::Scan { .. } | Commands::ExitCodes => Ok(CliResult::success()),
            };
            link.close().await;
            result
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let app = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    let app = match app {
        Ok(app) => app,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let _guard = match init_logging(&cli, &app) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let result = run(&cli, &app).await.unwrap_or_else(CliResult::from);
    if let CliResult::Error(_, msg) = &result {
        eprintln!("Error: {}", msg);
    }
    result.to_exit_code()
}
