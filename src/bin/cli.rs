//! Buslink CLI - Command-line interface
//!
//! Talks to field devices on a half-duplex serial bus for diagnostics and
//! scripted polling.

use anyhow::Context;
use buslink_core::cli::{print_exit_codes, CliResult, ExitCodes, OutputFormat};
use buslink_core::config::{default_config_path, LinkConfig};
use buslink_core::core::batch::{BatchResult, ErrorStrategy, PollBatch, RequestOutcome};
use buslink_core::core::logger::TrafficLogger;
use buslink_core::core::protocol::modbus::{self, FunctionCode};
use buslink_core::core::protocol::FrameProfile;
use buslink_core::core::simulator::{DeviceTemplates, SimulatedBus};
use buslink_core::core::timing::TimingProfile;
use buslink_core::core::retry::RetryPolicy;
use buslink_core::core::transaction::{Bus, BusOptions};
use buslink_core::core::transport::{
    list_ports, ChannelConfig, ControlLine, DirectionControl, SerialParity, SerialTransport,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Buslink CLI
#[derive(Parser, Debug)]
#[command(
    name = "buslink-cli",
    author = "Buslink Team",
    version,
    about = "Half-duplex RS-485/UART bus master",
    long_about = None
)]
struct Cli {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Link configuration file
    #[arg(short, long, env = "BUSLINK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Write diagnostic logs (JSON lines) to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Record bus traffic to this file
    #[arg(long, global = true)]
    traffic_log: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show detailed info
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the timing derived for a channel
    Timing {
        #[command(flatten)]
        channel: ChannelArgs,
    },

    /// Send a request and print the response
    Send {
        #[command(flatten)]
        channel: ChannelArgs,

        /// Request bytes as hex (e.g. "01 03 00 00 00 02")
        data: String,

        /// Do not wait for a response
        #[arg(long)]
        no_response: bool,

        /// Append the Modbus CRC and decode the response
        #[arg(long = "modbus")]
        as_modbus: bool,
    },

    /// Wait for frames without sending
    Listen {
        #[command(flatten)]
        channel: ChannelArgs,

        /// Wait per frame (milliseconds)
        #[arg(short, long, default_value = "5000")]
        timeout: u64,

        /// Number of frames to receive
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,

        /// Only show Modbus requests addressed to these units
        #[arg(short, long, value_delimiter = ',')]
        units: Vec<u8>,
    },

    /// Run the poll list from the configuration file
    Poll {
        #[command(flatten)]
        channel: ChannelArgs,

        /// What to do after a failed request
        #[arg(long, value_enum, default_value_t = StrategyArg::SkipSlave)]
        on_error: StrategyArg,
    },

    /// Poll a simulated Modbus slave
    Simulate {
        /// Baud rate of the simulated line
        #[arg(short, long, default_value = "9600")]
        baud: u32,

        /// Simulated slave address
        #[arg(short, long, default_value = "1")]
        slave: u8,

        /// Register reads to issue
        #[arg(short = 'n', long, default_value = "4")]
        count: u16,
    },

    /// Check system information
    Info,
}

/// Channel parameters; anything given here overrides the configuration file
#[derive(Args, Debug, Clone)]
struct ChannelArgs {
    /// Serial port name (e.g., COM3, /dev/ttyUSB0)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,

    /// Data bits (5-8)
    #[arg(long)]
    data_bits: Option<u8>,

    /// Parity (none, odd, even)
    #[arg(long)]
    parity: Option<SerialParity>,

    /// Stop bits (1, 2)
    #[arg(long)]
    stop_bits: Option<u8>,

    /// Direction-control line of the transceiver
    #[arg(long, value_enum)]
    direction: Option<DirectionArg>,

    /// Drive the direction line low to transmit
    #[arg(long)]
    invert_direction: bool,

    /// First-byte timeout (milliseconds)
    #[arg(long)]
    response_timeout: Option<u64>,

    /// Attempts per request
    #[arg(long)]
    attempts: Option<u32>,
}

impl ChannelArgs {
    fn apply(&self, config: &mut LinkConfig) {
        let channel = &mut config.channel;
        if let Some(port) = &self.port {
            channel.port.clone_from(port);
        }
        if let Some(baud) = self.baud {
            channel.baud_rate = baud;
        }
        if let Some(bits) = self.data_bits {
            channel.data_bits = bits;
        }
        if let Some(parity) = self.parity {
            channel.parity = parity;
        }
        if let Some(bits) = self.stop_bits {
            channel.stop_bits = bits;
        }
        match self.direction {
            Some(DirectionArg::None) => channel.direction = None,
            Some(DirectionArg::Rts) => channel.direction = Some(DirectionControl::new(ControlLine::Rts)),
            Some(DirectionArg::Dtr) => channel.direction = Some(DirectionControl::new(ControlLine::Dtr)),
            None => {}
        }
        if self.invert_direction {
            channel.direction = Some(channel.direction.unwrap_or_default().inverted());
        }
        if let Some(ms) = self.response_timeout {
            config.timing.response_timeout_ms = Some(ms);
        }
        if let Some(attempts) = self.attempts {
            config.retry.max_attempts = attempts;
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    /// Request To Send
    Rts,
    /// Data Terminal Ready
    Dtr,
    /// Automatic direction control in the adapter
    None,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    /// Stop at the first failure
    Stop,
    /// Send every request
    Continue,
    /// Skip further requests to a slave that failed
    SkipSlave,
}

impl From<StrategyArg> for ErrorStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Stop => ErrorStrategy::StopOnError,
            StrategyArg::Continue => ErrorStrategy::ContinueOnError,
            StrategyArg::SkipSlave => ErrorStrategy::SkipFailedSlave,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let _log_guard = match init_tracing(&cli, &config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::from(ExitCodes::ERROR);
        }
    };

    let result = match run(&cli, config).await {
        Ok(result) => result,
        Err(e) => CliResult::error(ExitCodes::ERROR, format!("{e:#}")),
    };

    if let Some(msg) = result.message() {
        eprintln!("Error: {msg}");
    }
    result.to_exit_code()
}

fn load_config(cli: &Cli) -> anyhow::Result<LinkConfig> {
    let config = match &cli.config {
        Some(path) => LinkConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => LinkConfig::load()?,
    };
    Ok(config)
}

fn init_tracing(cli: &Cli, config: &LinkConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let mut guard = None;
    let file_layer = match cli.log_file.as_ref().or(config.logging.file.as_ref()) {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let name = path
                .file_name()
                .context("log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir.unwrap_or(std::path::Path::new(".")), name);
            let (writer, worker) = tracing_appender::non_blocking(appender);
            guard = Some(worker);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .json(),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("installing log subscriber")?;

    Ok(guard)
}

async fn run(cli: &Cli, mut config: LinkConfig) -> anyhow::Result<CliResult> {
    match &cli.command {
        Commands::ListPorts { detailed } => list_serial_ports(cli, *detailed),
        Commands::Timing { channel } => {
            channel.apply(&mut config);
            show_timing(cli, &config)
        }
        Commands::Send {
            channel,
            data,
            no_response,
            as_modbus,
        } => {
            channel.apply(&mut config);
            if *as_modbus {
                config.framing = FrameProfile::modbus_rtu();
            }
            send_request(cli, &config, data, *no_response, *as_modbus).await
        }
        Commands::Listen {
            channel,
            timeout,
            count,
            units,
        } => {
            channel.apply(&mut config);
            listen(cli, &config, Duration::from_millis(*timeout), *count, units).await
        }
        Commands::Poll { channel, on_error } => {
            channel.apply(&mut config);
            poll(cli, &config, (*on_error).into()).await
        }
        Commands::Simulate { baud, slave, count } => simulate(cli, *baud, *slave, *count).await,
        Commands::Info => show_info(cli),
    }
}

/// Cancelled when the user presses Ctrl-C
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

fn bus_options(cli: &Cli, config: &LinkConfig) -> anyhow::Result<BusOptions> {
    let mut options = config.bus_options();
    if let Some(path) = cli.traffic_log.as_ref().or(config.logging.traffic_log.as_ref()) {
        let mut logger = TrafficLogger::new();
        logger
            .start(path, config.logging.traffic_format)
            .with_context(|| format!("opening traffic log {}", path.display()))?;
        options = options.traffic(logger.shared());
    }
    Ok(options)
}

fn open_bus(cli: &Cli, config: &LinkConfig) -> anyhow::Result<Result<Bus, CliResult>> {
    let options = bus_options(cli, config)?;
    if !cli.quiet {
        eprintln!("Opening {}...", config.channel.describe());
    }
    let transport = match SerialTransport::open(config.channel.clone()) {
        Ok(transport) => transport,
        Err(e) => return Ok(Err(e.into())),
    };
    Ok(Bus::new(transport, options).map_err(CliResult::from))
}

fn list_serial_ports(cli: &Cli, detailed: bool) -> anyhow::Result<CliResult> {
    let ports = match list_ports() {
        Ok(ports) => ports,
        Err(e) => return Ok(e.into()),
    };

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    match cli.format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = ports
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "name": p.port_name,
                        "type": port_type(&p.port_type),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {:<24} {}", port.port_name, port_type(&port.port_type));
                }
            } else {
                for port in &ports {
                    println!("{}", port.port_name);
                }
            }
        }
    }

    Ok(CliResult::success())
}

fn port_type(kind: &serialport::SerialPortType) -> String {
    match kind {
        serialport::SerialPortType::UsbPort(usb) => format!(
            "USB {:04x}:{:04x} {}",
            usb.vid,
            usb.pid,
            usb.product.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string(),
        serialport::SerialPortType::PciPort => "PCI".to_string(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
        serialport::SerialPortType::Unknown => "Unknown".to_string(),
    }
}

fn show_timing(cli: &Cli, config: &LinkConfig) -> anyhow::Result<CliResult> {
    if let Err(e) = config.validate() {
        return Ok(e.into());
    }
    let timing = config.timing_profile();
    let sample_len = modbus::FIXED_RESPONSE_LEN;

    match cli.format {
        OutputFormat::Json => {
            let info = serde_json::json!({
                "channel": config.channel.describe(),
                "inter_frame_silence_us": timing.inter_frame_silence_us(),
                "character_time_us": u64::try_from(timing.character_time().as_micros()).unwrap_or(u64::MAX),
                "response_timeout_ms": millis(timing.response_timeout),
                "frame_timeout_ms": millis(timing.frame_timeout),
                "poll_interval_ms": millis(timing.poll_interval),
                "max_polls": timing.max_polls,
                "transmit_timeout_ms": millis(timing.transmit_timeout(sample_len)),
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        OutputFormat::Text => {
            print_timing(&config.channel, &timing);
            println!(
                "  Transmit timeout:   {:?} ({sample_len} bytes)",
                timing.transmit_timeout(sample_len)
            );
        }
    }
    Ok(CliResult::success())
}

fn print_timing(channel: &ChannelConfig, timing: &TimingProfile) {
    println!("Channel: {}", channel.describe());
    println!("  Inter-frame silence: {} us", timing.inter_frame_silence_us());
    println!("  Character time:      {:?}", timing.character_time());
    println!("  Response timeout:    {:?}", timing.response_timeout);
    println!("  Frame timeout:       {:?}", timing.frame_timeout);
    println!("  Poll interval:       {:?} (max {} polls)", timing.poll_interval, timing.max_polls);
}

async fn send_request(
    cli: &Cli,
    config: &LinkConfig,
    data: &str,
    no_response: bool,
    as_modbus: bool,
) -> anyhow::Result<CliResult> {
    let mut request = match hex::decode(data.split_whitespace().collect::<String>()) {
        Ok(bytes) => bytes,
        Err(e) => return Ok(CliResult::error(ExitCodes::INVALID_ARGS, format!("invalid hex request: {e}"))),
    };
    if as_modbus {
        request = modbus::with_crc(&request);
    }

    let bus = match open_bus(cli, config)? {
        Ok(bus) => bus,
        Err(result) => return Ok(result),
    };
    let cancel = ctrl_c_token();
    let started = Instant::now();

    if no_response {
        if let Err(e) = bus.send_with_cancel(request.clone(), &cancel).await {
            return Ok(e.into());
        }
        if !cli.quiet {
            eprintln!("Sent {} bytes", request.len());
        }
        return Ok(CliResult::success());
    }

    let response = match bus.send_receive_with_cancel(request.clone(), &cancel).await {
        Ok(response) => response,
        Err(e) => return Ok(e.into()),
    };
    let elapsed = started.elapsed();

    let decoded = as_modbus.then(|| modbus::check_response(&request, &response));
    match cli.format {
        OutputFormat::Json => {
            let mut json = serde_json::json!({
                "request": hex::encode(&request),
                "response": response.to_hex(),
                "elapsed_ms": millis(elapsed),
            });
            match &decoded {
                Some(Ok(rtu)) => {
                    json["registers"] = serde_json::json!(registers_of(rtu));
                }
                Some(Err(e)) => json["modbus_error"] = serde_json::json!(e.to_string()),
                None => {}
            }
            println!("{json}");
        }
        OutputFormat::Text => {
            println!("{response}");
            match &decoded {
                Some(Ok(rtu)) => {
                    if let Some(registers) = registers_of(rtu) {
                        println!("registers: {registers:?}");
                    }
                }
                Some(Err(e)) => println!("modbus: {e}"),
                None => {}
            }
            if cli.verbose {
                eprintln!("{:?} round trip", elapsed);
            }
        }
    }

    Ok(CliResult::success())
}

fn registers_of(rtu: &modbus::RtuResponse) -> Option<Vec<u16>> {
    matches!(
        FunctionCode::from_u8(rtu.function),
        Some(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters)
    )
    .then(|| rtu.registers())
}

async fn listen(
    cli: &Cli,
    config: &LinkConfig,
    timeout: Duration,
    count: usize,
    units: &[u8],
) -> anyhow::Result<CliResult> {
    let bus = match open_bus(cli, config)? {
        Ok(bus) => bus,
        Err(result) => return Ok(result),
    };
    let cancel = ctrl_c_token();

    let mut received = 0;
    while received < count {
        let frame = match bus.receive_with_cancel(timeout, &cancel).await {
            Ok(frame) => frame,
            Err(e) => return Ok(e.into()),
        };

        if !units.is_empty() {
            if let Err(e) = modbus::accept_request(&frame, units) {
                tracing::debug!(frame = %frame.to_hex(), reason = %e, "frame ignored");
                continue;
            }
        }

        received += 1;
        match cli.format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::json!({ "index": received, "frame": frame.to_hex(), "len": frame.len() })
            ),
            OutputFormat::Text => println!("{frame}"),
        }
    }

    Ok(CliResult::success())
}

async fn poll(cli: &Cli, config: &LinkConfig, strategy: ErrorStrategy) -> anyhow::Result<CliResult> {
    let batch = match config.poll_batch() {
        Ok(batch) => batch.with_error_strategy(strategy),
        Err(e) => return Ok(e.into()),
    };
    if batch.requests.is_empty() {
        let hint = cli
            .config
            .clone()
            .or_else(default_config_path)
            .map_or_else(|| "the config file".to_string(), |p| p.display().to_string());
        return Ok(CliResult::error(
            ExitCodes::CONFIG_ERROR,
            format!("no requests to poll; add `requests = [...]` to {hint}"),
        ));
    }

    let bus = match open_bus(cli, config)? {
        Ok(bus) => bus,
        Err(result) => return Ok(result),
    };
    let result = batch.run_with_cancel(&bus, &ctrl_c_token()).await;
    print_batch(cli, &result)?;
    Ok(batch_exit(&result))
}

async fn simulate(cli: &Cli, baud: u32, slave: u8, count: u16) -> anyhow::Result<CliResult> {
    let channel = ChannelConfig::new("simulated", baud).direction(DirectionControl::default());
    let registers: Vec<u16> = (0..count.max(1)).map(|i| i.wrapping_mul(100)).collect();
    let sim = SimulatedBus::new(channel.clone(), DeviceTemplates::modbus_slave(slave, registers));
    let handle = sim.handle();

    let options = BusOptions::default()
        .name("simulated")
        .frame(FrameProfile::modbus_rtu())
        .retry(RetryPolicy::new(2));
    let bus = match Bus::new(sim, options) {
        Ok(bus) => bus,
        Err(e) => return Ok(e.into()),
    };

    if !cli.quiet && matches!(cli.format, OutputFormat::Text) {
        print_timing(&channel, bus.timing());
        println!();
    }

    let absent = slave.wrapping_add(1).max(1);
    let mut batch = PollBatch::new("simulation");
    for register in 0..count {
        batch = batch.with_request(modbus::build_rtu_request(
            slave,
            FunctionCode::ReadHoldingRegisters,
            register,
            1,
        ));
    }
    batch = batch
        .with_request(modbus::build_rtu_request(absent, FunctionCode::ReadHoldingRegisters, 0, 1))
        .with_request(modbus::build_rtu_request(slave, FunctionCode::WriteSingleCoil, 0, 0xFF00));

    let result = batch.run_with_cancel(&bus, &ctrl_c_token()).await;
    print_batch(cli, &result)?;

    if !cli.quiet && matches!(cli.format, OutputFormat::Text) {
        let stats = bus.stats();
        println!();
        println!(
            "Transactions: {} ({} ok, {} failed, {} retries)",
            stats.transactions, stats.completed, stats.failed, stats.retries
        );
        println!(
            "Writes while receiving: {}, line now {}",
            handle.writes_while_receiving(),
            handle.direction()
        );
    }

    // failures are part of the demo
    Ok(if result.cancelled {
        CliResult::error(ExitCodes::CANCELLED, "simulation cancelled")
    } else {
        CliResult::success()
    })
}

fn print_batch(cli: &Cli, result: &BatchResult) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let items: Vec<serde_json::Value> = result
                .results
                .iter()
                .map(|r| {
                    let (status, detail) = match &r.outcome {
                        RequestOutcome::Response(frame) => ("ok", frame.to_hex()),
                        RequestOutcome::Failed(e) => ("failed", e.to_string()),
                        RequestOutcome::Skipped => ("skipped", String::new()),
                    };
                    serde_json::json!({
                        "index": r.index,
                        "slave": r.slave,
                        "request": r.request.to_hex(),
                        "status": status,
                        "detail": detail,
                        "elapsed_ms": millis(r.duration),
                    })
                })
                .collect();
            let json = serde_json::json!({
                "batch": result.name,
                "cancelled": result.cancelled,
                "results": items,
                "summary": result.summary(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            for r in &result.results {
                let line = match &r.outcome {
                    RequestOutcome::Response(frame) => format!("{frame}"),
                    RequestOutcome::Failed(e) => format!("FAILED {e}"),
                    RequestOutcome::Skipped => "skipped".to_string(),
                };
                println!("[{:>3}] slave {:>3}  {}  ->  {}", r.index, r.slave, r.request, line);
            }
            if !cli.quiet {
                println!("{}", result.summary());
            }
        }
    }
    Ok(())
}

fn batch_exit(result: &BatchResult) -> CliResult {
    match result.first_error() {
        Some(e) => CliResult::from(e),
        None => CliResult::success(),
    }
}

fn show_info(cli: &Cli) -> anyhow::Result<CliResult> {
    let config_path = default_config_path().map(|p| p.display().to_string());
    let info = serde_json::json!({
        "version": buslink_core::VERSION,
        "config": config_path,
        "framing": ["silence", "terminator", "modbus_rtu"],
        "checksums": ["xor", "lrc", "sum8", "crc16_modbus", "crc16_ccitt", "crc16_xmodem"],
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH
    });

    match cli.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        OutputFormat::Text => {
            println!("Buslink v{}", buslink_core::VERSION);
            println!("Platform: {} ({})", std::env::consts::OS, std::env::consts::ARCH);
            println!(
                "Config file: {}",
                config_path.as_deref().unwrap_or("(no config directory)")
            );
            println!();
            println!("Frame boundaries: bus silence, terminator bytes, Modbus RTU header");
            println!("Checksums: XOR, LRC, SUM8, CRC-16 (Modbus, CCITT, XMODEM)");
            println!();
            print_exit_codes();
        }
    }

    Ok(CliResult::success())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
