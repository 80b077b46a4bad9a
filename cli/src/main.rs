use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ltbnet_cli::bus_server::{run_bus_server, BusServerConfig};
use ltbnet_cli::{dump, logging};
use ltbnet_core::bus::{self, RetryPolicy};
use ltbnet_core::config::{AggregatorConfig, PmuConfig, SourceAddr};
use ltbnet_core::index_map::IndexLayout;
use ltbnet_core::pdc_client::PdcClient;
use ltbnet_core::pmu_server::PmuServer;
use ltbnet_core::sample_store::BufferKind;
use ltbnet_core::{PdcAggregator, VirtualPmu};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "ltbnet")]
#[command(about = "Virtual PMUs, islanding PDC and bus hub for co-simulation", long_about = None)]
struct Cli {
    /// Also write hourly rolling log files here.
    #[arg(long, global = true, env = "LTBNET_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a virtual PMU fed by the simulator.
    Pmu(PmuArgs),
    /// Run the islanding aggregator against a set of PMUs.
    Pdc(PdcArgs),
    /// Run the bus hub.
    Bus {
        #[arg(long, default_value = "127.0.0.1", env = "LTBNET_BUS_IP")]
        ip: String,
        #[arg(long, default_value_t = 5000, env = "LTBNET_BUS_PORT")]
        port: u16,
    },
}

#[derive(Debug, Args)]
struct PmuArgs {
    #[arg(long, default_value = "PMU", env = "LTBNET_PMU_NAME")]
    name: String,
    #[arg(long, default_value = "tcp://127.0.0.1:5000", env = "LTBNET_BUS_ADDRESS")]
    bus: String,
    /// Monitored bus indices, 1-based.
    #[arg(long, value_delimiter = ',', required = true, env = "LTBNET_PMU_NODES")]
    nodes: Vec<u32>,
    /// Layout of pmudata: `interleaved` ([vm, am, w] per bus) or `idxvgs`.
    #[arg(long, default_value_t = IndexLayout::Interleaved, env = "LTBNET_PMU_LAYOUT")]
    layout: IndexLayout,
    #[arg(long, default_value = "0.0.0.0", env = "LTBNET_PMU_IP")]
    listen_ip: String,
    #[arg(long, default_value_t = 1410, env = "LTBNET_PMU_PORT")]
    port: u16,
    #[arg(long, default_value_t = 60.0, env = "LTBNET_NOMINAL_FREQUENCY")]
    nominal_frequency: f64,
    /// Fallback voltage base for buses missing from SysParam.
    #[arg(long, default_value_t = 110.0, env = "LTBNET_VOLTAGE_BASE_KV")]
    voltage_base_kv: f64,
    /// Gaussian noise standard deviation, per unit.
    #[arg(long, default_value_t = 0.0, env = "LTBNET_NOISE")]
    noise: f64,
    #[arg(long, default_value_t = 30, env = "LTBNET_DATA_RATE")]
    data_rate: u16,
    /// Keep the recording across DONE.
    #[arg(long, env = "LTBNET_RETAIN_DATA")]
    retain_data: bool,
    /// Write the record buffer as an Arrow IPC file on shutdown.
    #[arg(long, env = "LTBNET_DUMP_RECORD")]
    dump_record: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PdcArgs {
    #[arg(long, default_value = "ISLANDING", env = "LTBNET_PDC_NAME")]
    name: String,
    #[arg(long, default_value = "tcp://127.0.0.1:5000", env = "LTBNET_BUS_ADDRESS")]
    bus: String,
    /// PMUs as host:port[@idcode], one per region.
    #[arg(long, value_delimiter = ',', required = true, env = "LTBNET_PDC_SOURCES")]
    sources: Vec<SourceAddr>,
    #[arg(long, default_value_t = 60.0, env = "LTBNET_NOMINAL_FREQUENCY")]
    nominal_frequency: f64,
    #[arg(long, default_value_t = 0.4, env = "LTBNET_TRIP_THRESHOLD_HZ")]
    trip_threshold_hz: f64,
    #[arg(long, default_value_t = 1.0, env = "LTBNET_SPURIOUS_GUARD_HZ")]
    spurious_guard_hz: f64,
    /// Seconds the divergence must persist before tripping.
    #[arg(long, default_value_t = 7.0, env = "LTBNET_ISLANDING_DELAY")]
    delay: f64,
    /// Write the divergence history as an Arrow IPC file on shutdown.
    #[arg(long, env = "LTBNET_DUMP_HISTORY")]
    dump_history: Option<PathBuf>,
}

fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
        }
        flag.store(true, Ordering::Relaxed);
    });
    stop
}

fn run_pmu(args: PmuArgs, stop: &AtomicBool) -> anyhow::Result<()> {
    let config = PmuConfig {
        name: args.name,
        nodes: args.nodes,
        layout: args.layout,
        listen_ip: args.listen_ip,
        port: args.port,
        nominal_frequency: args.nominal_frequency,
        voltage_base_kv: args.voltage_base_kv,
        noise_level: args.noise,
        data_rate: args.data_rate,
        retain_data: args.retain_data,
        ..Default::default()
    };
    config.validate()?;

    let server = PmuServer::bind(&config.listen_ip, config.port)
        .with_context(|| format!("binding PMU server on {}:{}", config.listen_ip, config.port))?;
    let bus = bus::connect(&config.name, &args.bus, &RetryPolicy::default())?;
    let mut pmu = VirtualPmu::new(config, server)?;

    let result = pmu.run(&bus, stop);
    pmu.sink_mut().shutdown();

    if let Some(path) = args.dump_record {
        let batch = pmu.record_batch(BufferKind::Record)?;
        dump::write_ipc(&path, &batch)?;
    }
    Ok(result?)
}

fn run_pdc(args: PdcArgs, stop: &AtomicBool) -> anyhow::Result<()> {
    let config = AggregatorConfig {
        name: args.name.clone(),
        sources: args.sources,
        nominal_frequency: args.nominal_frequency,
        trip_threshold_hz: args.trip_threshold_hz,
        spurious_guard_hz: args.spurious_guard_hz,
        islanding_delay: Duration::try_from_secs_f64(args.delay)
            .context("--delay must be a non-negative number of seconds")?,
        ..Default::default()
    };
    let mut aggregator = PdcAggregator::new(config)?;
    let bus = bus::connect(&args.name, &args.bus, &RetryPolicy::default())?;

    let result = aggregator.run(
        &bus,
        |addr: &SourceAddr| PdcClient::connect(&addr.ip, addr.port, addr.idcode),
        stop,
    );
    info!("Islanding decision at exit: {:?}", aggregator.state());

    if let Some(path) = args.dump_history {
        dump::write_ipc(&path, &aggregator.history_batch()?)?;
    }
    Ok(result?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let file_name = match &cli.command {
        Commands::Pmu(_) => "ltbnet_pmu.log",
        Commands::Pdc(_) => "ltbnet_pdc.log",
        Commands::Bus { .. } => "ltbnet_bus.log",
    };
    let _guard = logging::init(cli.log_dir.as_deref(), file_name)?;

    match cli.command {
        Commands::Bus { ip, port } => {
            tokio::select! {
                result = run_bus_server(BusServerConfig::new(ip, port)) => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
            }
        }
        Commands::Pmu(args) => {
            let stop = stop_on_ctrl_c();
            tokio::task::spawn_blocking(move || run_pmu(args, &stop)).await??;
        }
        Commands::Pdc(args) => {
            let stop = stop_on_ctrl_c();
            tokio::task::spawn_blocking(move || run_pdc(args, &stop)).await??;
        }
    }
    Ok(())
}
