use clap::{Parser, ValueEnum};
use relay_gate::audio::{ClipPlayer, CommandPlayer};
use relay_gate::config::ConfigStore;
use relay_gate::consts;
use relay_gate::homeassistant::{self, bridge};
use relay_gate::http::{self, AppState};
use relay_gate::hw::sim::SimGpio;
use relay_gate::hw::sysfs::SysfsGpio;
use relay_gate::hw::Gpio;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum GpioBackend {
    /// In-memory lines, for running without hardware.
    Sim,
    /// /sys/class/gpio
    Sysfs,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PlayerBackend {
    /// External player program, see --player-command.
    Command,
    /// Native playback (needs the `rodio` feature).
    Rodio,
}

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.json")]
    config_path: String,

    // Hardware
    #[arg(long, value_enum, default_value_t = GpioBackend::Sysfs)]
    gpio: GpioBackend,

    // HTTP, overriding the `server` section
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,

    // Audio
    #[arg(long, value_enum, default_value_t = PlayerBackend::Command)]
    player: PlayerBackend,
    /// Placeholders: {file}, {volume} (0-100), {scale} (0-32768).
    #[arg(long, default_value = CommandPlayer::DEFAULT_COMMAND)]
    player_command: String,

    // MQTT connection; Home Assistant integration is off without a host.
    #[arg(long)]
    mqtt_host: Option<String>,
    #[arg(long, default_value_t = 1883)]
    mqtt_port: u16,
    #[arg(long, default_value = "")]
    mqtt_username: String,
    #[arg(long, default_value = "")]
    mqtt_password: String,

    // Other
    #[arg(long, default_value = "relay-gate")]
    device_name: String,
}

/// Map the configured level (Python style names are accepted) to a filter.
fn level_filter(level: &str) -> LevelFilter {
    match level.to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => LevelFilter::ERROR,
        "WARNING" | "WARN" => LevelFilter::WARN,
        "DEBUG" => LevelFilter::DEBUG,
        "TRACE" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

fn init_log(level: LevelFilter) -> anyhow::Result<()> {
    let timer = fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_string());

    // Configure a custom event formatter
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_source_location(true)
        .with_timer(timer)
        .compact();

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env()?
        .add_directive("rumqttc=info".parse()?);

    fmt().event_format(format).with_env_filter(filter).init();
    Ok(())
}

fn make_player(args: &Args) -> anyhow::Result<Arc<dyn ClipPlayer>> {
    match args.player {
        PlayerBackend::Command => Ok(Arc::new(CommandPlayer::parse(&args.player_command)?)),
        #[cfg(feature = "rodio")]
        PlayerBackend::Rodio => Ok(Arc::new(relay_gate::audio::RodioPlayer)),
        #[cfg(not(feature = "rodio"))]
        PlayerBackend::Rodio => anyhow::bail!("Built without the rodio feature"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Unable to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let store = ConfigStore::open(&args.config_path)?;
    let config = store.config()?;
    init_log(level_filter(&config.logging.log_level))?;
    info!(
        "Starting {} {}. Config: {}, GPIO: {:?}, player: {:?}",
        consts::GATE_NAME,
        consts::GATE_VERSION,
        store.path().display(),
        args.gpio,
        args.player
    );

    let gpio: Arc<dyn Gpio> = match args.gpio {
        GpioBackend::Sim => Arc::new(SimGpio::new()),
        GpioBackend::Sysfs => Arc::new(SysfsGpio::new()),
    };
    let player = make_player(&args)?;
    let state = AppState::start(gpio, player, store).await?;

    let bridge_task = match &args.mqtt_host {
        Some(host) => {
            let ha = homeassistant::Initiator::new(
                &args.device_name,
                host,
                args.mqtt_port,
                &args.mqtt_username,
                &args.mqtt_password,
            )
            .await?
            .start()
            .await;
            let device = args.device_name.clone();
            let coordinator = state.coordinator.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = bridge::run(ha, &device, coordinator).await {
                    error!("Home Assistant bridge failed: {:?}", e);
                }
            }))
        }
        None => {
            info!("No MQTT host given, Home Assistant integration disabled");
            None
        }
    };

    let host = args.host.clone().unwrap_or(config.server.host);
    let port = args.port.unwrap_or(config.server.port);
    info!("{} initialized.", consts::GATE_NAME);
    let result = http::serve(state.clone(), &host, port, shutdown_signal()).await;

    if let Some(task) = bridge_task {
        task.abort();
    }
    state.shutdown().await;
    info!("{} stopped.", consts::GATE_NAME);
    result
}
