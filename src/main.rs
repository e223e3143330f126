//! trapmux - Main Application Entry Point
//!
//! SNMP trap and inform receiver
//! Developed by GoCortex.io

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use futures_util::stream::StreamExt;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use trapmux::config::{CliOverrides, Config, DaemonConfig, LoggingConfig};
use trapmux::dispatch::{Dispatcher, DnsResolver, Lifecycle};
use trapmux::event_loop::{self, ControlFlags};
use trapmux::output::{Facility, OutputTarget, Outputs, SyslogTarget};
use trapmux::reconfig::{ConfigSource, Reconfigurator};
use trapmux::transport::{TcpSession, TransportMode, TransportSession, UdpSession};

const DEFAULT_CONFIG_PATH: &str = "/etc/trapmux/trapmux.json";

fn build_cli() -> Command {
    Command::new("trapmux")
        .version(env!("CARGO_PKG_VERSION"))
        .about("trapmux receives SNMP traps and informs and routes them to the console, syslog and external handlers.\n\nhttps://gocortex.io")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("no-config")
                .short('C')
                .long("no-config")
                .help("Do not read any configuration file")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("Port to listen on")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("transport")
                .short('T')
                .long("transport")
                .value_name("udp|tcp")
                .help("Transport to listen on"),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Local address to bind"),
        )
        .arg(
            Arg::new("print")
                .short('P')
                .long("print")
                .help("Print received traps to stdout")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("FILE")
                .help("Write received traps to FILE"),
        )
        .arg(
            Arg::new("syslog")
                .short('s')
                .long("syslog")
                .help("Log received traps to syslog")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("facility")
                .short('l')
                .long("facility")
                .value_name("d|0-7")
                .help("Syslog facility: d for daemon, 0-7 for local0-local7"),
        )
        .arg(
            Arg::new("event")
                .short('e')
                .long("event")
                .help("Decode threshold alarm notifications")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("drop-auth")
                .short('a')
                .long("drop-auth")
                .help("Do not print or log authentication failure traps")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("numeric")
                .short('n')
                .long("numeric")
                .help("Use numeric addresses instead of resolving host names")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("format")
                .short('F')
                .long("format")
                .value_name("FMT")
                .help("Print format for all traps"),
        )
        .arg(
            Arg::new("foreground")
                .short('f')
                .long("foreground")
                .help("Stay in the foreground and log to the console")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("pid-file")
                .short('u')
                .long("pid-file")
                .value_name("FILE")
                .help("Write the process id to FILE"),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .help("Enable debug logging")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .help("Generate a default configuration file and exit")
                .action(ArgAction::SetTrue),
        )
}

fn cli_overrides(matches: &ArgMatches) -> Result<CliOverrides> {
    let transport = matches
        .get_one::<String>("transport")
        .map(|value| value.parse::<TransportMode>())
        .transpose()?;
    let facility = matches
        .get_one::<String>("facility")
        .map(|value| value.parse::<Facility>())
        .transpose()?;

    Ok(CliOverrides {
        port: matches.get_one::<u16>("port").copied(),
        transport,
        bind_address: matches.get_one::<String>("bind").cloned(),
        print: matches.get_flag("print"),
        output_file: matches.get_one::<String>("output").cloned(),
        syslog: matches.get_flag("syslog"),
        facility,
        event_decode: matches.get_flag("event"),
        drop_auth: matches.get_flag("drop-auth"),
        numeric: matches.get_flag("numeric"),
        format: matches.get_one::<String>("format").cloned(),
    })
}

fn config_source(matches: &ArgMatches) -> ConfigSource {
    if matches.get_flag("no-config") {
        return ConfigSource::Defaults;
    }
    match matches.get_one::<String>("config") {
        Some(path) => ConfigSource::File {
            path: PathBuf::from(path),
            required: true,
        },
        None => ConfigSource::File {
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            required: false,
        },
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("generate-config") {
        let path = matches
            .get_one::<String>("config")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        return generate_default_config(&path).await;
    }

    let cli = cli_overrides(&matches)?;
    let source = config_source(&matches);
    let foreground = matches.get_flag("foreground");

    let file_config = source.load().await.context("Failed to load configuration")?;
    initialise_logging(&file_config.logging, foreground, matches.get_flag("debug"))?;

    info!("Starting trapmux v{} by GoCortex.io", env!("CARGO_PKG_VERSION"));
    if let ConfigSource::File { path, .. } = &source {
        info!("Configuration source: {}", path.display());
    }

    let config = DaemonConfig::resolve(&file_config, &cli).context("Configuration validation failed")?;
    let pid_file = matches.get_one::<String>("pid-file").map(PathBuf::from);

    run_application(config, Reconfigurator::new(source, cli), pid_file).await
}

/// Generate a default configuration file
async fn generate_default_config(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        anyhow::bail!("Configuration file already exists: {}", config_path.display());
    }
    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    Config::sample()
        .save_to_file(config_path)
        .await
        .context("Failed to save default configuration")?;

    println!("Configuration generated: {}", config_path.display());
    println!("Please edit the configuration file and restart trapmux.");
    Ok(())
}

/// Initialise logging based on configuration
fn initialise_logging(logging: &LoggingConfig, foreground: bool, debug: bool) -> Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        match logging.level.as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    };

    let mut layers = Vec::new();

    // Trap records own stdout, diagnostics go to stderr
    if logging.console_output && foreground {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true);
        layers.push(console_layer.boxed());
    }

    if let Some(log_file_path) = &logging.file_output {
        let log_path = Path::new(log_file_path);
        let log_dir = log_path.parent().unwrap_or(Path::new("."));
        let log_filename = log_path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("trapmux.log");

        std::fs::create_dir_all(log_dir).context("Failed to create log directory")?;

        let file_appender = match logging.rotation_strategy.as_str() {
            "hourly" => tracing_appender::rolling::hourly(log_dir, log_filename),
            "never" => tracing_appender::rolling::never(log_dir, log_filename),
            _ => tracing_appender::rolling::daily(log_dir, log_filename),
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        layers.push(file_layer.boxed());

        static GUARD_HOLDER: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
            std::sync::OnceLock::new();
        let _ = GUARD_HOLDER.set(guard);
    }

    if layers.is_empty() {
        let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        layers.push(stderr_layer.boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();

    Ok(())
}

/// Main application runtime
async fn run_application(config: DaemonConfig, reconfigurator: Reconfigurator, pid_file: Option<PathBuf>) -> Result<()> {
    let print = match &config.log_file_path {
        Some(path) => OutputTarget::file(path).await?,
        None => OutputTarget::Stdout,
    };
    let syslog = if config.sinks.syslog {
        SyslogTarget::connect(config.syslog_facility)
    } else {
        SyslogTarget::Tracing
    };
    info!(
        "Sinks: print={} ({}), syslog={}, event decode={}, {} trap handler(s)",
        config.sinks.print,
        print,
        config.sinks.syslog,
        config.sinks.event_decode,
        config.handlers.len()
    );

    let session_config = config.session.clone();
    let dispatcher = Dispatcher::new(Arc::new(config), Outputs::new(print, syslog), DnsResolver);

    let flags = Arc::new(ControlFlags::new());
    let mut signals =
        Signals::new([SIGTERM, SIGINT, SIGHUP]).context("Failed to register signal handlers")?;
    let signals_handle = signals.handle();
    let signal_flags = flags.clone();
    let signal_task = tokio::spawn(async move {
        while let Some(signal) = signals.next().await {
            if signal == SIGHUP {
                info!("Received SIGHUP, scheduling reload");
                signal_flags.request_reload();
            } else {
                info!("Received shutdown signal, stopping gracefully...");
                signal_flags.request_stop();
            }
        }
    });

    let result = match session_config.transport {
        TransportMode::Udp => {
            let session = UdpSession::bind(&session_config).await?;
            serve(session, dispatcher, reconfigurator, &flags, pid_file.as_deref()).await
        }
        TransportMode::Tcp => {
            let session = TcpSession::bind(&session_config).await?;
            serve(session, dispatcher, reconfigurator, &flags, pid_file.as_deref()).await
        }
    };

    signals_handle.close();
    signal_task.abort();
    result
}

async fn serve<S: TransportSession>(
    mut session: S,
    mut dispatcher: Dispatcher,
    mut reconfigurator: Reconfigurator,
    flags: &ControlFlags,
    pid_file: Option<&Path>,
) -> Result<()> {
    if let Some(path) = pid_file {
        tokio::fs::write(path, format!("{}\n", std::process::id()))
            .await
            .with_context(|| format!("Failed to write pid file {}", path.display()))?;
    }

    info!("trapmux listening on {}", session.local_addr());
    dispatcher.announce(Lifecycle::Started).await;

    let result = event_loop::run(&mut session, &mut dispatcher, &mut reconfigurator, flags).await;
    match &result {
        Ok(stats) => info!(
            "Processed {} message(s), acknowledged {} inform(s), {} reload(s)",
            stats.events, stats.informs_acknowledged, stats.reloads
        ),
        Err(e) => error!("{:#}", e),
    }

    dispatcher.announce(Lifecycle::Stopped).await;
    dispatcher.flush().await;

    if let Some(path) = pid_file {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }

    result.map(|_| ())
}
