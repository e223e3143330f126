//! Live reconfiguration
//!
//! A reload re-reads the configuration source, re-applies the command line
//! on top and swaps the dispatcher's configuration between events. The print
//! destination is reopened so external log rotation works.
//!
//! Developed by GoCortex.io

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{CliOverrides, Config, DaemonConfig};
use crate::dispatch::{Dispatcher, HostResolver, Lifecycle};
use crate::output::{OutputTarget, SyslogTarget};

/// Where the file configuration comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// A JSON file. A missing optional file yields the defaults.
    File { path: PathBuf, required: bool },
    /// Built-in defaults only.
    Defaults,
}

impl ConfigSource {
    pub async fn load(&self) -> Result<Config> {
        match self {
            ConfigSource::File { path, required } => {
                if !required && !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    debug!("No configuration file at {}, using defaults", path.display());
                    return Ok(Config::default());
                }
                Config::load_from_file(path).await
            }
            ConfigSource::Defaults => Ok(Config::default()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconfigState {
    Idle,
    Reloading,
}

pub struct Reconfigurator {
    source: ConfigSource,
    cli: CliOverrides,
    state: ReconfigState,
}

impl Reconfigurator {
    pub fn new(source: ConfigSource, cli: CliOverrides) -> Self {
        Self {
            source,
            cli,
            state: ReconfigState::Idle,
        }
    }

    pub fn state(&self) -> ReconfigState {
        self.state
    }

    /// Load and resolve the configuration without installing it.
    pub async fn resolve(&self) -> Result<DaemonConfig> {
        let file = self.source.load().await?;
        DaemonConfig::resolve(&file, &self.cli)
    }

    /// Reload into `dispatcher`. A configuration that fails to load leaves
    /// the current one in place; the print destination is reopened either way.
    pub async fn reload<R: HostResolver>(&mut self, dispatcher: &mut Dispatcher<R>) {
        self.state = ReconfigState::Reloading;
        info!("Reloading configuration");

        match self.resolve().await {
            Ok(config) => {
                let config = Arc::new(config);
                retarget_outputs(dispatcher, &config).await;
                // The previous snapshot, with its format overrides and handler
                // bindings, is released here
                drop(dispatcher.replace_config(config));
            }
            Err(e) => {
                error!("Failed to reload configuration, keeping the current one: {:#}", e);
                reopen_print(dispatcher).await;
            }
        }

        dispatcher.announce(Lifecycle::Reconfigured).await;
        self.state = ReconfigState::Idle;
    }
}

async fn reopen_print<R: HostResolver>(dispatcher: &mut Dispatcher<R>) {
    let print = &mut dispatcher.outputs_mut().print;
    if let Err(e) = print.reopen().await {
        error!("Failed to reopen {}: {:#}", print, e);
    }
}

/// Point the print and syslog destinations at what `config` asks for.
async fn retarget_outputs<R: HostResolver>(dispatcher: &mut Dispatcher<R>, config: &DaemonConfig) {
    let outputs = dispatcher.outputs_mut();
    outputs.syslog.set_facility(config.syslog_facility);
    if config.sinks.syslog && matches!(outputs.syslog, SyslogTarget::Tracing) {
        outputs.syslog = SyslogTarget::connect(config.syslog_facility);
    }

    let same_file = matches!(
        (&outputs.print, &config.log_file_path),
        (OutputTarget::File(file), Some(path)) if file.path() == path.as_path()
    );

    match &config.log_file_path {
        Some(_) if same_file => {
            if let Err(e) = outputs.print.reopen().await {
                error!("Failed to reopen {}: {:#}", outputs.print, e);
            }
        }
        Some(path) => match OutputTarget::file(path).await {
            Ok(target) => {
                info!("Trap output now goes to {}", target);
                outputs.print = target;
            }
            Err(e) => {
                warn!("Keeping output on {}: {:#}", outputs.print, e);
            }
        },
        None => {
            if matches!(outputs.print, OutputTarget::File(_)) {
                info!("Output file no longer configured, writing traps to stdout");
                outputs.print = OutputTarget::Stdout;
            }
        }
    }
}
