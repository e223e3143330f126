//! External trap handlers
//!
//! Handlers are shell commands bound to trap OIDs. A matching command is run
//! through `/bin/sh -c` and fed a fixed text rendering of the trap on its
//! standard input; the daemon waits for it to finish before moving on.
//!
//! Developed by GoCortex.io

use anyhow::{Context, Result};
use async_snmp::Oid;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::normalize::Normalized;
use crate::render::SnmpText;
use crate::trap::TrapEvent;

pub const SHELL: &str = "/bin/sh";

/// OID-to-command bindings with longest-prefix lookup and an optional
/// fallback used when nothing matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerRegistry {
    bindings: Vec<(Oid, String)>,
    default: Option<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `command` to `oid`, replacing an earlier binding of the same OID.
    pub fn insert(&mut self, oid: Oid, command: impl Into<String>) {
        let command = command.into();
        match self.bindings.iter_mut().find(|(bound, _)| *bound == oid) {
            Some(entry) => entry.1 = command,
            None => self.bindings.push((oid, command)),
        }
    }

    pub fn set_default(&mut self, command: impl Into<String>) {
        self.default = Some(command.into());
    }

    pub fn lookup(&self, trap_oid: &Oid) -> Option<&str> {
        self.bindings
            .iter()
            .filter(|(prefix, _)| trap_oid.starts_with(prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, command)| command.as_str())
            .or(self.default.as_deref())
    }

    pub fn len(&self) -> usize {
        self.bindings.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Text fed to a handler: host line, address line, then one quick-rendered
/// line per normalized binding.
pub fn handler_feed(event: &TrapEvent, normalized: &Normalized<'_>) -> String {
    let mut feed = format!("{}\n{}\n", event.host_or_ip(), event.source_ip());
    for vb in normalized.bindings.iter() {
        // Writing into a String cannot fail
        let _ = vb.write_quick(&mut feed);
        feed.push('\n');
    }
    feed
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Run `command` with `feed` on its stdin and wait for it to exit.
///
/// With a timeout, a child still running when it expires is killed.
pub async fn run_handler(command: &str, feed: &str, timeout: Option<Duration>) -> Result<HandlerOutcome> {
    debug!("Running trap handler: {}", command);

    let mut child = Command::new(SHELL)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start trap handler '{}'", command))?;

    let mut stdin = child
        .stdin
        .take()
        .context("Failed to open pipe to trap handler")?;

    let interaction = async {
        match stdin.write_all(feed.as_bytes()).await {
            Ok(()) => {}
            // The handler is free to ignore its input
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
            Err(e) => warn!("Failed to write trap to handler '{}': {}", command, e),
        }
        drop(stdin);
        child.wait().await
    };

    let finished = match timeout {
        Some(limit) => tokio::time::timeout(limit, interaction).await.ok(),
        None => Some(interaction.await),
    };
    let Some(waited) = finished else {
        if let Err(e) = child.kill().await {
            warn!("Failed to kill trap handler '{}': {}", command, e);
        }
        return Ok(HandlerOutcome::TimedOut);
    };
    let status = waited.with_context(|| format!("Failed to wait for trap handler '{}'", command))?;

    if !status.success() {
        debug!("Trap handler '{}' exited with {}", command, status);
    }
    Ok(HandlerOutcome::Exited(status))
}
