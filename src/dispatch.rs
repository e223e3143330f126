//! Dispatch of one trap event to the configured sinks
//!
//! Order per event: source filter, host resolution, print sink, syslog sink,
//! event decoding, then handler invocation. A failure in one sink is logged
//! and never stops the ones after it.
//!
//! Developed by GoCortex.io

use async_snmp::{GenericTrap, Oid};
use chrono::Local;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::buffer::{SinkBuffer, TRUNCATED_MARKER};
use crate::config::DaemonConfig;
use crate::event_decode::{decode_alarm, AlarmEvent};
use crate::format::{render, DEFAULT_LEGACY_FORMAT, DEFAULT_NOTIFICATION_FORMAT};
use crate::handler::{handler_feed, run_handler, HandlerOutcome};
use crate::normalize::{legacy_trap_oid, normalize, Normalized};
use crate::output::{Outputs, Severity};
use crate::render::{uptime_string, SnmpText};
use crate::trap::TrapEvent;

/// Reverse name lookup for trap sources.
pub trait HostResolver {
    fn lookup(&self, addr: IpAddr) -> Option<String>;
}

/// System resolver (getnameinfo).
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl HostResolver for DnsResolver {
    fn lookup(&self, addr: IpAddr) -> Option<String> {
        match dns_lookup::lookup_addr(&addr) {
            Ok(name) => Some(name),
            Err(e) => {
                debug!("Reverse lookup of {} failed: {}", addr, e);
                None
            }
        }
    }
}

impl<F> HostResolver for F
where
    F: Fn(IpAddr) -> Option<String>,
{
    fn lookup(&self, addr: IpAddr) -> Option<String> {
        self(addr)
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Rejected by the source filter; nothing else ran.
    pub dropped: bool,
    pub printed: bool,
    pub logged: bool,
    pub alarm: Option<AlarmEvent>,
    pub trap_oid: Option<Oid>,
    pub handler: Option<String>,
    pub handler_outcome: Option<HandlerOutcome>,
}

/// Daemon lifecycle points announced on the sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Reconfigured,
    Stopped,
}

impl Lifecycle {
    fn print_word(self) -> &'static str {
        match self {
            Lifecycle::Started => "Started.",
            Lifecycle::Reconfigured => "Reconfigured.",
            Lifecycle::Stopped => "Stopped.",
        }
    }

    fn syslog_word(self) -> &'static str {
        match self {
            Lifecycle::Started => "Starting",
            Lifecycle::Reconfigured => "reconfiguring",
            Lifecycle::Stopped => "Stopping",
        }
    }
}

pub struct Dispatcher<R = DnsResolver> {
    config: Arc<DaemonConfig>,
    outputs: Outputs,
    resolver: R,
}

impl<R: HostResolver> Dispatcher<R> {
    pub fn new(config: Arc<DaemonConfig>, outputs: Outputs, resolver: R) -> Self {
        Self {
            config,
            outputs,
            resolver,
        }
    }

    pub fn config(&self) -> &Arc<DaemonConfig> {
        &self.config
    }

    /// Install a new configuration, handing back the previous one.
    pub fn replace_config(&mut self, config: Arc<DaemonConfig>) -> Arc<DaemonConfig> {
        std::mem::replace(&mut self.config, config)
    }

    pub fn outputs_mut(&mut self) -> &mut Outputs {
        &mut self.outputs
    }

    pub async fn dispatch(&mut self, event: &mut TrapEvent) -> DispatchReport {
        // One snapshot for the whole event
        let config = Arc::clone(&self.config);
        let mut report = DispatchReport::default();

        if let Some(filter) = &config.source_filter {
            if !filter.allows(event.source_ip()) {
                warn!("Dropping {:?} from unauthorised source {}", event.class, event.source);
                report.dropped = true;
                return report;
            }
        }

        if !config.numeric_addresses {
            self.resolve_hosts(event);
        }

        let normalized = normalize(event);
        report.trap_oid = normalized.trap_oid.clone();

        let suppressed = config.suppress_auth_failure && event.is_auth_failure();
        if suppressed {
            debug!("Suppressing output for authentication failure trap from {}", event.source);
        }

        if config.sinks.print && !suppressed {
            report.printed = self.print(&config, event, &normalized).await;
        }
        if config.sinks.syslog && !suppressed {
            report.logged = self.syslog(&config, event).await;
        }
        if config.sinks.event_decode && !event.class.is_legacy() {
            report.alarm = self.decode_event(event).await;
        }

        if let Some(trap_oid) = &normalized.trap_oid {
            if let Some(command) = config.handlers.lookup(trap_oid) {
                report.handler = Some(command.to_string());
                let feed = handler_feed(event, &normalized);
                match run_handler(command, &feed, config.handler_timeout).await {
                    Ok(outcome) => {
                        if outcome == HandlerOutcome::TimedOut {
                            warn!("Trap handler '{}' for {} timed out and was killed", command, trap_oid);
                        }
                        report.handler_outcome = Some(outcome);
                    }
                    Err(e) => error!("{:#}", e),
                }
            } else {
                debug!("No trap handler bound for {}", trap_oid);
            }
        }

        report
    }

    fn resolve_hosts(&self, event: &mut TrapEvent) {
        let source = event.source_ip();
        event.resolved_host = self.resolver.lookup(source);
        if event.legacy.is_some() {
            let agent = event.agent_ip();
            event.agent_host = if agent == source {
                event.resolved_host.clone()
            } else {
                self.resolver.lookup(agent)
            };
        }
    }

    async fn print(&mut self, config: &DaemonConfig, event: &TrapEvent, normalized: &Normalized<'_>) -> bool {
        let (template, marker) = if event.class.is_legacy() {
            (config.legacy_format.text(DEFAULT_LEGACY_FORMAT), " [TRUNCATED]\n")
        } else {
            (config.notification_format.text(DEFAULT_NOTIFICATION_FORMAT), " [TRUNCATED]")
        };

        let mut buf = match SinkBuffer::new(config.output_limit) {
            Ok(buf) => buf,
            Err(e) => {
                error!("Failed to allocate print buffer for trap from {}: {}", event.source, e);
                return false;
            }
        };

        let rendered = render(template, event, normalized.trap_oid.as_ref(), &mut buf);
        let truncated = buf.is_truncated();
        if rendered.is_err() && !truncated {
            error!("Failed to render trap from {} with format '{}'", event.source, template);
            return false;
        }

        log_truncation("Print", event, &[&buf]);
        let mut record = buf.into_string();
        if truncated {
            record.push_str(marker);
        }

        match self.outputs.print.write_record(&record).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write trap record to {}: {:#}", self.outputs.print, e);
                false
            }
        }
    }

    async fn syslog(&mut self, config: &DaemonConfig, event: &TrapEvent) -> bool {
        let line = match &event.legacy {
            Some(legacy) => {
                let mut suffix = match SinkBuffer::new(config.output_limit) {
                    Ok(buf) => buf,
                    Err(e) => {
                        error!("Failed to allocate syslog buffer for trap from {}: {}", event.source, e);
                        return false;
                    }
                };
                let code = match legacy.generic_kind() {
                    Some(GenericTrap::EnterpriseSpecific) => legacy_trap_oid(legacy)
                        .and_then(|oid| oid.arcs().last().copied())
                        .map(i64::from)
                        .unwrap_or(i64::from(legacy.specific)),
                    _ => i64::from(legacy.specific),
                };
                let _ = write!(suffix, "{}", code);

                let Some(vars) = variable_summary(config, event, ", ", true) else {
                    return false;
                };
                log_truncation("Syslog", event, &[&suffix, &vars]);

                format!(
                    "{}: {} Trap ({}{}) Uptime: {}{}{}",
                    legacy.agent_addr,
                    legacy.description(),
                    suffix.as_str(),
                    if suffix.is_truncated() { " [TRUNCATED]" } else { "" },
                    uptime_string(event.sys_uptime),
                    vars.as_str(),
                    if vars.is_truncated() { " [TRUNCATED]\n" } else { "" },
                )
            }
            None => {
                let Some(vars) = variable_summary(config, event, ", ", false) else {
                    return false;
                };
                log_truncation("Syslog", event, &[&vars]);
                format!(
                    "{} [{}]: Trap {}{}",
                    event.host_or_ip(),
                    event.source_ip(),
                    vars.as_str(),
                    if vars.is_truncated() { TRUNCATED_MARKER } else { "" },
                )
            }
        };

        self.outputs.syslog.send(Severity::Warning, &line).await;
        true
    }

    async fn decode_event(&mut self, event: &TrapEvent) -> Option<AlarmEvent> {
        match decode_alarm(&event.variables) {
            Ok(alarm) => {
                let record = format!("{}\n", alarm);
                if let Err(e) = self.outputs.events.write_record(&record).await {
                    error!("Failed to write alarm record: {:#}", e);
                }
                Some(alarm)
            }
            Err(e) => {
                warn!("Couldn't decode alarm notification from {}: {}", event.source, e);
                None
            }
        }
    }

    /// Announce a lifecycle point on the enabled sinks.
    pub async fn announce(&mut self, stage: Lifecycle) {
        let version = env!("CARGO_PKG_VERSION");
        if self.config.sinks.print {
            let record = format!(
                "{} trapmux {} {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                version,
                stage.print_word()
            );
            if let Err(e) = self.outputs.print.write_record(&record).await {
                error!("Failed to write lifecycle record to {}: {:#}", self.outputs.print, e);
            }
        }
        if self.config.sinks.syslog {
            let message = format!("{} trapmux {}", stage.syslog_word(), version);
            self.outputs.syslog.send(Severity::Info, &message).await;
        }
        info!("trapmux {} {}", version, stage.print_word());
    }

    pub async fn flush(&mut self) {
        if let Err(e) = self.outputs.print.flush().await {
            warn!("Failed to flush {}: {:#}", self.outputs.print, e);
        }
    }
}

fn log_truncation(sink: &str, event: &TrapEvent, buffers: &[&SinkBuffer]) {
    if let Some(cause) = buffers.iter().find_map(|buf| buf.truncation()) {
        error!("{} output for trap from {} truncated: {}", sink, event.source, cause);
    }
}

/// Full renderings of the event's own variables, joined by `separator`.
///
/// With `leading`, the summary starts with the separator as well.
fn variable_summary(config: &DaemonConfig, event: &TrapEvent, separator: &str, leading: bool) -> Option<SinkBuffer> {
    let mut buf = match SinkBuffer::new(config.output_limit) {
        Ok(buf) => buf,
        Err(e) => {
            error!("Failed to allocate syslog buffer for trap from {}: {}", event.source, e);
            return None;
        }
    };

    if leading && !event.variables.is_empty() {
        buf.push_str(separator);
    }
    for vb in &event.variables {
        if vb.write_full(&mut buf).is_err() || !buf.push_str(separator) {
            break;
        }
    }
    buf.trim_separator(separator);
    Some(buf)
}
