//! Configuration management for trapmux
//!
//! The JSON file (`Config`) and the command line (`CliOverrides`) are merged
//! into a `DaemonConfig`, the immutable snapshot every dispatch reads.
//! Command-line values win over file values, on startup and on every reload.
//!
//! Developed by GoCortex.io

use anyhow::{anyhow, Context, Result};
use async_snmp::Oid;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::handler::HandlerRegistry;
use crate::output::Facility;
use crate::transport::{SessionConfig, TransportMode};

pub const DEFAULT_HANDLER_KEY: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub sinks: SinksConfig,
    pub suppress_auth_failure: bool,
    pub numeric_addresses: bool,
    pub syslog_facility: Facility,
    /// Print format for v1 traps.
    pub format1: Option<String>,
    /// Print format for v2 notifications and informs.
    pub format2: Option<String>,
    pub output_file: Option<String>,
    pub trap_handlers: Vec<TrapHandlerConfig>,
    pub allowed_sources: Option<Vec<String>>,
    pub handler_timeout_seconds: Option<u64>,
    pub output_limit: Option<usize>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub port: u16,
    pub transport: TransportMode,
    pub max_packet_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinksConfig {
    pub print: bool,
    pub syslog: bool,
    pub event_decode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrapHandlerConfig {
    /// Dotted OID prefix, or "default".
    pub oid: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub console_output: bool,
    pub file_output: Option<String>,
    pub rotation_strategy: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 162,
            transport: TransportMode::Udp,
            max_packet_size: 65535,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_output: true,
            file_output: None,
            rotation_strategy: "daily".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            sinks: SinksConfig::default(),
            suppress_auth_failure: false,
            numeric_addresses: false,
            syslog_facility: Facility::Local0,
            format1: None,
            format2: None,
            output_file: None,
            trap_handlers: Vec::new(),
            allowed_sources: None,
            handler_timeout_seconds: None,
            output_limit: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Starting point written by `--generate-config`.
    pub fn sample() -> Self {
        Self {
            sinks: SinksConfig {
                print: true,
                syslog: false,
                event_decode: false,
            },
            trap_handlers: vec![TrapHandlerConfig {
                oid: "1.3.6.1.6.3.1.1.5.3".to_string(),
                command: "logger -t linkdown".to_string(),
            }],
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read configuration file {}", path.as_ref().display()))?;

        let config: Config = serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Save configuration to a JSON file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialise configuration")?;

        tokio::fs::write(path.as_ref(), content)
            .await
            .context("Failed to write configuration file")?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.listener.port == 0 {
            anyhow::bail!("Invalid port number: {}", self.listener.port);
        }
        if self.listener.bind_address.parse::<IpAddr>().is_err() {
            anyhow::bail!("Invalid bind address: {}", self.listener.bind_address);
        }
        if self.listener.max_packet_size == 0 {
            anyhow::bail!("max_packet_size must be greater than zero");
        }
        if self.output_limit == Some(0) {
            anyhow::bail!("output_limit must be greater than zero");
        }

        for handler in &self.trap_handlers {
            if handler.command.trim().is_empty() {
                anyhow::bail!("Trap handler for '{}' has an empty command", handler.oid);
            }
            if handler.oid != DEFAULT_HANDLER_KEY {
                parse_handler_oid(&handler.oid)?;
            }
        }

        if let Some(patterns) = &self.allowed_sources {
            for pattern in patterns {
                validate_ip_pattern(pattern).with_context(|| format!("Invalid source pattern: '{}'", pattern))?;
            }
        }

        match self.logging.rotation_strategy.as_str() {
            "daily" | "hourly" | "never" => {}
            other => anyhow::bail!("Unknown rotation strategy '{}', expected daily, hourly or never", other),
        }

        Ok(())
    }

    fn handler_registry(&self) -> Result<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        for handler in &self.trap_handlers {
            if handler.oid == DEFAULT_HANDLER_KEY {
                registry.set_default(handler.command.clone());
            } else {
                registry.insert(parse_handler_oid(&handler.oid)?, handler.command.clone());
            }
        }
        Ok(registry)
    }
}

fn parse_handler_oid(text: &str) -> Result<Oid> {
    let oid = Oid::parse(text.trim()).map_err(|e| anyhow!("Invalid trap handler OID '{}': {}", text, e))?;
    if oid.is_empty() {
        anyhow::bail!("Invalid trap handler OID '{}': no arcs", text);
    }
    Ok(oid)
}

/// Values given on the command line. They are re-applied on every reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub transport: Option<TransportMode>,
    pub bind_address: Option<String>,
    pub print: bool,
    pub output_file: Option<String>,
    pub syslog: bool,
    pub facility: Option<Facility>,
    pub event_decode: bool,
    pub drop_auth: bool,
    pub numeric: bool,
    pub format: Option<String>,
}

/// A print template: the built-in default or a user override.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FormatTemplate {
    #[default]
    Default,
    Override(Arc<str>),
}

impl FormatTemplate {
    /// Empty overrides fall back to the default.
    pub fn from_option(text: Option<&str>) -> Self {
        match text {
            Some(text) if !text.is_empty() => FormatTemplate::Override(Arc::from(text)),
            _ => FormatTemplate::Default,
        }
    }

    pub fn text<'a>(&'a self, builtin: &'a str) -> &'a str {
        match self {
            FormatTemplate::Default => builtin,
            FormatTemplate::Override(text) => text,
        }
    }

    pub fn is_override(&self) -> bool {
        matches!(self, FormatTemplate::Override(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkFlags {
    pub print: bool,
    pub syslog: bool,
    pub event_decode: bool,
}

/// Resolved runtime configuration shared by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub session: SessionConfig,
    pub sinks: SinkFlags,
    pub suppress_auth_failure: bool,
    pub numeric_addresses: bool,
    pub syslog_facility: Facility,
    pub legacy_format: FormatTemplate,
    pub notification_format: FormatTemplate,
    pub log_file_path: Option<PathBuf>,
    pub handlers: HandlerRegistry,
    pub source_filter: Option<SourceFilter>,
    pub handler_timeout: Option<Duration>,
    pub output_limit: Option<usize>,
}

impl DaemonConfig {
    pub fn resolve(file: &Config, cli: &CliOverrides) -> Result<Self> {
        let mut merged = file.clone();
        if let Some(port) = cli.port {
            merged.listener.port = port;
        }
        if let Some(transport) = cli.transport {
            merged.listener.transport = transport;
        }
        if let Some(bind) = &cli.bind_address {
            merged.listener.bind_address = bind.clone();
        }
        if let Some(path) = &cli.output_file {
            merged.output_file = Some(path.clone());
        }
        if let Some(facility) = cli.facility {
            merged.syslog_facility = facility;
        }
        if let Some(format) = &cli.format {
            merged.format1 = Some(format.clone());
            merged.format2 = Some(format.clone());
        }
        merged.validate()?;

        let print = cli.print || merged.sinks.print || merged.output_file.is_some();
        let syslog = cli.syslog || merged.sinks.syslog || !print;
        if !print && !cli.syslog && !merged.sinks.syslog {
            debug!("Print sink disabled, enabling syslog output");
        }

        let bind_address = merged
            .listener
            .bind_address
            .parse::<IpAddr>()
            .with_context(|| format!("Invalid bind address: {}", merged.listener.bind_address))?;

        Ok(Self {
            session: SessionConfig {
                bind_address,
                port: merged.listener.port,
                transport: merged.listener.transport,
                max_packet_size: merged.listener.max_packet_size,
            },
            sinks: SinkFlags {
                print,
                syslog,
                event_decode: cli.event_decode || merged.sinks.event_decode,
            },
            suppress_auth_failure: cli.drop_auth || merged.suppress_auth_failure,
            numeric_addresses: cli.numeric || merged.numeric_addresses,
            syslog_facility: merged.syslog_facility,
            legacy_format: FormatTemplate::from_option(merged.format1.as_deref()),
            notification_format: FormatTemplate::from_option(merged.format2.as_deref()),
            log_file_path: merged.output_file.as_ref().map(PathBuf::from),
            handlers: merged.handler_registry()?,
            source_filter: merged.allowed_sources.clone().map(SourceFilter::new),
            handler_timeout: merged.handler_timeout_seconds.map(Duration::from_secs),
            output_limit: merged.output_limit,
        })
    }
}

/// Source allow-list: exact addresses, CIDR blocks, `a.b.c.*` wildcards or `*`.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFilter {
    patterns: Vec<String>,
}

impl SourceFilter {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }

    pub fn allows(&self, source: IpAddr) -> bool {
        for pattern in &self.patterns {
            match ip_matches_pattern(&source, pattern) {
                Ok(true) => {
                    debug!("Source {} matched pattern '{}'", source, pattern);
                    return true;
                }
                Ok(false) => continue,
                Err(e) => {
                    warn!("Invalid pattern '{}' in allowed sources: {} - skipping", pattern, e);
                    continue;
                }
            }
        }
        false
    }
}

/// Validate IP address pattern (supports CIDR notation, wildcards, and individual IPs)
fn validate_ip_pattern(pattern: &str) -> Result<()> {
    if pattern == "*" || pattern == "0.0.0.0/0" || pattern == "::/0" {
        return Ok(());
    }

    if pattern.contains('*') {
        return validate_wildcard_pattern(pattern);
    }

    if pattern.contains('/') {
        return pattern
            .parse::<IpNet>()
            .map(|_| ())
            .with_context(|| format!("Invalid CIDR notation: {}", pattern));
    }

    pattern
        .parse::<IpAddr>()
        .map(|_| ())
        .with_context(|| format!("Invalid IP address: {}", pattern))
}

/// Validate wildcard patterns like "192.168.1.*" or "2001:db8::*"
fn validate_wildcard_pattern(pattern: &str) -> Result<()> {
    let parts: Vec<&str> = pattern.split('*').collect();

    if parts.len() != 2 {
        return Err(anyhow!("Invalid wildcard pattern - only one '*' allowed per pattern"));
    }

    let (prefix, suffix) = (parts[0], parts[1]);

    if !suffix.is_empty() && !suffix.starts_with('.') && !suffix.starts_with(':') {
        return Err(anyhow!("Invalid wildcard pattern - invalid suffix"));
    }

    if prefix.contains('.') {
        if !prefix.ends_with('.') {
            return Err(anyhow!("IPv4 wildcard pattern must end with '.' before '*'"));
        }

        let octets: Vec<&str> = prefix.trim_end_matches('.').split('.').collect();
        if octets.len() > 3 {
            return Err(anyhow!("Invalid IPv4 wildcard prefix"));
        }
        for octet in octets {
            octet
                .parse::<u8>()
                .with_context(|| format!("Invalid IPv4 octet: {}", octet))?;
        }
    } else if prefix.contains(':') {
        if !prefix.ends_with(':') {
            return Err(anyhow!("IPv6 wildcard pattern should end with ':' before '*'"));
        }
    } else if !prefix.is_empty() {
        return Err(anyhow!("Wildcard pattern prefix must be valid IP address format"));
    }

    Ok(())
}

/// Check if an IP address matches a given pattern
fn ip_matches_pattern(ip_addr: &IpAddr, pattern: &str) -> Result<bool> {
    let trimmed = pattern.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty pattern"));
    }

    if trimmed == "*" || trimmed == "0.0.0.0/0" || trimmed == "::/0" {
        return Ok(true);
    }

    if let Ok(pattern_addr) = trimmed.parse::<IpAddr>() {
        return Ok(*ip_addr == pattern_addr);
    }

    if trimmed.contains('/') {
        let network = trimmed
            .parse::<IpNet>()
            .with_context(|| format!("Invalid CIDR notation: {}", trimmed))?;
        return Ok(network.contains(ip_addr));
    }

    if trimmed.contains('*') {
        validate_wildcard_pattern(trimmed)?;
        return Ok(match ip_addr {
            IpAddr::V4(v4) if trimmed.contains('.') => match_ipv4_wildcard(v4, trimmed),
            IpAddr::V6(v6) if trimmed.contains(':') => match_ipv6_wildcard(v6, trimmed),
            _ => false,
        });
    }

    Err(anyhow!("Unrecognized pattern format: {}", trimmed))
}

fn match_ipv4_wildcard(ipv4: &Ipv4Addr, pattern: &str) -> bool {
    let ip_str = ipv4.to_string();
    match pattern.split_once('*') {
        Some((prefix, suffix)) => ip_str.starts_with(prefix) && ip_str.ends_with(suffix),
        None => false,
    }
}

fn match_ipv6_wildcard(ipv6: &Ipv6Addr, pattern: &str) -> bool {
    let ip_str = ipv6.to_string();
    match pattern.split_once('*') {
        Some((prefix, _)) => ip_str.starts_with(prefix),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "listener": { "port": 1162 },
                "sinks": { "print": true },
                "syslog_facility": "local5",
                "trap_handlers": [
                    { "oid": "1.3.6.1.4.1.9", "command": "/usr/local/bin/cisco-trap" },
                    { "oid": "default", "command": "cat >> /tmp/traps" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listener.port, 1162);
        assert_eq!(config.listener.bind_address, "0.0.0.0");
        assert_eq!(config.listener.transport, TransportMode::Udp);
        assert_eq!(config.syslog_facility, Facility::Local5);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.listener.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.listener.bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trap_handlers.push(TrapHandlerConfig {
            oid: "1.3.x".to_string(),
            command: "true".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trap_handlers.push(TrapHandlerConfig {
            oid: " . ".to_string(),
            command: "true".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trap_handlers.push(TrapHandlerConfig {
            oid: "default".to_string(),
            command: "  ".to_string(),
        });
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.allowed_sources = Some(vec!["10.0.*.*".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides_win() {
        let file = Config {
            format1: Some("file-format %v".to_string()),
            ..Config::sample()
        };
        let cli = CliOverrides {
            port: Some(10162),
            transport: Some(TransportMode::Tcp),
            format: Some("cli %B".to_string()),
            numeric: true,
            ..CliOverrides::default()
        };

        let resolved = DaemonConfig::resolve(&file, &cli).unwrap();
        assert_eq!(resolved.session.port, 10162);
        assert_eq!(resolved.session.transport, TransportMode::Tcp);
        assert_eq!(resolved.legacy_format, FormatTemplate::Override(Arc::from("cli %B")));
        assert_eq!(resolved.notification_format, FormatTemplate::Override(Arc::from("cli %B")));
        assert!(resolved.numeric_addresses);
        assert_eq!(resolved.handlers.len(), 1);
    }

    #[test]
    fn test_syslog_forced_without_print() {
        let resolved = DaemonConfig::resolve(&Config::default(), &CliOverrides::default()).unwrap();
        assert!(!resolved.sinks.print);
        assert!(resolved.sinks.syslog);

        let cli = CliOverrides {
            output_file: Some("/var/log/traps.log".to_string()),
            ..CliOverrides::default()
        };
        let resolved = DaemonConfig::resolve(&Config::default(), &cli).unwrap();
        assert!(resolved.sinks.print);
        assert!(!resolved.sinks.syslog);
        assert_eq!(resolved.log_file_path, Some(PathBuf::from("/var/log/traps.log")));
    }

    #[test]
    fn test_empty_format_is_default() {
        assert_eq!(FormatTemplate::from_option(Some("")), FormatTemplate::Default);
        assert_eq!(FormatTemplate::from_option(None).text("builtin"), "builtin");
        assert_eq!(FormatTemplate::from_option(Some("%v")).text("builtin"), "%v");
    }

    #[test]
    fn test_source_filter_patterns() {
        let filter = SourceFilter::new(vec![
            "192.0.2.10".to_string(),
            "10.0.0.0/8".to_string(),
            "172.16.5.*".to_string(),
            "2001:db8::*".to_string(),
        ]);

        assert!(filter.allows("192.0.2.10".parse().unwrap()));
        assert!(filter.allows("10.200.1.1".parse().unwrap()));
        assert!(filter.allows("172.16.5.77".parse().unwrap()));
        assert!(filter.allows("2001:db8::1".parse().unwrap()));
        assert!(!filter.allows("192.0.2.11".parse().unwrap()));
        assert!(!filter.allows("172.16.50.1".parse().unwrap()));

        let open = SourceFilter::new(vec!["*".to_string()]);
        assert!(open.allows("203.0.113.9".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trapmux.json");

        let config = Config::sample();
        config.save_to_file(&path).await.unwrap();
        let loaded = Config::load_from_file(&path).await.unwrap();
        assert_eq!(loaded, config);
    }
}
