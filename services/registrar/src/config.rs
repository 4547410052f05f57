//! Registrar configuration.
//!
//! Flags fall back to environment variables so the daemon can be configured
//! entirely from its container environment.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use reqwest::Url;
use subproxy_reconcile::{
    EntryLayout, Namespace, DEFAULT_NAMESPACE, DEFAULT_RECONCILE_INTERVAL,
};

use crate::docker::socket_path_from_host;
use crate::inventory::EventFilter;

/// How passes are triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// One pass, then exit.
    Once,
    /// A pass on start and then on a fixed interval.
    Poll,
    /// A pass on start and then on every container network event.
    Events,
}

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "subproxy-registrar",
    version,
    about = "Publish the routing labels of running containers to etcd"
)]
pub struct Args {
    /// Trigger mode.
    #[arg(long, env = "SUBPROXY_MODE", value_enum, default_value_t = Mode::Events)]
    pub mode: Mode,

    /// Seconds between passes in poll mode.
    #[arg(
        long,
        env = "SUBPROXY_INTERVAL_SECS",
        default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs()
    )]
    pub interval_secs: u64,

    /// Comma-separated etcd endpoints.
    #[arg(long, env = "ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    pub etcd_endpoints: String,

    /// Key prefix owned by the registrar.
    #[arg(long, env = "SUBPROXY_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Entry encoding: `json` (one object per container) or `hosts`
    /// (`<name>/hosts` scalar).
    #[arg(long, env = "SUBPROXY_LAYOUT", default_value = "json")]
    pub layout: EntryLayout,

    /// Docker engine socket: `unix:///path` or an absolute path. TCP hosts
    /// (`tcp://...`) are not supported; defaults to /var/run/docker.sock.
    #[arg(long, env = "DOCKER_HOST")]
    pub docker_host: Option<String>,

    /// Per-request timeout for etcd, in milliseconds.
    #[arg(long, env = "SUBPROXY_STORE_TIMEOUT_MS", default_value_t = 3000)]
    pub store_timeout_ms: u64,

    /// Per-request timeout for the Docker engine, in milliseconds.
    #[arg(long, env = "SUBPROXY_RUNTIME_TIMEOUT_MS", default_value_t = 10000)]
    pub runtime_timeout_ms: u64,

    /// React to every network event instead of only connect/disconnect.
    #[arg(long, env = "SUBPROXY_ALL_NETWORK_EVENTS")]
    pub all_network_events: bool,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "SUBPROXY_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated registrar configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub interval: Duration,
    pub endpoints: Vec<Url>,
    pub namespace: Namespace,
    pub layout: EntryLayout,
    pub docker_socket: String,
    pub store_timeout: Duration,
    pub runtime_timeout: Duration,
    pub event_filter: EventFilter,
    pub log_level: String,
}

impl Config {
    /// Parse and validate the process arguments.
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Validate parsed arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.interval_secs == 0 {
            bail!("--interval-secs must be greater than zero");
        }
        if args.store_timeout_ms == 0 || args.runtime_timeout_ms == 0 {
            bail!("request timeouts must be greater than zero");
        }

        let endpoints = parse_endpoints(&args.etcd_endpoints)?;
        let namespace = Namespace::new(&args.namespace)
            .with_context(|| format!("Invalid namespace {:?}", args.namespace))?;
        let docker_socket = socket_path_from_host(args.docker_host.as_deref())
            .context("Invalid DOCKER_HOST")?;

        let event_filter = if args.all_network_events {
            EventFilter::all_network()
        } else {
            EventFilter::network()
        };

        Ok(Self {
            mode: args.mode,
            interval: Duration::from_secs(args.interval_secs),
            endpoints,
            namespace,
            layout: args.layout,
            docker_socket,
            store_timeout: Duration::from_millis(args.store_timeout_ms),
            runtime_timeout: Duration::from_millis(args.runtime_timeout_ms),
            event_filter,
            log_level: args.log_level,
        })
    }
}

/// Parse a comma-separated endpoint list. Blank items are ignored.
pub fn parse_endpoints(raw: &str) -> Result<Vec<Url>> {
    let mut endpoints = Vec::new();

    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let url: Url = item
            .parse()
            .with_context(|| format!("Invalid etcd endpoint {item:?}"))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            bail!("etcd endpoint {item:?} must be an http(s) URL");
        }
        endpoints.push(url);
    }

    if endpoints.is_empty() {
        bail!("No etcd endpoints configured");
    }

    Ok(endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["subproxy-registrar", "--docker-host", "unix:///var/run/docker.sock"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_endpoints() {
        let endpoints =
            parse_endpoints("http://10.0.0.1:2379, https://etcd.internal:2379,,").unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].host_str(), Some("10.0.0.1"));
        assert_eq!(endpoints[1].scheme(), "https");
    }

    #[rstest]
    #[case("")]
    #[case(" , ")]
    #[case("10.0.0.1:2379")]
    #[case("ftp://10.0.0.1")]
    fn test_parse_endpoints_rejects(#[case] raw: &str) {
        assert!(parse_endpoints(raw).is_err());
    }

    #[test]
    fn test_from_args_explicit_values() {
        let config = Config::from_args(args(&[
            "--mode",
            "poll",
            "--interval-secs",
            "5",
            "--etcd-endpoints",
            "http://a:2379,http://b:2379",
            "--namespace",
            "/routes/",
            "--layout",
            "hosts",
            "--all-network-events",
        ]))
        .unwrap();

        assert_eq!(config.mode, Mode::Poll);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.namespace.as_str(), "/routes");
        assert_eq!(config.layout, EntryLayout::Hosts);
        assert_eq!(config.docker_socket, "/var/run/docker.sock");
        assert_eq!(config.event_filter, EventFilter::all_network());
    }

    #[test]
    fn test_from_args_defaults() {
        let config = Config::from_args(args(&[])).unwrap();

        assert_eq!(config.mode, Mode::Events);
        assert_eq!(config.interval, DEFAULT_RECONCILE_INTERVAL);
        assert_eq!(config.namespace.as_str(), DEFAULT_NAMESPACE);
        assert_eq!(config.layout, EntryLayout::Json);
        assert_eq!(config.event_filter, EventFilter::network());
    }

    #[test]
    fn test_tcp_docker_host_is_rejected() {
        let argv = ["subproxy-registrar", "--docker-host", "tcp://127.0.0.1:2375"];
        let err = Config::from_args(Args::try_parse_from(argv).unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported docker host"));
    }

    #[test]
    fn test_from_args_rejects_zero_interval() {
        let result = Config::from_args(args(&["--mode", "poll", "--interval-secs", "0"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_args_rejects_relative_namespace() {
        let result = Config::from_args(args(&["--namespace", "subproxies"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_layout_is_a_parse_error() {
        let argv = ["subproxy-registrar", "--layout", "yaml"];
        assert!(Args::try_parse_from(argv).is_err());
    }
}
