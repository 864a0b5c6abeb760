//! Configuration for the node scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::backoff::ReconnectPolicy;
use crate::goal::FileGoalSource;
use crate::model::Resource;
use crate::policy::RuleMode;
use crate::resource::{BrokerEndpoint, ResourceManagerConfig};

/// Per-component capacity assumed in simulation when none is given.
pub const SIMULATED_CAPACITY: f64 = 999_999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Node scheduler: runs science goal plugins on this edge node.
#[derive(Debug, Clone, Parser)]
#[command(name = "node-scheduler")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Identifier of this node.
    #[arg(long, env = "WAGGLE_NODE_ID", default_value = "000000000001")]
    pub node_id: String,

    /// Run against the in-process mock substrate.
    #[arg(long, env = "SES_SIMULATE")]
    pub simulate: bool,

    /// YAML job template to watch. The scheduler refuses to start without it.
    #[arg(long, env = "SES_GOAL_FILE")]
    pub goal_file: Option<PathBuf>,

    /// Key under which the job template is stored.
    #[arg(long, default_value = "goals")]
    pub goal_key: String,

    /// How often the goal file is re-read, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub goal_poll_interval_ms: u64,

    /// Node CPU capacity.
    #[arg(long)]
    pub cpu: Option<f64>,

    /// Node memory capacity.
    #[arg(long)]
    pub memory: Option<f64>,

    /// Node GPU memory capacity.
    #[arg(long)]
    pub gpu_memory: Option<f64>,

    /// Socket the rule engine accepts requests on.
    #[arg(long, default_value = "/tmp/kb.sock")]
    pub kb_request_socket: PathBuf,

    /// Socket the rule engine reports plugin contexts to.
    #[arg(long, default_value = "/tmp/event.sock")]
    pub kb_event_socket: PathBuf,

    /// How long to wait for a rule engine reply before reconnecting, in seconds.
    #[arg(long, default_value_t = 10)]
    pub kb_reply_timeout_secs: u64,

    /// Promote every waiting plugin without consulting the rule engine.
    #[arg(long)]
    pub no_rules: bool,

    /// Where telemetry records are POSTed. Logged locally when unset.
    #[arg(long, env = "WAGGLE_TELEMETRY_URL")]
    pub telemetry_url: Option<String>,

    /// Status API listen address.
    #[arg(long, env = "SES_LISTEN_ADDR", default_value = "0.0.0.0:9770")]
    pub listen_addr: SocketAddr,

    /// Registry prefix for plugin images.
    #[arg(long, default_value = "waggle")]
    pub registry: String,

    #[arg(long, env = "WAGGLE_PLUGIN_HOST", default_value = "rabbitmq-server")]
    pub broker_host: String,

    #[arg(long, env = "WAGGLE_PLUGIN_PORT", default_value_t = 5672)]
    pub broker_port: u16,

    /// First reconnect delay, in milliseconds.
    #[arg(long, default_value_t = 3000)]
    pub reconnect_base_ms: u64,

    /// Longest reconnect delay, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_max_ms: u64,

    /// Seconds between garbage collection passes.
    #[arg(long, default_value_t = 30)]
    pub gc_interval_secs: u64,

    /// Create attempts before a launch is reported failed.
    #[arg(long, default_value_t = 3)]
    pub launch_attempts: u32,

    /// How long simulated plugin runs take, in seconds.
    #[arg(long, default_value_t = 10)]
    pub mock_run_secs: u64,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "SES_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Config {
    /// Node capacity, or `None` when it is not known.
    ///
    /// CPU and memory must both be given. In simulation a missing capacity
    /// is effectively unbounded.
    pub fn capacity(&self) -> Option<Resource> {
        match (self.cpu, self.memory) {
            (Some(cpu), Some(memory)) => {
                Some(Resource::new(cpu, memory, self.gpu_memory.unwrap_or(0.0)))
            }
            _ if self.simulate => Some(Resource::new(
                SIMULATED_CAPACITY,
                SIMULATED_CAPACITY,
                SIMULATED_CAPACITY,
            )),
            _ => None,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let base = Duration::from_millis(self.reconnect_base_ms);
        ReconnectPolicy {
            base,
            max: Duration::from_millis(self.reconnect_max_ms).max(base),
            ..ReconnectPolicy::default()
        }
    }

    pub fn rule_mode(&self) -> RuleMode {
        if self.no_rules {
            RuleMode::Unconditional
        } else {
            RuleMode::Knowledgebase
        }
    }

    pub fn kb_reply_timeout(&self) -> Duration {
        Duration::from_secs(self.kb_reply_timeout_secs.max(1))
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    pub fn goal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.goal_poll_interval_ms.max(10))
    }

    /// Watcher for the configured goal file, or `None` when there is none.
    pub fn goal_source(&self) -> Option<FileGoalSource> {
        self.goal_file.as_ref().map(|path| {
            FileGoalSource::new(path.clone(), self.goal_key.clone(), self.goal_poll_interval())
        })
    }

    pub fn resource_manager_config(&self) -> ResourceManagerConfig {
        ResourceManagerConfig {
            capacity: self.capacity(),
            registry: self.registry.clone(),
            broker: BrokerEndpoint {
                host: self.broker_host.clone(),
                port: self.broker_port,
            },
            retry: self.reconnect_policy(),
            max_create_attempts: self.launch_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["node-scheduler"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&["--node-id", "n1"]);
        assert_eq!(config.node_id, "n1");
        assert_eq!(config.goal_key, "goals");
        assert_eq!(config.kb_request_socket, PathBuf::from("/tmp/kb.sock"));
        assert_eq!(config.listen_addr, "0.0.0.0:9770".parse().unwrap());
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.rule_mode(), RuleMode::Knowledgebase);
        assert_eq!(config.gc_interval(), Duration::from_secs(30));
        assert_eq!(config.kb_reply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_goal_source_needs_a_file() {
        assert!(parse(&["--node-id", "n1"]).goal_source().is_none());
        assert!(parse(&["--node-id", "n1", "--goal-file", "/etc/ses/goals.yaml"])
            .goal_source()
            .is_some());
    }

    #[test]
    fn test_capacity() {
        assert_eq!(parse(&["--node-id", "n1"]).capacity(), None);
        assert_eq!(parse(&["--node-id", "n1", "--cpu", "4"]).capacity(), None);
        assert_eq!(
            parse(&["--node-id", "n1", "--cpu", "4", "--memory", "8192"]).capacity(),
            Some(Resource::new(4.0, 8192.0, 0.0))
        );
        assert_eq!(
            parse(&["--node-id", "n1", "--simulate"]).capacity(),
            Some(Resource::new(
                SIMULATED_CAPACITY,
                SIMULATED_CAPACITY,
                SIMULATED_CAPACITY
            ))
        );
    }

    #[test]
    fn test_resource_manager_config() {
        let config = parse(&[
            "--node-id",
            "n1",
            "--no-rules",
            "--registry",
            "registry.local",
            "--broker-port",
            "5673",
            "--reconnect-base-ms",
            "200",
            "--reconnect-max-ms",
            "100",
        ]);
        assert_eq!(config.rule_mode(), RuleMode::Unconditional);

        let rm = config.resource_manager_config();
        assert_eq!(rm.registry, "registry.local");
        assert_eq!(rm.broker.port, 5673);
        assert_eq!(rm.retry.base, Duration::from_millis(200));
        assert_eq!(rm.retry.max, Duration::from_millis(200));
        assert_eq!(rm.max_create_attempts, 3);
    }

    #[test]
    fn test_rejects_bad_log_format() {
        assert!(Config::try_parse_from(["node-scheduler", "--log-format", "xml"]).is_err());
    }
}
