//! Configuration loading. Read once at startup (§3's "Configuration"
//! table) via a layered `figment` loader: built-in defaults, then an
//! optional TOML file, then environment variables prefixed
//! `POSTPROCESS_AGENT_`.

use crate::error::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    pub tracing: TracingConfig,
    pub broker: BrokerConfig,
    pub destinations: DestinationsConfig,
    pub admission: AdmissionConfig,
    pub resource_limits: ResourceLimitsConfig,
    pub filesystem: FilesystemConfig,
    pub metrics: MetricsConfig,
    /// The catalog/forwarder processor (§4.2) is only registered when a
    /// deployment configures an endpoint; unlike reduction and
    /// script-writer it has no facility-wide default destination.
    pub catalog: Option<CatalogConfig>,
    /// When set, no workers are spawned; only status transitions are
    /// published (§3, "communication-only mode").
    pub communication_only: bool,
    /// Bounded drain period the signal supervisor allows in-flight
    /// workers before a second signal forces exit (§4.6).
    #[serde(with = "humantime_serde")]
    pub shutdown_drain_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::default(),
            broker: BrokerConfig::default(),
            destinations: DestinationsConfig::default(),
            admission: AdmissionConfig::default(),
            resource_limits: ResourceLimitsConfig::default(),
            filesystem: FilesystemConfig::default(),
            metrics: MetricsConfig::default(),
            catalog: None,
            communication_only: false,
            shutdown_drain_timeout: Duration::from_secs(300),
        }
    }
}

impl SafeDisplay for AgentConfig {
    fn to_safe_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "broker:");
        let _ = writeln!(out, "{}", self.broker.to_safe_string_indented());
        let _ = writeln!(out, "destinations:");
        let _ = writeln!(out, "{}", self.destinations.to_safe_string_indented());
        let _ = writeln!(out, "admission:");
        let _ = writeln!(out, "{}", self.admission.to_safe_string_indented());
        let _ = writeln!(out, "resource limits:");
        let _ = writeln!(out, "{}", self.resource_limits.to_safe_string_indented());
        let _ = writeln!(out, "filesystem:");
        let _ = writeln!(out, "{}", self.filesystem.to_safe_string_indented());
        let _ = writeln!(out, "metrics:");
        let _ = writeln!(out, "{}", self.metrics.to_safe_string_indented());
        match &self.catalog {
            Some(catalog) => {
                let _ = writeln!(out, "catalog:");
                let _ = writeln!(out, "{}", catalog.to_safe_string_indented());
            }
            None => {
                let _ = writeln!(out, "catalog: disabled");
            }
        }
        let _ = writeln!(out, "communication only: {}", self.communication_only);
        out
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TracingConfig {
    /// `RUST_LOG`-style filter directive, e.g. "info,postprocess_agent=debug".
    pub filter: String,
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub url: Url,
    pub user: String,
    pub password: String,
    /// Delay between reconnect attempts after a dropped connection (§4.4, ~5s).
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    /// Heartbeat publish period while connected (§4.4, 30s).
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: Url::parse("stomp://localhost:61613").expect("valid default broker URL"),
            user: "guest".to_string(),
            password: "changeme".to_string(),
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl SafeDisplay for BrokerConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "url: {}\nuser: {}\npassword: ****\nreconnect delay: {:?}\nheartbeat interval: {:?}",
            self.url, self.user, self.reconnect_delay, self.heartbeat_interval
        )
    }
}

/// Broker destinations, defaults per §6's table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DestinationsConfig {
    pub reduction_request: String,
    pub reduction_started: String,
    pub reduction_complete: String,
    pub reduction_error: String,
    pub reduction_disabled: String,
    pub create_script: String,
    /// `${instrument}`-templated topic the script-writer processor reports
    /// its single status message to (§4.2).
    pub script_status_topic_template: String,
    pub heartbeat: String,
    pub ping: String,
    pub error: String,
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            reduction_request: "/queue/REDUCTION.DATA_READY".to_string(),
            reduction_started: "/queue/REDUCTION.STARTED".to_string(),
            reduction_complete: "/queue/REDUCTION.COMPLETE".to_string(),
            reduction_error: "/queue/REDUCTION.ERROR".to_string(),
            reduction_disabled: "/queue/REDUCTION.DISABLED".to_string(),
            create_script: "/queue/REDUCTION.CREATE_SCRIPT".to_string(),
            script_status_topic_template: "/topic/SNS.${instrument}.STATUS.POSTPROCESS".to_string(),
            heartbeat: "heart_beat".to_string(),
            ping: "/topic/SNS.COMMON.STATUS.PING".to_string(),
            error: "postprocess_error".to_string(),
        }
    }
}

impl SafeDisplay for DestinationsConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "reduction request: {}\nreduction started: {}\nreduction complete: {}\n\
             reduction error: {}\nreduction disabled: {}\ncreate script: {}\n\
             script status topic template: {}\nheartbeat: {}\nping: {}\nerror: {}",
            self.reduction_request,
            self.reduction_started,
            self.reduction_complete,
            self.reduction_error,
            self.reduction_disabled,
            self.create_script,
            self.script_status_topic_template,
            self.heartbeat,
            self.ping,
            self.error,
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionConfig {
    pub max_concurrent_workers: usize,
    /// 0 disables the per-instrument check (§3 invariant 2).
    pub jobs_per_instrument: usize,
    /// Poll interval used by `wait_for_slot` (§4.3).
    #[serde(with = "humantime_serde")]
    pub slot_poll_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 10,
            jobs_per_instrument: 2,
            slot_poll_interval: Duration::from_secs(1),
        }
    }
}

impl SafeDisplay for AdmissionConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "max concurrent workers: {}\njobs per instrument: {}\nslot poll interval: {:?}",
            self.max_concurrent_workers, self.jobs_per_instrument, self.slot_poll_interval
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceLimitsConfig {
    /// Percent of total system memory a worker's whole process tree may use.
    pub memory_percent: f64,
    #[serde(with = "humantime_serde")]
    pub memory_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub wall_clock_limit: Duration,
    /// Bounded wait for graceful-stop before force-kill, and again before
    /// giving up with a warning (§4.1 tree termination).
    #[serde(with = "humantime_serde")]
    pub termination_grace_period: Duration,
    pub ignorable_error_patterns: Vec<String>,
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            memory_percent: 80.0,
            memory_check_interval: Duration::from_secs(5),
            wall_clock_limit: Duration::from_secs(60 * 60 * 24),
            termination_grace_period: Duration::from_secs(10),
            ignorable_error_patterns: Vec::new(),
        }
    }
}

impl SafeDisplay for ResourceLimitsConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "memory percent: {}\nmemory check interval: {:?}\nwall clock limit: {:?}\n\
             termination grace period: {:?}\nignorable error patterns: {:?}",
            self.memory_percent,
            self.memory_check_interval,
            self.wall_clock_limit,
            self.termination_grace_period,
            self.ignorable_error_patterns,
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Root under which `<facility>/<instrument>/shared/autoreduce` is
    /// resolved; overridable for test/dev deployments.
    pub instrument_shared_root: Option<PathBuf>,
    /// Overrides the proposal shared directory (`dev_output_dir` in §6).
    pub dev_output_dir: Option<PathBuf>,
    /// Interpreter invoked as argv[0] of every reduction worker.
    pub python_executable: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            instrument_shared_root: None,
            dev_output_dir: None,
            python_executable: PathBuf::from("python3"),
        }
    }
}

impl SafeDisplay for FilesystemConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "instrument shared root: {:?}\ndev output dir: {:?}\npython executable: {}",
            self.instrument_shared_root,
            self.dev_output_dir,
            self.python_executable.display()
        )
    }
}

/// The loopback-only `/metrics` endpoint (SPEC_FULL.md §9 resolution:
/// Prometheus text exposition, not pushed anywhere).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_address: std::net::SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: std::net::SocketAddr::from(([127, 0, 0, 1], 9797)),
        }
    }
}

impl SafeDisplay for MetricsConfig {
    fn to_safe_string(&self) -> String {
        format!("enabled: {}\nbind address: {}", self.enabled, self.bind_address)
    }
}

/// The forwarder/catalog processor's destinations and outbound endpoint
/// (§4.2). Optional because a facility deployment without a catalog
/// service simply omits it from its configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub input_destination: String,
    pub started_destination: String,
    pub complete_destination: String,
    pub error_destination: String,
    pub endpoint: Url,
}

impl SafeDisplay for CatalogConfig {
    fn to_safe_string(&self) -> String {
        format!(
            "input destination: {}\nstarted destination: {}\ncomplete destination: {}\n\
             error destination: {}\nendpoint: {}",
            self.input_destination,
            self.started_destination,
            self.complete_destination,
            self.error_destination,
            self.endpoint,
        )
    }
}

/// Loads `AgentConfig` from defaults, an optional file, then environment
/// overrides, mirroring the corpus's `figment`-based `ConfigLoader`.
pub struct ConfigLoader {
    file: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new(file: Option<&Path>) -> Self {
        Self {
            file: file.map(Path::to_path_buf),
        }
    }

    pub fn load(&self) -> Result<AgentConfig, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));
        if let Some(path) = &self.file {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("POSTPROCESS_AGENT_").split("__"));
        figment.extract()
    }
}

pub fn make_config_loader(file: Option<&Path>) -> ConfigLoader {
    ConfigLoader::new(file)
}
