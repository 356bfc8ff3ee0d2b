//! Worker process configuration, loaded from the environment.

use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "SERVICE_NAME", default = "fabric-worker")]
    pub service_name: String,

    #[envconfig(from = "SERVICE_VERSION", default = "0.1.0")]
    pub service_version: String,

    #[envconfig(from = "ENVIRONMENT", default = "development")]
    pub environment: String,

    /// Optional: without a database the worker runs only the jobs that
    /// need no storage (exports, maintenance).
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: Option<String>,

    #[envconfig(from = "WORKER_CONCURRENCY", default = "5")]
    pub worker_concurrency: usize,

    #[envconfig(from = "POLL_INTERVAL", default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "REQUEST_TIMEOUT", default = "5000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "OTEL_URL")]
    pub otel_url: Option<String>,

    /// Parsed and clamped by [`Config::sampling_rate`]; kept raw so an
    /// invalid value degrades to the default instead of failing startup.
    #[envconfig(from = "OTEL_SAMPLING_RATE", default = "1.0")]
    pub otel_sampling_rate: String,

    #[envconfig(from = "MAX_ACTIVE_JOBS_PER_ORG", default = "10")]
    pub max_active_jobs_per_org: u32,

    #[envconfig(from = "HEARTBEAT_PATH", default = "/tmp/worker-heartbeat")]
    pub heartbeat_path: String,

    #[envconfig(from = "EXPORT_BASE_DIR", default = "/tmp/fabric-exports")]
    pub export_base_dir: String,

    #[envconfig(from = "ENABLE_FEEDBACK_INGEST", default = "false")]
    pub enable_feedback_ingest: bool,

    /// Target for the HTTP publish adapter. Without it the publish job is
    /// not registered.
    #[envconfig(from = "PUBLISH_ENDPOINT")]
    pub publish_endpoint: Option<String>,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// OTEL sampling rate clamped to [0, 1]. Unparseable input warns on
    /// stderr and falls back to 1.0.
    pub fn sampling_rate(&self) -> f64 {
        match self.otel_sampling_rate.parse::<f64>() {
            Ok(rate) => rate.clamp(0.0, 1.0),
            Err(_) => {
                eprintln!(
                    "invalid OTEL_SAMPLING_RATE {:?}, defaulting to 1.0",
                    self.otel_sampling_rate
                );
                1.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "expected a duration in milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Config {
        let mut map: HashMap<String, String> = HashMap::new();
        for (key, value) in vars {
            map.insert((*key).to_owned(), (*value).to_owned());
        }
        Config::init_from_hashmap(&map).expect("config should initialize")
    }

    #[test]
    fn defaults_apply() {
        let config = config_with(&[]);
        assert_eq!(config.bind(), "0.0.0.0:3301");
        assert_eq!(config.worker_concurrency, 5);
        assert_eq!(config.poll_interval.0, time::Duration::from_millis(100));
        assert!(!config.enable_feedback_ingest);
        assert_eq!(config.sampling_rate(), 1.0);
    }

    #[test]
    fn sampling_rate_clamps_and_degrades() {
        assert_eq!(
            config_with(&[("OTEL_SAMPLING_RATE", "0.25")]).sampling_rate(),
            0.25
        );
        assert_eq!(
            config_with(&[("OTEL_SAMPLING_RATE", "7")]).sampling_rate(),
            1.0
        );
        assert_eq!(
            config_with(&[("OTEL_SAMPLING_RATE", "-1")]).sampling_rate(),
            0.0
        );
        assert_eq!(
            config_with(&[("OTEL_SAMPLING_RATE", "not-a-number")]).sampling_rate(),
            1.0
        );
    }

    #[test]
    fn durations_parse_from_millis() {
        let config = config_with(&[("POLL_INTERVAL", "250")]);
        assert_eq!(config.poll_interval.0, time::Duration::from_millis(250));
        assert!("abc".parse::<EnvMsDuration>().is_err());
    }
}
