use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::paths::ListenerPaths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Missing configuration file {0}")]
    Missing(PathBuf),
}

pub const DEFAULT_TOPIC: &str = "fink_kn_candidates_ztf";
pub const DEFAULT_BROKER_URL: &str = "https://fink-portal.org";

#[derive(Clone, Debug, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// Operator (admin) recipients. Only ever receive start-up, crash and
/// fanout-escalation messages.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub sudoers: Vec<String>,
    #[serde(default)]
    pub test_users: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_poll_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_poll_timeout_secs(),
            topics: default_topics(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_sleep_time_secs")]
    pub sleep_time_secs: u64,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sleep_time_secs: default_sleep_time_secs(),
            consumer: ConsumerConfig::default(),
        }
    }
}

impl PollingConfig {
    pub fn sleep_time(&self) -> Duration {
        Duration::from_secs(self.sleep_time_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.consumer.timeout_secs)
    }
}

/// Credentials for the broker's Kafka stream.
#[derive(Clone, Debug, Deserialize)]
pub struct KafkaConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    pub bootstrap_servers: String,
    pub group_id: String,
    /// Avro schema the alert payloads were written with.
    pub schema_path: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Kafka,
    Replay,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub replay_dir: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: default_broker_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LightcurveConfig {
    /// Append the triggering candidate to the light curve before rendering.
    /// Off by default: historically the append never took effect.
    #[serde(default)]
    pub append_latest_candidate: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SiteConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    #[serde(default)]
    pub height_m: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub lightcurve: LightcurveConfig,
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub operators: OperatorConfig,
    /// YAML file holding the subscriber list. Re-read for every batch.
    #[serde(default = "default_recipients_file")]
    pub recipients_file: PathBuf,
    #[serde(default = "default_sites")]
    pub sites: Vec<SiteConfig>,
}

impl AppConfig {
    pub fn paths(&self) -> ListenerPaths {
        ListenerPaths::new(&self.base_path)
    }

    /// Test mode is on if requested explicitly or if `<base>/test_mode` exists.
    pub fn resolve_test_mode(&self) -> bool {
        self.test_mode || self.paths().test_mode_marker().exists()
    }

    pub fn recipients_path(&self) -> PathBuf {
        if self.recipients_file.is_absolute() {
            self.recipients_file.clone()
        } else {
            self.base_path.join(&self.recipients_file)
        }
    }

    /// Checks the files the configured source and fanout depend on.
    pub fn check_required_files(&self) -> Result<(), ConfigError> {
        let recipients = self.recipients_path();
        if !recipients.exists() {
            return Err(ConfigError::Missing(recipients));
        }
        match self.source.kind {
            SourceKind::Kafka => {
                let kafka = self.kafka.as_ref().ok_or_else(|| {
                    ConfigError::Validation("source.kind is kafka but no kafka section".into())
                })?;
                if !kafka.schema_path.exists() {
                    return Err(ConfigError::Missing(kafka.schema_path.clone()));
                }
            }
            SourceKind::Replay => {
                let dir = self.replay_dir();
                if !dir.is_dir() {
                    return Err(ConfigError::Missing(dir));
                }
            }
        }
        Ok(())
    }

    pub fn replay_dir(&self) -> PathBuf {
        self.source
            .replay_dir
            .clone()
            .unwrap_or_else(|| self.paths().alert_db())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.consumer.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "polling.consumer.timeout_secs must be > 0".into(),
            ));
        }
        if self.polling.consumer.topics.is_empty() {
            return Err(ConfigError::Validation(
                "polling.consumer.topics must list at least one topic".into(),
            ));
        }
        if self.smtp.port == 0 {
            return Err(ConfigError::Validation("smtp.port must be > 0".into()));
        }
        if !(self.broker.base_url.starts_with("https://")
            || self.broker.base_url.starts_with("http://"))
        {
            return Err(ConfigError::Validation(format!(
                "broker.base_url must be an http(s) URL, got {}",
                self.broker.base_url
            )));
        }
        Ok(())
    }
}

fn default_poll_timeout_secs() -> u64 {
    5
}

fn default_sleep_time_secs() -> u64 {
    60
}

fn default_topics() -> Vec<String> {
    vec![DEFAULT_TOPIC.to_string()]
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_recipients_file() -> PathBuf {
    PathBuf::from("config/recipients.yaml")
}

fn default_sites() -> Vec<SiteConfig> {
    vec![SiteConfig {
        name: Some("La Silla Observatory".to_string()),
        latitude_deg: -29.2567,
        longitude_deg: -70.7346,
        height_m: 2347.0,
    }]
}

/// Load application configuration from `config.yaml` + environment overrides.
///
/// Any environment variable matching the key path separated by double
/// underscores (e.g. `SMTP__PORT`) overrides the file value.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = std::env::var("KN_LISTENER_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    load_config_from(Path::new(&path))
}

pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }
    let cfg = Config::builder()
        .add_source(File::from(path))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
smtp:
  server: "smtp.example.com"
  port: 587
  username: "bot"
  password: "secret"
  from: "bot@example.com"
"#;

    #[test]
    fn defaults_match_polling_cadence() {
        let cfg = parse(MINIMAL);
        assert_eq!(cfg.polling.sleep_time(), Duration::from_secs(60));
        assert_eq!(cfg.polling.poll_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.polling.consumer.topics, vec![DEFAULT_TOPIC.to_string()]);
        assert_eq!(cfg.source.kind, SourceKind::Kafka);
        assert!(!cfg.lightcurve.append_latest_candidate);
        assert_eq!(cfg.sites.len(), 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut cfg = parse(MINIMAL);
        cfg.polling.consumer.timeout_secs = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_non_http_broker() {
        let mut cfg = parse(MINIMAL);
        cfg.broker.base_url = "ftp://fink".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn marker_file_enables_test_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = parse(MINIMAL);
        cfg.base_path = dir.path().to_path_buf();
        assert!(!cfg.resolve_test_mode());
        std::fs::write(dir.path().join("test_mode"), b"").unwrap();
        assert!(cfg.resolve_test_mode());
    }

    #[test]
    fn missing_recipients_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = parse(MINIMAL);
        cfg.base_path = dir.path().to_path_buf();
        cfg.source.kind = SourceKind::Replay;
        match cfg.check_required_files() {
            Err(ConfigError::Missing(path)) => assert!(path.ends_with("config/recipients.yaml")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
