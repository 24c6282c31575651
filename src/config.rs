use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::{fs, time::Duration};
use thiserror::Error;
use toml_edit::{DocumentMut, value};
use tracing::info;

use crate::model::ConfidenceBand;

pub const CONFIG_ENV: &str = "INVOICE_WORKFLOW_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = ".config/invoice_workflow.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config edit error: {0}")]
    Edit(#[from] toml_edit::TomlError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,
    pub storage_dir: String,
    pub intake: IntakeConfig,
    pub report_confidence: ReportConfidenceConfig,
    pub reconciler: ReconcilerConfig,
    pub extractor: ExtractorConfig,
    pub auth: Option<AuthConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "invoicestore/workflow.db".to_string(),
            storage_dir: "invoicestore/blobs".to_string(),
            intake: IntakeConfig::default(),
            report_confidence: ReportConfidenceConfig::default(),
            reconciler: ReconcilerConfig::default(),
            extractor: ExtractorConfig::default(),
            auth: None,
        }
    }
}

/// Document-level routing thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// At or above: auto-accept and create the report.
    pub auto_accept_threshold: u8,
    /// Below: still routed to review, with a low-confidence warning.
    pub review_threshold: u8,
    pub extraction_timeout_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            auto_accept_threshold: 80,
            review_threshold: 50,
            extraction_timeout_ms: 300_000,
        }
    }
}

impl IntakeConfig {
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

/// Report display bands. Tuned separately from the intake gate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfidenceConfig {
    pub verified: u8,
    pub high: u8,
    pub medium: u8,
}

impl Default for ReportConfidenceConfig {
    fn default() -> Self {
        Self {
            verified: 100,
            high: 80,
            medium: 50,
        }
    }
}

impl ReportConfidenceConfig {
    /// Reports without a score (manual entries) fall in the lowest band.
    pub fn band(&self, score: Option<u8>) -> ConfidenceBand {
        match score {
            Some(s) if s >= self.verified => ConfidenceBand::Verified,
            Some(s) if s >= self.high => ConfidenceBand::High,
            Some(s) if s >= self.medium => ConfidenceBand::Medium,
            _ => ConfidenceBand::Low,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub poll_interval_ms: u64,
    /// Extra attempts for a failed read before the poll gives up.
    pub read_retries: u32,
    pub retry_backoff_ms: u64,
    /// How long terminal documents stay visible in the inbox.
    pub recent_window_secs: i64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            read_retries: 3,
            retry_backoff_ms: 200,
            recent_window_secs: 86_400,
        }
    }
}

impl ReconcilerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn recent_window(&self) -> time::Duration {
        time::Duration::seconds(self.recent_window_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorBackend {
    #[default]
    Heuristics,
    Remote,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExtractorConfig {
    pub backend: ExtractorBackend,
    pub remote: RemoteConfig,
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen3:8b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub tokens: Tokens,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tokens {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: String,
}

impl Config {
    /// Config file location: `$INVOICE_WORKFLOW_CONFIG` or the default path.
    pub fn path_from_env() -> PathBuf {
        std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intake = &self.intake;
        if !(intake.review_threshold <= intake.auto_accept_threshold
            && intake.auto_accept_threshold <= 100)
        {
            return Err(ConfigError::Invalid(format!(
                "intake thresholds must satisfy review ({}) <= auto_accept ({}) <= 100",
                intake.review_threshold, intake.auto_accept_threshold
            )));
        }

        let bands = &self.report_confidence;
        if !(bands.medium <= bands.high && bands.high <= bands.verified && bands.verified <= 100) {
            return Err(ConfigError::Invalid(
                "report_confidence must satisfy medium <= high <= verified <= 100".to_string(),
            ));
        }

        if intake.extraction_timeout_ms == 0 || self.reconciler.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "extraction_timeout_ms and poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Rewrite `[auth.tokens].access_token` in place, keeping the rest of the
    /// file's formatting.
    pub fn update_access_token(path: impl AsRef<Path>, new_token: &str) -> Result<(), ConfigError> {
        let content = fs::read_to_string(&path)?;
        let mut doc = content.parse::<DocumentMut>()?;

        doc["auth"]["tokens"]["access_token"] = value(new_token);

        fs::write(&path, doc.to_string())?;
        Ok(())
    }
}
