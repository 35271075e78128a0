use anyhow::{bail, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://asistencia.db";
pub const DEFAULT_BATCH_PATH: &str = "/api/registrar/";
pub const DEFAULT_SINGLE_PATH: &str = "/api/registrar-asistencia/";

/// How pending records are grouped into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionMode {
    /// One request per (project, date) group, acknowledged per record.
    Batch,
    /// One request per record.
    PerRecord,
}

impl FromStr for SubmissionMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "batch" => Ok(SubmissionMode::Batch),
            "per-record" | "per_record" | "single" => Ok(SubmissionMode::PerRecord),
            other => bail!("unknown submission mode {:?} (expected batch or per-record)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub batch_path: String,
    pub single_path: String,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn batch_url(&self) -> String {
        join_url(&self.base_url, &self.batch_path)
    }

    pub fn single_url(&self) -> String {
        join_url(&self.base_url, &self.single_path)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mode: SubmissionMode,
    pub max_rejections: u32,
    pub debounce: Duration,
    pub probe_interval: Duration,
    /// How often the long-running mode looks for records queued by other
    /// processes.
    pub queue_poll: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SubmissionMode::Batch,
            max_rejections: 3,
            debounce: Duration::from_millis(1500),
            probe_interval: Duration::from_secs(5),
            queue_poll: Duration::from_secs(10),
            retry_base: Duration::from_secs(30),
            retry_max: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Absent until `ASISTENCIA_API_URL` is set; local-only commands work without it.
    pub remote: Option<RemoteConfig>,
    pub sync: SyncConfig,
}

impl Config {
    /// Reads the configuration from the environment. Call `dotenv()` first.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("ASISTENCIA_DATABASE_URL")
            .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let request_timeout =
            Duration::from_secs(parse_var("ASISTENCIA_REQUEST_TIMEOUT_SECS", 15)?);
        if request_timeout.is_zero() || request_timeout > Duration::from_secs(120) {
            bail!("ASISTENCIA_REQUEST_TIMEOUT_SECS must be between 1 and 120");
        }

        let remote = match env::var("ASISTENCIA_API_URL") {
            Ok(base_url) if !base_url.trim().is_empty() => Some(RemoteConfig {
                base_url: base_url.trim().to_string(),
                batch_path: env::var("ASISTENCIA_BATCH_PATH")
                    .unwrap_or_else(|_| DEFAULT_BATCH_PATH.to_string()),
                single_path: env::var("ASISTENCIA_SINGLE_PATH")
                    .unwrap_or_else(|_| DEFAULT_SINGLE_PATH.to_string()),
                request_timeout,
            }),
            _ => None,
        };

        let defaults = SyncConfig::default();
        let mode = match env::var("ASISTENCIA_SUBMISSION_MODE") {
            Ok(value) => value
                .parse()
                .context("Invalid ASISTENCIA_SUBMISSION_MODE")?,
            Err(_) => defaults.mode,
        };

        let max_rejections = parse_var("ASISTENCIA_MAX_REJECTIONS", defaults.max_rejections)?;
        if max_rejections == 0 {
            bail!("ASISTENCIA_MAX_REJECTIONS must be at least 1");
        }

        let retry_base = Duration::from_secs(parse_var("ASISTENCIA_RETRY_BASE_SECS", 30)?);
        let retry_max = Duration::from_secs(parse_var("ASISTENCIA_RETRY_MAX_SECS", 300)?);
        if retry_base.is_zero() || retry_max < retry_base {
            bail!(
                "retry backoff requires 0 < ASISTENCIA_RETRY_BASE_SECS <= ASISTENCIA_RETRY_MAX_SECS"
            );
        }

        let queue_poll = Duration::from_secs(parse_var("ASISTENCIA_QUEUE_POLL_SECS", 10)?);
        if queue_poll.is_zero() {
            bail!("ASISTENCIA_QUEUE_POLL_SECS must be at least 1");
        }

        let sync = SyncConfig {
            mode,
            max_rejections,
            debounce: Duration::from_millis(parse_var("ASISTENCIA_DEBOUNCE_MS", 1500)?),
            probe_interval: Duration::from_secs(parse_var("ASISTENCIA_PROBE_INTERVAL_SECS", 5)?),
            queue_poll,
            retry_base,
            retry_max,
        };

        Ok(Self {
            database_url,
            remote,
            sync,
        })
    }

    pub fn require_remote(&self) -> Result<&RemoteConfig> {
        self.remote
            .as_ref()
            .context("ASISTENCIA_API_URL env var not set")
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
