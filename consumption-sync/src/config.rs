use serde::Deserialize;
use std::{fs, time::Duration};

use anyhow::{anyhow, Context};
use chrono_tz::Tz;
use time::Date;

use crate::pipeline::PipelineSettings;
use crate::provider::{ekz, Credentials};
use crate::scheduler::SchedulerSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_name")]
    pub name: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub username: String,
    /// Inline password. Prefer `password_env`.
    pub password: Option<String>,
    /// Name of the environment variable holding the password.
    pub password_env: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_data_type")]
    pub data_type: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_days_per_run")]
    pub max_days_per_run: u32,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_true")]
    pub run_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_days_per_run: default_max_days_per_run(),
            max_concurrent_runs: default_max_concurrent_runs(),
            run_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: String,
    /// Register every contract the portal lists for the account.
    #[serde(default = "default_true")]
    pub discover: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            discover: true,
        }
    }
}

/// Statically configured installation. Dates are ISO strings, e.g. `"2023-01-01"`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallationConfig {
    pub id: String,
    pub contract_start: Date,
    pub move_out_date: Option<Date>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub questdb: QuestDbConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub installations: Vec<InstallationConfig>,
    pub control: Option<ControlConfig>,
    pub metrics: Option<MetricsConfig>,
}

fn default_provider_name() -> String {
    "ekz".to_string()
}

fn default_base_url() -> String {
    ekz::DEFAULT_BASE_URL.to_string()
}

fn default_timezone() -> String {
    "Europe/Zurich".to_string()
}

fn default_data_type() -> String {
    ekz::DEFAULT_DATA_TYPE.to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_max_connections() -> u32 {
    5
}

fn default_batch_size() -> usize {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_interval_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_days_per_run() -> u32 {
    30
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_registry_path() -> String {
    "consumption-registry.json".to_string()
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path =
            env::var("CONSUMPTION_SYNC_CONFIG").unwrap_or_else(|_| "consumption-sync.toml".to_string());
        let contents =
            fs::read_to_string(&path).with_context(|| format!("reading config file {path}"))?;
        Self::from_toml_str(&contents).with_context(|| format!("parsing config file {path}"))
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.scheduler.interval_secs == 0 {
            return Err(anyhow!("scheduler.interval_secs must be positive"));
        }
        cfg.timezone()?;
        cfg.samples_per_hour()?;
        Ok(cfg)
    }

    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let password = match (&self.provider.password, &self.provider.password_env) {
            (Some(password), _) => password.clone(),
            (None, Some(var)) => std::env::var(var)
                .with_context(|| format!("provider password variable {var} is not set"))?,
            (None, None) => return Err(anyhow!("provider.password or provider.password_env is required")),
        };
        Ok(Credentials {
            username: self.provider.username.clone(),
            password,
        })
    }

    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.provider
            .timezone
            .parse::<Tz>()
            .map_err(|_| anyhow!("unknown timezone {}", self.provider.timezone))
    }

    /// Daily data types are rejected: no hour would ever be complete, so
    /// nothing would be committed.
    pub fn samples_per_hour(&self) -> anyhow::Result<usize> {
        let data_type = &self.provider.data_type;
        ekz::samples_per_hour(data_type).ok_or_else(|| {
            tracing::error!(
                data_type = %data_type,
                "daily consumption data is not supported, hourly statistics need a sub-daily data type such as {}",
                ekz::DEFAULT_DATA_TYPE
            );
            anyhow!("provider.data_type {data_type} is not a sub-daily data type")
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.fetch_timeout_secs)
    }

    pub fn pipeline_settings(&self) -> anyhow::Result<PipelineSettings> {
        Ok(PipelineSettings {
            provider_name: self.provider.name.clone(),
            timezone: self.timezone()?,
            max_days_per_run: self.scheduler.max_days_per_run,
            fetch_timeout: self.fetch_timeout(),
            samples_per_hour: self.samples_per_hour()?,
        })
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_secs(self.scheduler.interval_secs),
            max_concurrent_runs: self.scheduler.max_concurrent_runs,
            run_on_startup: self.scheduler.run_on_startup,
            discover: self.registry.discover,
        }
    }
}
