use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::config::env::{self, EnvKey};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    S3,
    Local,
}

#[derive(Clone, Debug, Deserialize)]
pub struct S3Settings {
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub raw_bucket: String,
    pub processed_bucket: String,
    pub public_read: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub server_port: u16,
    pub ledger_backend: LedgerBackend,
    pub database_url: Option<String>,
    pub storage_backend: StorageBackend,
    pub s3: Option<S3Settings>,
    pub local_storage_root: PathBuf,
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    pub max_attempts: i32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub scratch_dir: PathBuf,
    pub stale_job_deadline_secs: u64,
    pub stale_sweep_interval_secs: u64,
    pub ffmpeg_path: String,
    pub ffprobe_path: Option<String>,
    pub transcode_profile: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let ledger_backend = match env::get_or(EnvKey::LedgerBackend, "postgres").as_str() {
            "postgres" => LedgerBackend::Postgres,
            "memory" => LedgerBackend::Memory,
            other => {
                return Err(ConfigError::Invalid {
                    key: EnvKey::LedgerBackend.as_str(),
                    reason: format!("unknown ledger backend '{}'", other),
                });
            }
        };

        let database_url = env::get(EnvKey::DatabaseUrl).ok();
        if ledger_backend == LedgerBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing(EnvKey::DatabaseUrl.as_str()));
        }

        let storage_backend = match env::get_or(EnvKey::StorageBackend, "s3").as_str() {
            "s3" => StorageBackend::S3,
            "local" => StorageBackend::Local,
            other => {
                return Err(ConfigError::Invalid {
                    key: EnvKey::StorageBackend.as_str(),
                    reason: format!("unknown storage backend '{}'", other),
                });
            }
        };

        let s3 = match storage_backend {
            StorageBackend::S3 => Some(S3Settings {
                endpoint: required(EnvKey::MinioUrl)?,
                region: env::get_or(EnvKey::AwsRegion, "us-east-1"),
                access_key: required(EnvKey::MinioAccessKey)?,
                secret_key: required(EnvKey::MinioSecretKey)?,
                raw_bucket: env::get_or(EnvKey::RawBucket, "raw-videos"),
                processed_bucket: env::get_or(EnvKey::ProcessedBucket, "processed-videos"),
                public_read: env::get_flag(EnvKey::PublishPublicRead),
            }),
            StorageBackend::Local => None,
        };

        let ffprobe_path = Some(env::get_or(EnvKey::FfprobePath, "ffprobe"))
            .filter(|path| !path.trim().is_empty());

        let config = Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000),
            ledger_backend,
            database_url,
            storage_backend,
            s3,
            local_storage_root: PathBuf::from(env::get_or(EnvKey::LocalStorageRoot, "./object-store")),
            worker_concurrency: env::get_parsed(EnvKey::WorkerConcurrency, 2),
            queue_capacity: env::get_parsed(EnvKey::QueueCapacity, 0),
            max_attempts: env::get_parsed(EnvKey::MaxAttempts, 3),
            retry_backoff_base_ms: env::get_parsed(EnvKey::RetryBackoffBaseMs, 1000),
            retry_backoff_max_ms: env::get_parsed(EnvKey::RetryBackoffMaxMs, 300_000),
            scratch_dir: PathBuf::from(env::get_or(EnvKey::ScratchDir, "./scratch")),
            stale_job_deadline_secs: env::get_parsed(EnvKey::StaleJobDeadlineSecs, 3600),
            stale_sweep_interval_secs: env::get_parsed(EnvKey::StaleSweepIntervalSecs, 60),
            ffmpeg_path: env::get_or(EnvKey::FfmpegPath, "ffmpeg"),
            ffprobe_path,
            transcode_profile: env::get_or(EnvKey::TranscodeProfile, "360p"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: EnvKey::WorkerConcurrency.as_str(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attempts < 1 {
            return Err(ConfigError::Invalid {
                key: EnvKey::MaxAttempts.as_str(),
                reason: "must be at least 1".to_string(),
            });
        }
        if crate::infrastructure::transcode::TranscodeProfile::named(&self.transcode_profile).is_none() {
            return Err(ConfigError::Invalid {
                key: EnvKey::TranscodeProfile.as_str(),
                reason: format!("unknown profile '{}'", self.transcode_profile),
            });
        }
        Ok(())
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn stale_job_deadline(&self) -> Duration {
        Duration::from_secs(self.stale_job_deadline_secs)
    }

    pub fn stale_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stale_sweep_interval_secs)
    }
}

fn required(key: EnvKey) -> Result<String, ConfigError> {
    let name = key.as_str();
    env::get(key).map_err(|_| ConfigError::Missing(name))
}
