use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    LedgerBackend,
    StorageBackend,
    MinioUrl,
    MinioAccessKey,
    MinioSecretKey,
    AwsRegion,
    RawBucket,
    ProcessedBucket,
    PublishPublicRead,
    LocalStorageRoot,
    WorkerConcurrency,
    QueueCapacity,
    MaxAttempts,
    RetryBackoffBaseMs,
    RetryBackoffMaxMs,
    ScratchDir,
    StaleJobDeadlineSecs,
    StaleSweepIntervalSecs,
    FfmpegPath,
    FfprobePath,
    TranscodeProfile,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::LedgerBackend => "LEDGER_BACKEND",
            EnvKey::StorageBackend => "STORAGE_BACKEND",
            EnvKey::MinioUrl => "MINIO_ENDPOINT",
            EnvKey::MinioAccessKey => "AWS_ACCESS_KEY_ID",
            EnvKey::MinioSecretKey => "AWS_SECRET_ACCESS_KEY",
            EnvKey::AwsRegion => "AWS_REGION",
            EnvKey::RawBucket => "RAW_BUCKET",
            EnvKey::ProcessedBucket => "PROCESSED_BUCKET",
            EnvKey::PublishPublicRead => "PUBLISH_PUBLIC_READ",
            EnvKey::LocalStorageRoot => "LOCAL_STORAGE_ROOT",
            EnvKey::WorkerConcurrency => "WORKER_CONCURRENCY",
            EnvKey::QueueCapacity => "QUEUE_CAPACITY",
            EnvKey::MaxAttempts => "JOB_MAX_ATTEMPTS",
            EnvKey::RetryBackoffBaseMs => "RETRY_BACKOFF_BASE_MS",
            EnvKey::RetryBackoffMaxMs => "RETRY_BACKOFF_MAX_MS",
            EnvKey::ScratchDir => "SCRATCH_DIR",
            EnvKey::StaleJobDeadlineSecs => "STALE_JOB_DEADLINE_SECS",
            EnvKey::StaleSweepIntervalSecs => "STALE_SWEEP_INTERVAL_SECS",
            EnvKey::FfmpegPath => "FFMPEG_PATH",
            EnvKey::FfprobePath => "FFPROBE_PATH",
            EnvKey::TranscodeProfile => "TRANSCODE_PROFILE",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> T {
    match get(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

pub fn get_flag(key: EnvKey) -> bool {
    matches!(
        get(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Ok("1" | "true" | "yes" | "on")
    )
}
