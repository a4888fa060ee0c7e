use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Downloading,
    Transcoding,
    Uploading,
    Done,
    Failed,
}

impl JobState {
    pub const ACTIVE: [JobState; 3] = [
        JobState::Downloading,
        JobState::Transcoding,
        JobState::Uploading,
    ];

    pub const NON_TERMINAL: [JobState; 4] = [
        JobState::Pending,
        JobState::Downloading,
        JobState::Transcoding,
        JobState::Uploading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Downloading => "DOWNLOADING",
            JobState::Transcoding => "TRANSCODING",
            JobState::Uploading => "UPLOADING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        }
    }

    /// States that own a scratch file pair.
    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    /// Forward along PENDING → DOWNLOADING → TRANSCODING → UPLOADING → DONE,
    /// FAILED from any non-terminal state, and FAILED → PENDING for retries.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Downloading)
                | (Downloading, Transcoding)
                | (Transcoding, Uploading)
                | (Uploading, Done)
                | (Pending | Downloading | Transcoding | Uploading, Failed)
                | (Failed, Pending)
        )
    }

    /// Entering DOWNLOADING from PENDING starts a new attempt.
    pub fn starts_attempt(from: JobState, to: JobState) -> bool {
        from == JobState::Pending && to == JobState::Downloading
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "DOWNLOADING" => Ok(JobState::Downloading),
            "TRANSCODING" => Ok(JobState::Transcoding),
            "UPLOADING" => Ok(JobState::Uploading),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

impl TryFrom<String> for JobState {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Serialize, Deserialize, FromRow, Clone, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub source_key: String,
    pub destination_key: String,
    pub profile: String,
    #[sqlx(try_from = "String")]
    pub state: JobState,
    pub attempt: i32,
    pub max_attempts: i32,
    pub recoveries: i32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Job {
    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Everything needed to insert a fresh PENDING row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_key: String,
    pub destination_key: String,
    pub profile: String,
    pub max_attempts: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobState::*;

    #[test]
    fn forward_path_is_monotonic() {
        assert!(Pending.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Transcoding));
        assert!(Transcoding.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Done));

        assert!(!Transcoding.can_transition_to(Downloading));
        assert!(!Pending.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Pending));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        for state in JobState::NON_TERMINAL {
            assert!(state.can_transition_to(Failed), "{state}");
        }
        assert!(!Done.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Downloading));
    }

    #[test]
    fn done_accepts_nothing() {
        for to in [Pending, Downloading, Transcoding, Uploading, Done, Failed] {
            assert!(!Done.can_transition_to(to));
        }
    }

    #[test]
    fn state_names_round_trip_through_text() {
        for state in [Pending, Downloading, Transcoding, Uploading, Done, Failed] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<JobState>().is_err());
        assert_eq!(serde_json::to_string(&Downloading).unwrap(), "\"DOWNLOADING\"");
    }
}
