//! Transcoding engine seam. The engine turns one local input file into one
//! local output file according to a [`TranscodeProfile`].

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

pub mod ffmpeg;

pub use ffmpeg::FfmpegEngine;

#[derive(Debug, Error)]
pub enum TranscodeError {
    /// Non-zero exit, crash, or signal from the engine.
    #[error("transcode failed: {reason}")]
    Engine { reason: String },

    /// The engine reported success but the output is unusable.
    #[error("malformed output: {reason}")]
    MalformedOutput { reason: String },

    /// The engine could not be started at all.
    #[error("failed to start engine: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// Target constraints for one output rendition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TranscodeProfile {
    pub name: String,
    pub max_height: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub preset: String,
    pub video_bitrate_kbps: Option<u32>,
    pub extension: String,
}

const BUILTIN_PROFILES: [(&str, u32, u32); 4] = [
    ("360p", 360, 800),
    ("480p", 480, 1400),
    ("720p", 720, 2800),
    ("1080p", 1080, 5000),
];

impl TranscodeProfile {
    pub fn named(name: &str) -> Option<Self> {
        BUILTIN_PROFILES
            .iter()
            .find(|(profile, _, _)| profile.eq_ignore_ascii_case(name.trim()))
            .map(|&(profile, height, bitrate)| Self {
                name: profile.to_string(),
                max_height: height,
                video_codec: "libx264".to_string(),
                audio_codec: "aac".to_string(),
                preset: "fast".to_string(),
                video_bitrate_kbps: Some(bitrate),
                extension: "mp4".to_string(),
            })
    }

    pub fn names() -> Vec<&'static str> {
        BUILTIN_PROFILES.iter().map(|(name, _, _)| *name).collect()
    }

    /// Scale filter: cap the height, keep aspect ratio, force an even width.
    pub fn scale_filter(&self) -> String {
        format!("scale=-2:min(ih\\,{})", self.max_height)
    }
}

#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Transcode `input` into `output`. Must return [`TranscodeError::Cancelled`]
    /// promptly once `cancel` fires, with the engine process already gone.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &TranscodeProfile,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError>;
}
