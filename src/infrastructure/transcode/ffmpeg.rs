use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TranscodeEngine, TranscodeError, TranscodeProfile};

/// Bytes of stderr kept for error reports.
const STDERR_TAIL: usize = 2048;

#[derive(Clone, Debug)]
pub struct FfmpegEngine {
    ffmpeg_path: String,
    ffprobe_path: Option<String>,
}

impl FfmpegEngine {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: Option<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path,
        }
    }

    pub fn build_args(input: &Path, output: &Path, profile: &TranscodeProfile) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vf".to_string(),
            profile.scale_filter(),
            "-c:v".to_string(),
            profile.video_codec.clone(),
            "-preset".to_string(),
            profile.preset.clone(),
        ];

        if let Some(kbps) = profile.video_bitrate_kbps {
            args.extend_from_slice(&[
                "-b:v".to_string(),
                format!("{}k", kbps),
                "-maxrate".to_string(),
                format!("{}k", kbps + kbps / 5),
                "-bufsize".to_string(),
                format!("{}k", kbps * 2),
            ]);
        }

        args.extend_from_slice(&[
            "-c:a".to_string(),
            profile.audio_codec.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            output.to_string_lossy().to_string(),
        ]);

        args
    }

    async fn verify_output(
        &self,
        output: &Path,
        profile: &TranscodeProfile,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let metadata = tokio::fs::metadata(output)
            .await
            .map_err(|_| TranscodeError::MalformedOutput {
                reason: format!("output {} was not produced", output.display()),
            })?;

        if metadata.len() == 0 {
            return Err(TranscodeError::MalformedOutput {
                reason: "output file is empty".to_string(),
            });
        }

        let Some(ffprobe) = &self.ffprobe_path else {
            return Ok(());
        };

        let mut cmd = Command::new(ffprobe);
        cmd.args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=height",
            "-of",
            "csv=p=0",
        ])
        .arg(output);

        let stdout = match run_cancellable(cmd, cancel).await {
            Ok(stdout) => stdout,
            Err(TranscodeError::Engine { reason }) => {
                return Err(TranscodeError::MalformedOutput {
                    reason: format!("ffprobe rejected output: {}", reason),
                });
            }
            Err(e) => return Err(e),
        };

        let height: u32 = String::from_utf8_lossy(&stdout)
            .trim()
            .parse()
            .map_err(|_| TranscodeError::MalformedOutput {
                reason: "output has no readable video stream".to_string(),
            })?;

        if height == 0 || height > profile.max_height {
            return Err(TranscodeError::MalformedOutput {
                reason: format!("output height {} outside 1..={}", height, profile.max_height),
            });
        }

        debug!(height, profile = %profile.name, "Output verified");
        Ok(())
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        profile: &TranscodeProfile,
        cancel: &CancellationToken,
    ) -> Result<(), TranscodeError> {
        let args = Self::build_args(input, output, profile);
        info!(profile = %profile.name, input = %input.display(), "🎥 Starting ffmpeg");

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(&args);
        run_cancellable(cmd, cancel).await?;

        self.verify_output(output, profile, cancel).await
    }
}

/// Run an engine command in its own process group until it exits or `cancel`
/// fires, returning its stdout. On cancellation the whole group is killed and
/// reaped before returning.
pub async fn run_cancellable(mut cmd: Command, cancel: &CancellationToken) -> Result<Vec<u8>, TranscodeError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(TranscodeError::Spawn)?;

    let stdout_task = child.stdout.take().map(drain);
    let stderr_task = child.stderr.take().map(drain);

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| TranscodeError::Engine {
            reason: format!("failed to wait for engine: {}", e),
        })?,
        _ = cancel.cancelled() => {
            kill_group(&mut child);
            if let Err(e) = child.wait().await {
                warn!(error = %e, "Failed to reap cancelled engine process");
            }
            for task in [stdout_task, stderr_task].into_iter().flatten() {
                task.abort();
            }
            return Err(TranscodeError::Cancelled);
        }
    };

    let stdout = match stdout_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };
    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => Vec::new(),
    };

    if status.success() {
        return Ok(stdout);
    }

    let exit = match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    };
    Err(TranscodeError::Engine {
        reason: format!("{}: {}", exit, tail(&stderr)),
    })
}

fn drain<R>(mut pipe: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

fn kill_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child leads its own group, so -pid addresses every process it spawned.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
        if rc == -1 {
            warn!(pid, error = %std::io::Error::last_os_error(), "killpg failed");
        }
    }
    let _ = child.start_kill();
}

fn tail(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
