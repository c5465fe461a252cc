use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::utils::path::{extension_of, fallback_raw_path};

/// Output arguments per target container, keyed by file extension.
///
/// - jpg: first decodable picture, high quality
/// - mp4: stream copy into the container
/// - webm: WebM cannot carry H.264, so re-encode to VP9 as fast as possible
const CONTAINER_ARGS: &[(&str, &[&str])] = &[
    ("jpg", &["-frames:v", "1", "-q:v", "2"]),
    ("jpeg", &["-frames:v", "1", "-q:v", "2"]),
    ("mp4", &["-c:v", "copy"]),
    ("webm", &["-c:v", "libvpx-vp9", "-deadline", "realtime", "-b:v", "0", "-crf", "32"]),
];

/// Extensions that mean "keep the raw elementary stream"
const RAW_EXTENSIONS: &[&str] = &["h264", "264"];

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("{program} not found; install ffmpeg to produce {target}")]
    Missing { program: String, target: String },

    #[error("unsupported output format '.{0}' (use .jpg, .mp4, .webm or .h264)")]
    Unsupported(String),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}:\n{stderr}")]
    Failed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("moving {from} into place: {source}")]
    Io {
        from: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a finished capture ended up on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscodeOutcome {
    /// The requested artifact exists
    Complete(PathBuf),
    /// Transcoding failed; the raw stream was kept at the given path
    RawKept { raw: PathBuf, reason: String },
}

/// Runs the external transcoder over raw H.264 streams
#[derive(Debug, Clone)]
pub struct Transcoder {
    program: String,
}

impl Transcoder {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }

    /// Whether `output` can be produced without running the transcoder.
    pub fn is_raw_target(output: &Path) -> bool {
        RAW_EXTENSIONS.contains(&extension_of(output).as_str())
    }

    fn container_args(output: &Path) -> Result<&'static [&'static str], TranscodeError> {
        let ext = extension_of(output);
        CONTAINER_ARGS
            .iter()
            .find(|(e, _)| *e == ext)
            .map(|(_, args)| *args)
            .ok_or(TranscodeError::Unsupported(ext))
    }

    /// Fails early when the output format is unknown or the transcoder is
    /// not installed, before any stream is negotiated.
    pub async fn check(&self, output: &Path) -> Result<(), TranscodeError> {
        if Self::is_raw_target(output) {
            return Ok(());
        }
        Self::container_args(output)?;

        let status = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(TranscodeError::Missing {
                program: self.program.clone(),
                target: output.display().to_string(),
            }),
        }
    }

    /// Convert `raw` into `output`, picking the container from the extension.
    pub async fn transcode(&self, raw: &Path, output: &Path) -> Result<(), TranscodeError> {
        if Self::is_raw_target(output) {
            return tokio::fs::rename(raw, output)
                .await
                .map_err(|source| TranscodeError::Io {
                    from: raw.display().to_string(),
                    source,
                });
        }

        let args = Self::container_args(output)?;
        debug!("{} {:?} -> {}", self.program, args, output.display());

        let result = Command::new(&self.program)
            .args(["-y", "-hide_banner", "-loglevel", "error", "-f", "h264", "-i"])
            .arg(raw)
            .args(args)
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| TranscodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            return Err(TranscodeError::Failed {
                program: self.program.clone(),
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        info!("Wrote {}", output.display());
        Ok(())
    }

    /// Transcode, then clean up: the raw file is removed on success and
    /// kept next to `output` with an `.h264` extension on failure.
    pub async fn finalize(&self, raw: &Path, output: &Path) -> TranscodeOutcome {
        match self.transcode(raw, output).await {
            Ok(()) => {
                if !Self::is_raw_target(output) {
                    let _ = tokio::fs::remove_file(raw).await;
                }
                TranscodeOutcome::Complete(output.to_path_buf())
            }
            Err(e) => {
                let reason = e.to_string();
                let fallback = fallback_raw_path(output);
                match tokio::fs::rename(raw, &fallback).await {
                    Ok(()) => {
                        warn!("{}; raw stream kept at {}", reason, fallback.display());
                        TranscodeOutcome::RawKept {
                            raw: fallback,
                            reason,
                        }
                    }
                    Err(mv) => {
                        warn!("{}; raw stream kept at {} ({})", reason, raw.display(), mv);
                        TranscodeOutcome::RawKept {
                            raw: raw.to_path_buf(),
                            reason,
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::path::raw_temp_path;

    #[test]
    fn test_container_selection() {
        assert_eq!(
            Transcoder::container_args(Path::new("a.JPG")).unwrap(),
            &["-frames:v", "1", "-q:v", "2"]
        );
        assert_eq!(Transcoder::container_args(Path::new("a.mp4")).unwrap(), &["-c:v", "copy"]);
        assert!(matches!(
            Transcoder::container_args(Path::new("a.avi")),
            Err(TranscodeError::Unsupported(ext)) if ext == "avi"
        ));
        assert!(Transcoder::is_raw_target(Path::new("a.h264")));
    }

    #[tokio::test]
    async fn test_failed_transcode_keeps_raw_stream() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("snap.jpg");
        let raw = raw_temp_path(&output);
        std::fs::write(&raw, [0, 0, 0, 1, 0x65]).unwrap();

        // `false` accepts any arguments and exits non-zero
        let outcome = Transcoder::new("false").finalize(&raw, &output).await;

        let kept = dir.path().join("snap.h264");
        match outcome {
            TranscodeOutcome::RawKept { raw: path, reason } => {
                assert_eq!(path, kept);
                assert!(reason.contains("exited with"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!raw.exists());
        assert_eq!(std::fs::read(&kept).unwrap(), vec![0, 0, 0, 1, 0x65]);
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_raw_target_is_moved() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.h264");
        let raw = raw_temp_path(&output);
        std::fs::write(&raw, [1, 2, 3]).unwrap();

        let outcome = Transcoder::new("ffmpeg-not-needed").finalize(&raw, &output).await;
        assert_eq!(outcome, TranscodeOutcome::Complete(output.clone()));
        assert_eq!(std::fs::read(&output).unwrap(), vec![1, 2, 3]);
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let err = Transcoder::new("definitely-not-a-transcoder")
            .check(Path::new("x.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscodeError::Missing { .. }));
    }
}
