use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;

use super::orchestrator::{CaptureRunner, JobOutcome};
use super::recorder::{CaptureMode, Recorder};
use crate::config::Config;
use crate::encoder::Transcoder;
use crate::events::CaptureEvent;
use crate::utils::net::sdm::DeviceApi;
use crate::utils::sos::SignalOfStop;

/// `<YYYYmmdd-HHMMSS>_<label>_<seq>.<ext>`
pub fn artifact_name(at: DateTime<Local>, label: &str, seq: u64, ext: &str) -> String {
    format!("{}_{}_{:03}.{}", at.format("%Y%m%d-%H%M%S"), label, seq, ext)
}

/// Event captures against the real device API
pub struct DeviceCapture {
    api: Arc<dyn DeviceApi>,
    config: Config,
    transcoder: Transcoder,
    output_dir: PathBuf,
}

impl DeviceCapture {
    pub fn new(api: Arc<dyn DeviceApi>, config: &Config) -> Self {
        Self {
            api,
            transcoder: Transcoder::new(&config.capture.ffmpeg),
            output_dir: config.capture.output_dir.clone(),
            config: config.clone(),
        }
    }

    fn artifact_path(&self, event: &CaptureEvent, seq: u64, ext: &str) -> PathBuf {
        self.output_dir
            .join(artifact_name(Local::now(), &event.label(), seq, ext))
    }
}

#[async_trait]
impl CaptureRunner for DeviceCapture {
    async fn snapshot(&self, event: &CaptureEvent, seq: u64, sos: SignalOfStop) -> Result<JobOutcome> {
        let image = sos
            .select(self.api.fetch_event_image(&event.device, &event.event_id))
            .await
            .context("stopped")?
            .context("generating event image")?;

        let path = self.artifact_path(event, seq, "jpg");
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("creating {}", self.output_dir.display()))?;
        sos.select(self.api.download_image(&image, &path))
            .await
            .context("stopped")?
            .context("downloading event image")?;

        Ok(JobOutcome::Complete(path))
    }

    async fn clip(&self, event: &CaptureEvent, seq: u64, sos: SignalOfStop) -> Result<JobOutcome> {
        let path = self.artifact_path(event, seq, "mp4");
        let recorder = Recorder::new(
            self.api.clone(),
            &event.device,
            &self.config.webrtc,
            &self.config.capture,
        );
        recorder
            .record_to_file(
                &self.transcoder,
                &path,
                CaptureMode::For(self.config.capture.clip_duration()),
                sos,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::net::sdm::{ApiError, EventImage, GeneratedStream};
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::Mutex;

    #[test]
    fn test_artifact_name() {
        let at = Local.with_ymd_and_hms(2026, 10, 17, 9, 5, 3).unwrap();
        assert_eq!(artifact_name(at, "motion", 7, "jpg"), "20261017-090503_motion_007.jpg");
        assert_eq!(artifact_name(at, "person", 1234, "mp4"), "20261017-090503_person_1234.mp4");
    }

    #[derive(Default)]
    struct ImageOnlyApi {
        requested: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl DeviceApi for ImageOnlyApi {
        async fn generate_stream(&self, _device: &str, _offer_sdp: &str) -> Result<GeneratedStream, ApiError> {
            unreachable!("snapshots never open a stream")
        }

        async fn extend_stream(&self, _device: &str, _session_handle: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn stop_stream(&self, _device: &str, _session_handle: &str) -> Result<(), ApiError> {
            Ok(())
        }

        async fn fetch_event_image(&self, device: &str, event_id: &str) -> Result<EventImage, ApiError> {
            self.requested
                .lock()
                .unwrap()
                .push((device.to_string(), event_id.to_string()));
            Ok(EventImage {
                url: "https://images.example/1".into(),
                token: "img-token".into(),
            })
        }

        async fn download_image(&self, _image: &EventImage, dest: &Path) -> Result<(), ApiError> {
            std::fs::write(dest, b"\xff\xd8jpeg").map_err(|source| ApiError::Io {
                path: dest.display().to_string(),
                source,
            })
        }
    }

    #[tokio::test]
    async fn test_snapshot_downloads_event_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.capture.output_dir = dir.path().join("events");

        let api = Arc::new(ImageOnlyApi::default());
        let capture = DeviceCapture::new(api.clone(), &config);
        let event = CaptureEvent::new(
            "enterprises/p/devices/cam",
            "sdm.devices.events.CameraPerson.Person",
            "img-9",
            Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap(),
        );

        let outcome = capture.snapshot(&event, 4, SignalOfStop::new()).await.unwrap();
        let JobOutcome::Complete(path) = outcome else {
            panic!("snapshot should complete");
        };
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_person_004.jpg"), "{name}");
        assert_eq!(std::fs::read(&path).unwrap(), b"\xff\xd8jpeg");
        assert_eq!(
            *api.requested.lock().unwrap(),
            vec![("enterprises/p/devices/cam".to_string(), "img-9".to_string())]
        );
    }
}
