//! Stream capture on top of a negotiated session
//!
//! Opens a session with the device, routes the video track into the given
//! sink (audio is read and dropped), and keeps it running for the chosen
//! mode before tearing everything down in order: grace period, session
//! close, readers joined, sinks finished.

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::orchestrator::JobOutcome;
use crate::config::{CaptureConfig, WebRtcConfig};
use crate::encoder::{TranscodeError, TranscodeOutcome, Transcoder};
use crate::pipeline::health::HealthSummary;
use crate::pipeline::receiver::{Reassembler, ReceiveStage, ReorderConfig};
use crate::pipeline::sink::{DiscardSink, FileSink, OutputSink};
use crate::pipeline::{MediaKind, PipelineHealth, PipelineStage, SessionState};
use crate::utils::net::sdm::{DeviceApi, DeviceStreamControl};
use crate::utils::net::webrtc::{InboundTrack, StreamSession};
use crate::utils::path::{fallback_raw_path, raw_temp_path, short_device_name};
use crate::utils::sos::SignalOfStop;

/// Units after which a frame-grab capture stops
pub const SNAPSHOT_UNITS: u64 = 30;
/// Upper bound on a frame-grab capture once video flows
pub const SNAPSHOT_WAIT: Duration = Duration::from_secs(5);

const PROGRESS_CHECK: Duration = Duration::from_millis(50);
const STALL_WARN: Duration = Duration::from_secs(5);

/// How long a capture keeps the stream open once video arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    For(Duration),
    /// Until `units` video access units were written or `wait` elapsed
    Frames { units: u64, wait: Duration },
    UntilStopped,
}

impl CaptureMode {
    pub fn snapshot() -> Self {
        CaptureMode::Frames {
            units: SNAPSHOT_UNITS,
            wait: SNAPSHOT_WAIT,
        }
    }
}

type ReaderHandle = JoinHandle<(MediaKind, Result<()>, Arc<PipelineHealth>)>;

/// Captures from one device
pub struct Recorder {
    api: Arc<dyn DeviceApi>,
    device: String,
    webrtc: WebRtcConfig,
    track_timeout: Duration,
    close_grace: Duration,
}

impl Recorder {
    pub fn new(api: Arc<dyn DeviceApi>, device: &str, webrtc: &WebRtcConfig, capture: &CaptureConfig) -> Self {
        Self {
            api,
            device: device.to_string(),
            webrtc: webrtc.clone(),
            track_timeout: capture.track_timeout(),
            close_grace: capture.close_grace(),
        }
    }

    async fn negotiate(&self, sos: SignalOfStop) -> Result<StreamSession> {
        let (session, offer) = StreamSession::open(&self.webrtc, sos)
            .await
            .context("opening media session")?;

        let generated = match self.api.generate_stream(&self.device, &offer).await {
            Ok(generated) => generated,
            Err(e) => {
                session.close().await;
                return Err(e).context("generating stream");
            }
        };
        debug!("Media session {}", generated.media_session_id);

        let control = Arc::new(DeviceStreamControl::new(self.api.clone(), &self.device));
        if let Err(e) = session
            .set_remote(generated.answer_sdp, generated.media_session_id, control)
            .await
        {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Streams video into `sink` for the given mode.
    ///
    /// `sos` stops the capture early; what was received so far is kept.
    pub async fn capture(&self, sink: Box<dyn OutputSink>, mode: CaptureMode, sos: SignalOfStop) -> Result<HealthSummary> {
        let session_sos = sos.child();
        let mut session = self.negotiate(session_sos.clone()).await?;
        let tracks = session
            .take_tracks()
            .ok_or_else(|| anyhow!("session tracks already taken"))?;

        let reorder = ReorderConfig {
            window: self.webrtc.reorder_window,
            ..Default::default()
        };
        let (video_tx, video_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch_tracks(tracks, sink, reorder, video_tx, session_sos.clone()));

        let result = self.drive(&session, video_rx, mode, &sos, &session_sos).await;

        // Closing cancels readers and heartbeats together
        session.close().await;
        let readers = dispatcher.await.unwrap_or_default();
        let mut video = None;
        for reader in readers {
            match reader.await {
                Ok((MediaKind::Video, outcome, health)) => video = Some((outcome, health)),
                Ok((_, _, _)) => {}
                Err(e) => warn!("Track reader aborted: {}", e),
            }
        }

        result?;
        let (outcome, health) = video.ok_or_else(|| anyhow!("video reader never started"))?;
        outcome.context("writing video")?;
        Ok(health.summary())
    }

    async fn drive(
        &self,
        session: &StreamSession,
        video_rx: oneshot::Receiver<Arc<PipelineHealth>>,
        mode: CaptureMode,
        sos: &SignalOfStop,
        session_sos: &SignalOfStop,
    ) -> Result<()> {
        let deadline = Instant::now() + self.track_timeout;
        let stopped = || {
            if session.state() == SessionState::Failed {
                anyhow!("connection failed before video arrived")
            } else {
                anyhow!("stopped before video arrived")
            }
        };

        match session_sos
            .select(tokio::time::timeout_at(deadline, session.wait_connected()))
            .await
        {
            Some(Ok(connected)) => connected?,
            Some(Err(_)) => bail!("not connected within {}s", self.track_timeout.as_secs()),
            None => return Err(stopped()),
        }
        info!("Connected to {}", short_device_name(&self.device));

        let health = match session_sos.select(tokio::time::timeout_at(deadline, video_rx)).await {
            Some(Ok(Ok(health))) => health,
            Some(Ok(Err(_))) => bail!("session ended before a video track arrived"),
            Some(Err(_)) => bail!("no video track within {}s", self.track_timeout.as_secs()),
            None => return Err(stopped()),
        };
        info!("Video track live, capturing");

        let started = Instant::now();
        let capturing = async {
            match mode {
                CaptureMode::For(duration) => tokio::time::sleep(duration).await,
                CaptureMode::Frames { units, wait } => {
                    while health.units_written() < units && started.elapsed() < wait {
                        tokio::time::sleep(PROGRESS_CHECK).await;
                    }
                }
                CaptureMode::UntilStopped => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = session_sos.wait_cancellation() => {}
            _ = capturing => {}
            _ = warn_on_stall(&health) => {}
        }

        check_transport(session.state(), &health, started.elapsed())?;

        if !sos.cancelled() && !session_sos.cancelled() {
            // Packets already in flight still land in the sink
            tokio::time::sleep(self.close_grace).await;
        }
        Ok(())
    }

    /// Captures to a temporary raw file, then produces `output` from it.
    pub async fn record_to_file(
        &self,
        transcoder: &Transcoder,
        output: &Path,
        mode: CaptureMode,
        sos: SignalOfStop,
    ) -> Result<JobOutcome> {
        match transcoder.check(output).await {
            Ok(()) => {}
            Err(e @ TranscodeError::Missing { .. }) => warn!("{}; the raw stream will be kept", e),
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = output.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let raw = raw_temp_path(output);
        let sink = FileSink::create(&raw).await?;

        let summary = match self.capture(Box::new(sink), mode, sos).await {
            Ok(summary) => summary,
            Err(e) => return Err(keep_partial(&raw, output, e).await),
        };
        info!("Captured {}", summary);

        if summary.units_written == 0 {
            let _ = tokio::fs::remove_file(&raw).await;
            bail!("no decodable video received");
        }

        Ok(match transcoder.finalize(&raw, output).await {
            TranscodeOutcome::Complete(path) => JobOutcome::Complete(path),
            TranscodeOutcome::RawKept { raw, reason } => JobOutcome::Partial { kept: raw, reason },
        })
    }
}

/// Fails the capture when the connection or the video track went away.
fn check_transport(state: SessionState, health: &PipelineHealth, elapsed: Duration) -> Result<()> {
    let cause = if state == SessionState::Failed {
        "connection failed"
    } else if health.track_ended() {
        "connection lost: video track ended"
    } else {
        return Ok(());
    };
    bail!(
        "{} after {:.1}s ({} units captured)",
        cause,
        elapsed.as_secs_f32(),
        health.units_written()
    )
}

/// Logs while the video track delivers nothing; never returns.
async fn warn_on_stall(health: &PipelineHealth) {
    let mut check = tokio::time::interval_at(Instant::now() + STALL_WARN, STALL_WARN);
    loop {
        check.tick().await;
        if health.is_stalled(STALL_WARN) {
            warn!("No video for {}s ({} units so far)", STALL_WARN.as_secs(), health.units_written());
        }
    }
}

/// On a failed capture, keeps whatever raw stream was written.
async fn keep_partial(raw: &Path, output: &Path, error: anyhow::Error) -> anyhow::Error {
    let written = tokio::fs::metadata(raw).await.map(|m| m.len()).unwrap_or(0);
    if written == 0 {
        let _ = tokio::fs::remove_file(raw).await;
        return error;
    }

    let fallback = fallback_raw_path(output);
    match tokio::fs::rename(raw, &fallback).await {
        Ok(()) => error.context(format!("partial raw stream kept at {}", fallback.display())),
        Err(_) => error.context(format!("partial raw stream kept at {}", raw.display())),
    }
}

/// Starts one reader per inbound track until the session stops.
///
/// The first video track takes `sink`; audio and any further video are
/// read into a discard sink so their packets are still consumed.
async fn dispatch_tracks(
    mut tracks: mpsc::UnboundedReceiver<InboundTrack>,
    sink: Box<dyn OutputSink>,
    reorder: ReorderConfig,
    video_tx: oneshot::Sender<Arc<PipelineHealth>>,
    sos: SignalOfStop,
) -> Vec<ReaderHandle> {
    let mut sink = Some(sink);
    let mut video_tx = Some(video_tx);
    let mut readers = Vec::new();

    while let Some(Some(track)) = sos.select(tracks.recv()).await {
        let kind = track.kind;
        let health = Arc::new(PipelineHealth::new());

        let track_sink: Box<dyn OutputSink> = match kind {
            MediaKind::Video => match sink.take() {
                Some(sink) => sink,
                None => Box::new(DiscardSink::discard()),
            },
            MediaKind::Audio => Box::new(DiscardSink::discard()),
        };

        let reassembler = Reassembler::new(kind, reorder.clone(), health.clone());
        let stage = ReceiveStage::new(
            Box::new(track.into_source()),
            reassembler,
            track_sink,
            health.clone(),
            sos.clone(),
        );

        let primary = kind == MediaKind::Video && video_tx.is_some();
        readers.push(spawn_reader(stage, primary, sos.clone()));

        if primary && let Some(tx) = video_tx.take() {
            let _ = tx.send(health);
        }
    }

    readers
}

/// Runs one track reader to completion.
///
/// When the primary video reader stops for any reason but cancellation,
/// the whole session is stopped with it.
fn spawn_reader(mut stage: ReceiveStage, primary: bool, session_sos: SignalOfStop) -> ReaderHandle {
    tokio::spawn(async move {
        let kind = stage.kind();
        let mut result = stage.run().await;
        if let Err(e) = stage.shutdown().await {
            warn!("{} sink did not finish cleanly: {:#}", kind, e);
            result = result.and(Err(e));
        }
        let health = stage.health();
        if primary && (result.is_err() || health.track_ended()) {
            session_sos.cancel();
        }
        (kind, result, health)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::receiver::receive_stage::tests::{ScriptedSource, h264_packets};

    #[test]
    fn test_snapshot_mode_bounds() {
        assert_eq!(
            CaptureMode::snapshot(),
            CaptureMode::Frames {
                units: 30,
                wait: Duration::from_secs(5)
            }
        );
    }

    #[tokio::test]
    async fn test_failed_capture_keeps_partial_stream() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");
        let raw = raw_temp_path(&output);
        std::fs::write(&raw, [0, 0, 0, 1, 0x65, 0x88]).unwrap();

        let err = keep_partial(&raw, &output, anyhow!("connection failed")).await;
        let message = format!("{:#}", err);
        assert!(message.contains("partial raw stream kept at"));
        assert!(message.contains("connection failed"));
        assert!(dir.path().join("clip.h264").exists());
        assert!(!raw.exists());
    }

    #[tokio::test]
    async fn test_failed_capture_drops_empty_stream() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mp4");
        let raw = raw_temp_path(&output);
        std::fs::write(&raw, []).unwrap();

        let err = keep_partial(&raw, &output, anyhow!("no video track")).await;
        assert_eq!(err.to_string(), "no video track");
        assert!(!raw.exists());
        assert!(!dir.path().join("clip.h264").exists());
    }

    fn video_reader(frames: u32, sos: &SignalOfStop) -> ReceiveStage {
        let source = ScriptedSource {
            kind: MediaKind::Video,
            packets: h264_packets(frames),
        };
        let health = Arc::new(PipelineHealth::new());
        let reassembler = Reassembler::new(MediaKind::Video, ReorderConfig::default(), health.clone());
        ReceiveStage::new(
            Box::new(source),
            reassembler,
            Box::new(DiscardSink::discard()),
            health,
            sos.clone(),
        )
    }

    #[tokio::test]
    async fn test_video_track_end_stops_session() {
        let sos = SignalOfStop::new();
        let (kind, result, health) = spawn_reader(video_reader(3, &sos), true, sos.clone())
            .await
            .unwrap();

        assert_eq!(kind, MediaKind::Video);
        assert!(result.is_ok());
        assert!(sos.cancelled());

        let err = check_transport(SessionState::Streaming, &health, Duration::from_secs(2)).unwrap_err();
        assert!(err.to_string().contains("video track ended"), "{err}");
    }

    #[tokio::test]
    async fn test_secondary_track_end_keeps_session() {
        let sos = SignalOfStop::new();
        spawn_reader(video_reader(3, &sos), false, sos.clone()).await.unwrap();
        assert!(!sos.cancelled());
    }

    #[test]
    fn test_transport_check() {
        let health = PipelineHealth::new();
        assert!(check_transport(SessionState::Streaming, &health, Duration::ZERO).is_ok());

        let err = check_transport(SessionState::Failed, &health, Duration::ZERO).unwrap_err();
        assert!(err.to_string().starts_with("connection failed"));
    }
}
