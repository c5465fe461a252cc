use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::{debug, info, warn};
use rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::common::{create_peer_connection, create_webrtc_api, media_kind};
use super::heartbeat::{KeyframeRequester, StreamControl, extend_loop, keyframe_loop};
use crate::config::WebRtcConfig;
use crate::pipeline::receiver::{RtpPacket, RtpSource};
use crate::pipeline::state::SessionState;
use crate::pipeline::types::MediaKind;
use crate::utils::sos::SignalOfStop;

/// Remote handle and controls bound when the answer is applied
struct Teardown {
    control: Arc<dyn StreamControl>,
    session_handle: String,
}

/// Transport-independent half of a stream session
///
/// Owns the state machine, the stop signal every session task is scoped
/// to, and the remote teardown hook. The state lives in a watch channel so
/// waiters observe each transition exactly once.
pub struct SessionLifecycle {
    state: watch::Sender<SessionState>,
    sos: SignalOfStop,
    teardown: Mutex<Option<Teardown>>,
    closed: AtomicBool,
}

impl SessionLifecycle {
    pub fn new(sos: SignalOfStop) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            state,
            sos,
            teardown: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `target` if the state machine allows it. Returns whether the state changed.
    pub fn transition(&self, target: SessionState) -> bool {
        let mut from = None;
        let changed = self.state.send_if_modified(|state| {
            if *state != target && state.can_transition_to(&target) {
                from = Some(*state);
                *state = target;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            debug!("Session state: {} -> {}", from, target);
        }
        changed
    }

    /// Enter AwaitingAnswer, then run `apply`; ICE may connect before it returns.
    pub async fn apply_answer<F: Future<Output = Result<()>>>(&self, apply: F) -> Result<()> {
        self.transition(SessionState::AwaitingAnswer);
        apply.await
    }

    /// Transport connected. Only the first call has any effect.
    pub fn mark_connected(&self) -> bool {
        self.transition(SessionState::Connected)
    }

    /// First inbound track arrived.
    pub fn mark_streaming(&self) {
        self.transition(SessionState::Connected);
        self.transition(SessionState::Streaming);
    }

    /// Transport failed: the session is dead and its readers are stopped.
    pub fn mark_failed(&self) {
        if self.transition(SessionState::Failed) {
            self.sos.cancel();
        }
    }

    /// Resolves once the transport is connected, or fails if the session
    /// died first.
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, SessionState::Connected | SessionState::Streaming) || !s.is_active())
            .await
            .map_err(|_| anyhow!("session dropped"))?;
        match state {
            SessionState::Connected | SessionState::Streaming => Ok(()),
            other => bail!("session ended before connecting ({})", other),
        }
    }

    /// Bind the remote handle and start the keyframe and extension loops.
    pub fn start_heartbeats(
        &self,
        requester: Arc<dyn KeyframeRequester>,
        control: Arc<dyn StreamControl>,
        session_handle: String,
        keyframe_interval: Duration,
        extend_interval: Duration,
    ) {
        if let Ok(mut teardown) = self.teardown.lock() {
            *teardown = Some(Teardown {
                control: control.clone(),
                session_handle: session_handle.clone(),
            });
        }

        self.sos.spawn(keyframe_loop(requester, keyframe_interval));
        self.sos.spawn(extend_loop(control, session_handle, extend_interval));
    }

    /// Runs teardown once: stops the heartbeats, asks the remote side to
    /// stop (errors are only logged), then awaits `release`. Later calls
    /// return immediately.
    pub async fn close<F: Future<Output = ()>>(&self, release: F) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.transition(SessionState::Closing);
        self.sos.cancel();

        let teardown = self.teardown.lock().ok().and_then(|mut t| t.take());
        if let Some(Teardown {
            control,
            session_handle,
        }) = teardown
        {
            if let Err(e) = control.stop(&session_handle).await {
                debug!("Stopping remote stream failed: {:#}", e);
            }
        }

        release.await;
        self.transition(SessionState::Closed);
    }
}

/// An inbound track announced by the transport
pub struct InboundTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackRemote>,
}

impl InboundTrack {
    pub fn into_source(self) -> TrackSource {
        TrackSource {
            kind: self.kind,
            track: self.track,
        }
    }
}

/// Reads RTP packets from a remote track
pub struct TrackSource {
    kind: MediaKind,
    track: Arc<TrackRemote>,
}

#[async_trait]
impl RtpSource for TrackSource {
    async fn read_packet(&mut self) -> Result<Option<RtpPacket>> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(Some(RtpPacket {
                payload: packet.payload,
                marker: packet.header.marker,
                sequence_number: packet.header.sequence_number,
                timestamp: packet.header.timestamp,
                received_at: Instant::now(),
            })),
            Err(e) => Err(e).context("reading RTP packet"),
        }
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }
}

#[async_trait]
impl KeyframeRequester for RTCPeerConnection {
    async fn request_keyframes(&self) -> Result<usize> {
        let mut sent = 0;
        for receiver in self.get_receivers().await {
            for track in receiver.tracks().await {
                if track.kind() != RTPCodecType::Video {
                    continue;
                }
                self.write_rtcp(&[Box::new(PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc: track.ssrc(),
                })])
                .await?;
                sent += 1;
            }
        }
        Ok(sent)
    }
}

/// One negotiated receive-only media session with a camera
///
/// Created per capture and never reused. Inbound tracks are delivered over
/// a channel taken with [`StreamSession::take_tracks`].
pub struct StreamSession {
    peer_connection: Arc<RTCPeerConnection>,
    lifecycle: Arc<SessionLifecycle>,
    tracks: Option<mpsc::UnboundedReceiver<InboundTrack>>,
    config: WebRtcConfig,
}

impl StreamSession {
    /// Build the endpoint and gather every local candidate.
    ///
    /// Returns the session and its complete local offer.
    pub async fn open(config: &WebRtcConfig, sos: SignalOfStop) -> Result<(StreamSession, String)> {
        let api = create_webrtc_api()?;
        let peer_connection = create_peer_connection(&api, &config.stun_servers).await?;
        let lifecycle = Arc::new(SessionLifecycle::new(sos));

        let (tracks_tx, tracks_rx) = mpsc::unbounded_channel();
        register_handlers(&peer_connection, &lifecycle, tracks_tx);

        let session = StreamSession {
            peer_connection,
            lifecycle,
            tracks: Some(tracks_rx),
            config: config.clone(),
        };

        match session.create_offer().await {
            Ok(offer) => {
                session.lifecycle.transition(SessionState::OfferReady);
                Ok((session, offer))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .context("creating offer")?;

        let mut gathering_complete = self.peer_connection.gathering_complete_promise().await;
        self.peer_connection
            .set_local_description(offer)
            .await
            .context("setting local description")?;
        // Candidates go out inside the single offer, so gathering must finish first
        let _ = gathering_complete.recv().await;

        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| anyhow!("no local description after gathering"))?;
        Ok(local.sdp)
    }

    /// Apply the remote answer and start the heartbeat loops.
    pub async fn set_remote(
        &self,
        answer_sdp: String,
        session_handle: String,
        control: Arc<dyn StreamControl>,
    ) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp).context("parsing answer")?;
        self.lifecycle
            .apply_answer(async {
                self.peer_connection
                    .set_remote_description(answer)
                    .await
                    .context("setting remote description")
            })
            .await?;

        self.lifecycle.start_heartbeats(
            self.peer_connection.clone(),
            control,
            session_handle,
            self.config.keyframe_interval(),
            self.config.extend_interval(),
        );
        Ok(())
    }

    /// Channel of inbound tracks; `None` after the first call.
    pub fn take_tracks(&mut self) -> Option<mpsc::UnboundedReceiver<InboundTrack>> {
        self.tracks.take()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub async fn wait_connected(&self) -> Result<()> {
        self.lifecycle.wait_connected().await
    }

    /// Idempotent teardown: heartbeats, remote stop, then the transport.
    pub async fn close(&self) {
        let peer_connection = self.peer_connection.clone();
        self.lifecycle
            .close(async move {
                if let Err(e) = peer_connection.close().await {
                    warn!("Closing peer connection failed: {}", e);
                }
            })
            .await;
    }
}

fn register_handlers(
    peer_connection: &RTCPeerConnection,
    lifecycle: &Arc<SessionLifecycle>,
    tracks_tx: mpsc::UnboundedSender<InboundTrack>,
) {
    let lifecycle_ice = Arc::clone(lifecycle);
    peer_connection.on_ice_connection_state_change(Box::new(
        move |state: RTCIceConnectionState| {
            info!("ICE connection state: {}", state);
            match state {
                RTCIceConnectionState::Connected => {
                    lifecycle_ice.mark_connected();
                }
                RTCIceConnectionState::Failed => {
                    warn!("ICE connection failed, check network/firewall settings");
                    lifecycle_ice.mark_failed();
                }
                _ => {}
            }
            Box::pin(async {})
        },
    ));

    let lifecycle_track = Arc::clone(lifecycle);
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            info!("Track received: {} (ssrc {})", track.kind(), track.ssrc());
            if let Some(kind) = media_kind(track.kind()) {
                lifecycle_track.mark_streaming();
                if tracks_tx.send(InboundTrack { kind, track }).is_err() {
                    debug!("Track dropped, nobody is reading tracks");
                }
            }
            Box::pin(async {})
        },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::net::webrtc::heartbeat::tests::{CountingControl, CountingRequester};
    use std::sync::atomic::Ordering;

    fn streaming_lifecycle(control: Arc<CountingControl>) -> Arc<SessionLifecycle> {
        let lifecycle = Arc::new(SessionLifecycle::new(SignalOfStop::new()));
        lifecycle.transition(SessionState::OfferReady);
        lifecycle.transition(SessionState::AwaitingAnswer);
        lifecycle.start_heartbeats(
            Arc::new(CountingRequester::default()),
            control,
            "handle-1".into(),
            Duration::from_secs(2),
            Duration::from_secs(240),
        );
        lifecycle.mark_connected();
        lifecycle.mark_streaming();
        lifecycle
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let control = Arc::new(CountingControl::default());
        let lifecycle = streaming_lifecycle(control.clone());

        let closes = (0..5).map(|_| {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.close(async {}).await })
        });
        for handle in closes.collect::<Vec<_>>() {
            handle.await.unwrap();
        }
        lifecycle.close(async {}).await;

        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert!(lifecycle.sos.cancelled());
    }

    #[tokio::test]
    async fn test_close_swallows_stop_error() {
        let control = Arc::new(CountingControl {
            fail_stop: true,
            ..Default::default()
        });
        let lifecycle = streaming_lifecycle(control.clone());

        lifecycle.close(async {}).await;
        assert_eq!(lifecycle.state(), SessionState::Closed);
        assert_eq!(control.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extension_failure_keeps_session_streaming() {
        let control = Arc::new(CountingControl {
            fail_extends: 1,
            ..Default::default()
        });
        let lifecycle = streaming_lifecycle(control.clone());

        tokio::time::sleep(Duration::from_secs(4 * 60 + 1)).await;
        assert_eq!(control.extends.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.state(), SessionState::Streaming);

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(control.extends.load(Ordering::SeqCst), 2);
        assert_eq!(lifecycle.state(), SessionState::Streaming);

        lifecycle.close(async {}).await;
        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(control.extends.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connected_fires_once() {
        let lifecycle = SessionLifecycle::new(SignalOfStop::new());
        lifecycle.transition(SessionState::OfferReady);
        lifecycle.transition(SessionState::AwaitingAnswer);

        assert!(lifecycle.mark_connected());
        assert!(!lifecycle.mark_connected());
        lifecycle.mark_streaming();
        assert!(!lifecycle.mark_connected());
        assert_eq!(lifecycle.state(), SessionState::Streaming);
        lifecycle.wait_connected().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_during_answer_is_not_lost() {
        let lifecycle = SessionLifecycle::new(SignalOfStop::new());
        lifecycle.transition(SessionState::OfferReady);

        let mut fired = false;
        lifecycle
            .apply_answer(async {
                fired = lifecycle.mark_connected();
                Ok(())
            })
            .await
            .unwrap();

        assert!(fired);
        assert_eq!(lifecycle.state(), SessionState::Connected);
        lifecycle.wait_connected().await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_cancels_readers_and_waiters() {
        let lifecycle = Arc::new(SessionLifecycle::new(SignalOfStop::new()));
        lifecycle.transition(SessionState::OfferReady);
        lifecycle.transition(SessionState::AwaitingAnswer);

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.wait_connected().await })
        };
        lifecycle.mark_failed();

        assert!(waiter.await.unwrap().is_err());
        assert!(lifecycle.sos.cancelled());
        assert_eq!(lifecycle.state(), SessionState::Failed);

        lifecycle.close(async {}).await;
        assert_eq!(lifecycle.state(), SessionState::Closed);
    }
}
