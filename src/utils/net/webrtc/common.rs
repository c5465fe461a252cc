use anyhow::{Context, Result};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_H264, MIME_TYPE_OPUS, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;

use crate::pipeline::types::MediaKind;

pub(crate) const H264_PAYLOAD_TYPE: u8 = 96;
pub(crate) const OPUS_PAYLOAD_TYPE: u8 = 111;

/// Constrained Baseline, the only profile the cameras answer with.
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

/// Label of the outbound data channel the camera protocol requires.
pub(crate) const DATA_CHANNEL_LABEL: &str = "dataSendChannel";

/// API restricted to H.264 video and Opus audio.
pub(crate) fn create_webrtc_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_H264.to_owned(),
                    clock_rate: 90000,
                    channels: 0,
                    sdp_fmtp_line: H264_FMTP.to_owned(),
                    rtcp_feedback: vec![],
                },
                payload_type: H264_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Video,
        )
        .context("registering H264 codec")?;

    media_engine
        .register_codec(
            RTCRtpCodecParameters {
                capability: RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    sdp_fmtp_line: String::new(),
                    rtcp_feedback: vec![],
                },
                payload_type: OPUS_PAYLOAD_TYPE,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )
        .context("registering Opus codec")?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .context("registering interceptors")?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Receive-only peer connection: audio, then video, then the data channel.
pub(crate) async fn create_peer_connection(
    api: &API,
    stun_servers: &[String],
) -> Result<Arc<RTCPeerConnection>> {
    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }],
        bundle_policy: RTCBundlePolicy::MaxBundle,
        ..Default::default()
    };

    let peer_connection = Arc::new(
        api.new_peer_connection(config)
            .await
            .context("creating peer connection")?,
    );

    if let Err(e) = add_receive_transceivers(&peer_connection).await {
        let _ = peer_connection.close().await;
        return Err(e);
    }

    Ok(peer_connection)
}

async fn add_receive_transceivers(peer_connection: &RTCPeerConnection) -> Result<()> {
    for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
        peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .with_context(|| format!("adding {} transceiver", kind))?;
    }

    peer_connection
        .create_data_channel(DATA_CHANNEL_LABEL, None)
        .await
        .context("creating data channel")?;

    Ok(())
}

pub(crate) fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Video => Some(MediaKind::Video),
        RTPCodecType::Audio => Some(MediaKind::Audio),
        _ => None,
    }
}
