//! Smart Device Management REST client

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::debug;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use crate::utils::net::webrtc::StreamControl;

const GENERATE_STREAM: &str = "sdm.devices.commands.CameraLiveStream.GenerateWebRtcStream";
const EXTEND_STREAM: &str = "sdm.devices.commands.CameraLiveStream.ExtendWebRtcStream";
const STOP_STREAM: &str = "sdm.devices.commands.CameraLiveStream.StopWebRtcStream";
const GENERATE_IMAGE: &str = "sdm.devices.commands.CameraEventImage.GenerateImage";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A device as listed by the API
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(rename = "type", default)]
    pub device_type: String,
    #[serde(default)]
    pub traits: HashMap<String, Value>,
    #[serde(rename = "parentRelations", default)]
    pub parent_relations: Vec<ParentRelation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParentRelation {
    pub parent: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
}

impl Device {
    pub fn is_camera(&self) -> bool {
        self.device_type.contains("CAMERA")
    }

    /// Custom name if set, else the room it is assigned to.
    pub fn display_name(&self) -> &str {
        self.traits
            .get("sdm.devices.traits.Info")
            .and_then(|info| info.get("customName"))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .or_else(|| {
                self.parent_relations
                    .first()
                    .map(|p| p.display_name.as_str())
            })
            .unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    results: Value,
}

/// Answer to a stream generation request
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedStream {
    #[serde(rename = "answerSdp")]
    pub answer_sdp: String,
    #[serde(rename = "mediaSessionId")]
    pub media_session_id: String,
}

/// Where and how to fetch an event image
#[derive(Debug, Clone, Deserialize)]
pub struct EventImage {
    pub url: String,
    pub token: String,
}

/// Device command calls the capture core depends on
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn generate_stream(&self, device: &str, offer_sdp: &str) -> Result<GeneratedStream, ApiError>;

    async fn extend_stream(&self, device: &str, session_handle: &str) -> Result<(), ApiError>;

    async fn stop_stream(&self, device: &str, session_handle: &str) -> Result<(), ApiError>;

    async fn fetch_event_image(&self, device: &str, event_id: &str) -> Result<EventImage, ApiError>;

    async fn download_image(&self, image: &EventImage, dest: &Path) -> Result<(), ApiError>;
}

pub struct SdmClient {
    client: Client,
    base_url: String,
    project_id: String,
    token: String,
}

impl SdmClient {
    pub fn new(base_url: &str, project_id: &str, token: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            token: token.to_string(),
        }
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Status { status, body })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let body = Self::check(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>, ApiError> {
        let list: DeviceList = self
            .get(&format!("enterprises/{}/devices", self.project_id))
            .await?;
        Ok(list.devices)
    }

    pub async fn get_device(&self, name: &str) -> Result<Device, ApiError> {
        self.get(name).await
    }

    /// Runs `command` on `device` and returns its `results` object.
    pub async fn execute_command(&self, device: &str, command: &str, params: Value) -> Result<Value, ApiError> {
        debug!("Executing {} on {}", command, device);
        let response = self
            .client
            .post(format!("{}/{}:executeCommand", self.base_url, device))
            .bearer_auth(&self.token)
            .json(&json!({ "command": command, "params": params }))
            .send()
            .await?;
        let body = Self::check(response).await?.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        let parsed: CommandResponse = serde_json::from_slice(&body)?;
        Ok(parsed.results)
    }
}

#[async_trait]
impl DeviceApi for SdmClient {
    async fn generate_stream(&self, device: &str, offer_sdp: &str) -> Result<GeneratedStream, ApiError> {
        let results = self
            .execute_command(device, GENERATE_STREAM, json!({ "offerSdp": offer_sdp }))
            .await?;
        Ok(serde_json::from_value(results)?)
    }

    async fn extend_stream(&self, device: &str, session_handle: &str) -> Result<(), ApiError> {
        self.execute_command(device, EXTEND_STREAM, json!({ "mediaSessionId": session_handle }))
            .await
            .map(|_| ())
    }

    async fn stop_stream(&self, device: &str, session_handle: &str) -> Result<(), ApiError> {
        self.execute_command(device, STOP_STREAM, json!({ "mediaSessionId": session_handle }))
            .await
            .map(|_| ())
    }

    async fn fetch_event_image(&self, device: &str, event_id: &str) -> Result<EventImage, ApiError> {
        let results = self
            .execute_command(device, GENERATE_IMAGE, json!({ "eventId": event_id }))
            .await?;
        Ok(serde_json::from_value(results)?)
    }

    async fn download_image(&self, image: &EventImage, dest: &Path) -> Result<(), ApiError> {
        let response = self
            .client
            .get(&image.url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", image.token))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let io_err = |source| ApiError::Io {
            path: dest.display().to_string(),
            source,
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            file.write_all(&chunk?).await.map_err(io_err)?;
        }
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

/// Stream controls bound to one device
pub struct DeviceStreamControl {
    api: Arc<dyn DeviceApi>,
    device: String,
}

impl DeviceStreamControl {
    pub fn new(api: Arc<dyn DeviceApi>, device: &str) -> Self {
        Self {
            api,
            device: device.to_string(),
        }
    }
}

#[async_trait]
impl StreamControl for DeviceStreamControl {
    async fn extend(&self, session_handle: &str) -> Result<()> {
        Ok(self.api.extend_stream(&self.device, session_handle).await?)
    }

    async fn stop(&self, session_handle: &str) -> Result<()> {
        Ok(self.api.stop_stream(&self.device, session_handle).await?)
    }
}

/// Picks the device to talk to: an explicit id, then the configured
/// default, then the first camera the project has.
pub async fn resolve_device(
    client: &SdmClient,
    explicit: Option<&str>,
    configured: Option<&str>,
    expand: impl Fn(&str) -> String,
) -> anyhow::Result<String> {
    if let Some(id) = explicit.or(configured).filter(|id| !id.is_empty()) {
        return Ok(expand(id));
    }

    let devices = client.list_devices().await?;
    devices
        .into_iter()
        .find(Device::is_camera)
        .map(|d| d.name)
        .ok_or_else(|| anyhow::anyhow!("no camera devices found in project"))
}
