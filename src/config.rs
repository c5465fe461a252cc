use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SDM_BASE_URL: &str = "https://smartdevicemanagement.googleapis.com/v1";
pub const PUBSUB_BASE_URL: &str = "https://pubsub.googleapis.com/v1";
pub const TOKEN_ENV: &str = "NESTCAST_ACCESS_TOKEN";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub project_id: String,
    pub device_id: Option<String>,
    pub access_token: String,
    pub pubsub_subscription: Option<String>,
    pub api_base_url: String,
    pub pubsub_base_url: String,
    pub webrtc: WebRtcConfig,
    pub capture: CaptureConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub keyframe_interval_secs: u64,
    pub extend_interval_secs: u64,
    /// Reorder window, in packets.
    pub reorder_window: usize,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CaptureConfig {
    pub output_dir: PathBuf,
    pub snapshot: bool,
    pub clip: bool,
    pub clip_secs: u64,
    pub dedup_window_secs: u64,
    pub close_grace_ms: u64,
    pub track_timeout_secs: u64,
    pub ffmpeg: String,
    pub ffplay: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            device_id: None,
            access_token: String::new(),
            pubsub_subscription: None,
            api_base_url: SDM_BASE_URL.to_string(),
            pubsub_base_url: PUBSUB_BASE_URL.to_string(),
            webrtc: WebRtcConfig::default(),
            capture: CaptureConfig::default(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            keyframe_interval_secs: 2,
            extend_interval_secs: 4 * 60,
            reorder_window: 128,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("events"),
            snapshot: true,
            clip: false,
            clip_secs: 10,
            dedup_window_secs: 60,
            close_grace_ms: 500,
            track_timeout_secs: 15,
            ffmpeg: "ffmpeg".to_string(),
            ffplay: "ffplay".to_string(),
        }
    }
}

impl WebRtcConfig {
    pub fn keyframe_interval(&self) -> Duration {
        Duration::from_secs(self.keyframe_interval_secs.max(1))
    }

    pub fn extend_interval(&self) -> Duration {
        Duration::from_secs(self.extend_interval_secs.max(1))
    }
}

impl CaptureConfig {
    pub fn clip_duration(&self) -> Duration {
        Duration::from_secs(self.clip_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn track_timeout(&self) -> Duration {
        Duration::from_secs(self.track_timeout_secs)
    }
}

impl Config {
    /// Parse a config file. A missing file yields the defaults; the access
    /// token environment variable always wins over the file.
    pub fn load(path: &Path) -> Result<Config> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<Config>(&text)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Config::default()
            }
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };

        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            config.access_token = token;
        }

        Ok(config)
    }

    /// Checks the fields every device call needs.
    pub fn validate(&self) -> Result<()> {
        if self.project_id.is_empty() {
            bail!("project_id not configured (set it in the config file)");
        }
        if self.access_token.is_empty() {
            bail!("access token not configured (set access_token or {})", TOKEN_ENV);
        }
        Ok(())
    }

    /// Expands a short device id into a full resource name.
    pub fn device_resource(&self, device_id: &str) -> String {
        if device_id.starts_with("enterprises/") {
            device_id.to_string()
        } else {
            format!("enterprises/{}/devices/{}", self.project_id, device_id)
        }
    }
}

/// Returns a version as specified in Cargo.toml
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            project_id = "p-123"
            access_token = "tok"

            [capture]
            clip = true
            clip_secs = 20
            "#,
        )
        .unwrap();

        assert_eq!(config.project_id, "p-123");
        assert!(config.capture.clip);
        assert_eq!(config.capture.clip_duration(), Duration::from_secs(20));
        assert!(config.capture.snapshot);
        assert_eq!(config.capture.dedup_window(), Duration::from_secs(60));
        assert_eq!(config.webrtc.extend_interval(), Duration::from_secs(240));
        assert_eq!(config.webrtc.keyframe_interval(), Duration::from_secs(2));
        assert_eq!(config.api_base_url, SDM_BASE_URL);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_project_and_token() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.project_id = "p".into();
        assert!(config.validate().is_err());
        config.access_token = "t".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.capture.output_dir, PathBuf::from("events"));
    }

    #[test]
    fn test_device_resource() {
        let config = Config {
            project_id: "proj".into(),
            ..Default::default()
        };
        assert_eq!(config.device_resource("cam1"), "enterprises/proj/devices/cam1");
        assert_eq!(
            config.device_resource("enterprises/x/devices/cam2"),
            "enterprises/x/devices/cam2"
        );
    }
}
