use crate::config::app_name;
use std::env::var_os;
use std::path::{Path, PathBuf};

fn home_path() -> Option<String> {
    #[cfg(not(target_os = "windows"))]
    let home = var_os("HOME").map(|home| home.to_string_lossy().to_string());

    #[cfg(target_os = "windows")]
    let home = var_os("HOMEDRIVE").and_then(|drive| {
        var_os("HOMEPATH")
            .map(|home| format!("{}{}", drive.to_string_lossy(), home.to_string_lossy()))
    });

    home
}

/// `$XDG_CONFIG_HOME/<app>/config.toml`, falling back to `~/.config/<app>/config.toml`.
pub fn default_config_path() -> PathBuf {
    let base = match var_os("XDG_CONFIG_HOME") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => match home_path() {
            Some(home) => Path::new(&home).join(".config"),
            None => PathBuf::from("."),
        },
    };
    base.join(app_name()).join("config.toml")
}

/// Scratch file the raw elementary stream is written to before transcoding.
pub fn raw_temp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".tmp.h264");
    PathBuf::from(name)
}

/// Where an untranscoded stream is kept when the transcoder fails.
pub fn fallback_raw_path(output: &Path) -> PathBuf {
    output.with_extension("h264")
}

/// Lower-cased extension of `path`, empty when it has none.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Last segment of a `enterprises/<p>/devices/<id>` resource name.
pub fn short_device_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_and_fallback_paths() {
        let out = Path::new("events/clip_001.mp4");
        assert_eq!(raw_temp_path(out), PathBuf::from("events/clip_001.mp4.tmp.h264"));
        assert_eq!(fallback_raw_path(out), PathBuf::from("events/clip_001.h264"));
        assert_eq!(extension_of(Path::new("a/B.JPG")), "jpg");
        assert_eq!(extension_of(Path::new("noext")), "");
    }

    #[test]
    fn test_short_device_name() {
        assert_eq!(short_device_name("enterprises/p1/devices/AVPH"), "AVPH");
        assert_eq!(short_device_name("AVPH"), "AVPH");
    }
}
