//! Boot-time configuration
//!
//! The whole channel + profile catalog is parsed from a single YAML file
//! at startup and validated eagerly; validation failures abort the boot.
//! Unknown top-level keys are ignored, unknown per-channel keys log a
//! warning and are preserved opaquely for metadata pass-through.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod defaults;

use crate::models::{
    channel::{is_valid_variant_name, Channel},
    ProfileSpec, ScheduledChannel,
};
use defaults::*;

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "AMPS_CONFIG";
/// Environment variable overriding the server token
pub const TOKEN_ENV: &str = "AMPS_TOKEN";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ffmpeg_profiles: BTreeMap<String, ProfileSpec>,
    #[serde(default)]
    pub streams: Vec<Channel>,
    #[serde(default)]
    pub scheduled_streams: Vec<ScheduledChannel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub debug: bool,
    /// Shared bearer token; `None` disables authentication entirely
    #[serde(default)]
    pub token: Option<String>,
    /// Worker threads for the runtime; `None` lets tokio decide
    #[serde(default)]
    pub workers: Option<usize>,
    /// Root for per-stream temp directories; defaults to the OS temp dir
    #[serde(default)]
    pub media_root: Option<PathBuf>,
    #[serde(default = "default_ffmpeg_command")]
    pub ffmpeg_command: String,
    #[serde(default = "default_yt_dlp_command")]
    pub yt_dlp_command: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            token: None,
            workers: None,
            media_root: None,
            ffmpeg_command: default_ffmpeg_command(),
            yt_dlp_command: default_yt_dlp_command(),
        }
    }
}

impl ServerConfig {
    pub fn auth_enabled(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn media_root(&self) -> PathBuf {
        self.media_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("amps_media"))
    }
}

/// Resolve the config path: CLI flag, then `AMPS_CONFIG`, then `config.yaml`
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    if let Some(path) = cli_path {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(default_config_file())
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        let mut config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML in {}", path.display()))?;

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                config.server.token = Some(token);
            }
        }

        config.validate()?;
        info!(
            "Loaded {} streams and {} FFmpeg profiles from {}",
            config.streams.len(),
            config.ffmpeg_profiles.len(),
            path.display()
        );
        if !config.scheduled_streams.is_empty() {
            info!(
                "{} scheduled stream(s) configured",
                config.scheduled_streams.len()
            );
        }
        Ok(config)
    }

    /// Validate the whole catalog; any failure is fatal at boot
    pub fn validate(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for channel in &self.streams {
            if !seen.insert(channel.id) {
                anyhow::bail!("duplicate stream id {} in configuration", channel.id);
            }
        }

        let profiles = self.ffmpeg_profiles.clone();
        for channel in &mut self.streams {
            validate_channel(channel, &profiles)
                .with_context(|| format!("stream {} is invalid", channel.id))?;
        }

        for scheduled in &mut self.scheduled_streams {
            validate_channel(&mut scheduled.channel, &profiles).with_context(|| {
                format!("scheduled stream {} is invalid", scheduled.channel.id)
            })?;
            if let (Some(start), Some(end)) = (scheduled.schedule.start, scheduled.schedule.end) {
                if end <= start {
                    anyhow::bail!(
                        "scheduled stream {} has end <= start",
                        scheduled.channel.id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Per-channel validation shared between boot and the CRUD API
pub fn validate_channel(
    channel: &mut Channel,
    profiles: &BTreeMap<String, ProfileSpec>,
) -> Result<()> {
    if channel.name.trim().is_empty() {
        anyhow::bail!("channel name must not be empty");
    }

    if channel.custom_ffmpeg.is_none() {
        let profile = channel
            .ffmpeg_profile
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("provide either ffmpeg_profile or custom_ffmpeg"))?;
        if !profiles.contains_key(profile) {
            anyhow::bail!("ffmpeg_profile '{profile}' not found");
        }
        if channel.source.as_deref().map_or(true, |s| s.is_empty()) {
            anyhow::bail!("channel is missing a source URL");
        }
    }

    let mut names = HashSet::new();
    for variant in &channel.variants {
        if !is_valid_variant_name(&variant.name) {
            anyhow::bail!(
                "variant name '{}' must be lowercase and URL-safe",
                variant.name
            );
        }
        if variant.name == crate::models::channel::DEFAULT_VARIANT {
            anyhow::bail!("'default' is reserved for the base channel");
        }
        if !names.insert(variant.name.clone()) {
            anyhow::bail!("duplicate variant name '{}'", variant.name);
        }
        if let Some(profile) = variant.ffmpeg_profile.as_deref() {
            if !profiles.contains_key(profile) {
                anyhow::bail!(
                    "variant '{}' references unknown profile '{profile}'",
                    variant.name
                );
            }
        }
    }

    channel.normalize_regions();

    if !channel.extra.is_empty() {
        let keys: Vec<&str> = channel.extra.keys().map(String::as_str).collect();
        warn!(
            "channel {} carries unknown keys {:?}; preserving them as opaque metadata",
            channel.id, keys
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  host: 127.0.0.1
  port: 8181
  token: sekrit
ffmpeg_profiles:
  copy:
    options:
      vcodec: copy
      acodec: copy
      format: mpegts
  low:
    - "-i"
    - "{source}"
    - "-c"
    - "copy"
    - "-f"
    - "mpegts"
    - "pipe:1"
streams:
  - id: 1
    name: First
    source: http://upstream/one.ts
    ffmpeg_profile: copy
  - id: 2
    name: Second
    source: http://upstream/two.ts
    ffmpeg_profile: low
    group: Sports
scheduled_streams:
  - id: 900
    name: Popup
    source: http://upstream/popup.ts
    ffmpeg_profile: copy
    schedule:
      start: 2030-01-01T00:00:00Z
      end: 2030-01-02T00:00:00Z
"#;

    #[test]
    fn sample_config_parses_and_validates() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8181);
        assert!(config.server.auth_enabled());
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.scheduled_streams.len(), 1);
        assert_eq!(config.streams[0].name, "First");
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let mut dup = config.streams[0].clone();
        dup.name = "Clone".into();
        config.streams.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_profile_reference_is_fatal() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        config.streams[0].ffmpeg_profile = Some("nope".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_schedule_is_fatal() {
        let mut config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let sched = &mut config.scheduled_streams[0].schedule;
        std::mem::swap(&mut sched.start, &mut sched.end);
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load_from_file(&path).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(AppConfig::load_from_file(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let config: Result<AppConfig, _> =
            serde_yaml::from_str("server:\n  port: 1234\nfuture_feature: true\n");
        assert!(config.is_ok());
    }
}
