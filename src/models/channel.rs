//! Channel model
//!
//! A channel is a logical broadcast unit identified by a non-negative
//! integer id. Channels come from the YAML configuration or the CRUD API
//! and live purely in memory. Unknown keys are preserved opaquely so that
//! user metadata round-trips through the API untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn is_false(value: &bool) -> bool {
    !value
}

/// One upcoming programme on a channel's schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Output container shape produced by a transcoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    Ts,
    Hls,
    LlHls,
    Dash,
    Rtsp,
    Audio,
}

impl OutputFormat {
    /// Segmented shapes write manifests + segments into a per-key
    /// directory instead of piping bytes over stdout.
    pub fn is_segmented(self) -> bool {
        matches!(self, OutputFormat::Hls | OutputFormat::LlHls | OutputFormat::Dash)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutputFormat::Ts => "ts",
            OutputFormat::Hls => "hls",
            OutputFormat::LlHls => "ll-hls",
            OutputFormat::Dash => "dash",
            OutputFormat::Rtsp => "rtsp",
            OutputFormat::Audio => "audio",
        };
        f.write_str(s)
    }
}

/// Hardware acceleration request passed through to FFmpeg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HwAccel {
    #[serde(rename = "type")]
    pub kind: HwAccelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HwAccelKind {
    Nvidia,
    Vaapi,
    Videotoolbox,
}

impl HwAccelKind {
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            HwAccelKind::Nvidia => "cuda",
            HwAccelKind::Vaapi => "vaapi",
            HwAccelKind::Videotoolbox => "videotoolbox",
        }
    }
}

/// Pre-flight source resolution handler
///
/// Currently the only member is `yt_dlp`; the tag is explicit so new
/// handler kinds stay additive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceHandler {
    YtDlp {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        options: BTreeMap<String, serde_json::Value>,
    },
}

/// Inline FFmpeg command override
///
/// Shorthand string for simple commands, or a mapping carrying the shell
/// flag, working directory and environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomCommand {
    Line(String),
    Full(CustomCommandSpec),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomCommandSpec {
    pub command: CommandTemplate,
    #[serde(default, skip_serializing_if = "is_false")]
    pub shell: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandTemplate {
    Line(String),
    Argv(Vec<String>),
}

/// Alternate rendition of a channel sharing the same id
///
/// Every field other than `name` overrides the corresponding channel
/// field when the variant is requested; `None` inherits from the base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ffmpeg: Option<CustomCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handler: Option<SourceHandler>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_options: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwaccel: Option<HwAccel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ll_hls: Option<bool>,
}

/// The reserved name of the implicit default variant
pub const DEFAULT_VARIANT: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ffmpeg_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ffmpeg: Option<CustomCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tvg_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_feed: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_programs: Vec<Program>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions_allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub regions_blocked: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handler: Option<SourceHandler>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub use_yt_dlp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub yt_dlp_format: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_options: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwaccel: Option<HwAccel>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub audio_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ll_hls: bool,
    /// Unknown keys survive parsing and re-serialization untouched
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Channel {
    /// The shape this channel produces when nothing forces audio
    pub fn declared_format(&self) -> OutputFormat {
        if self.audio_only {
            return OutputFormat::Audio;
        }
        self.output_format.unwrap_or(OutputFormat::Ts)
    }

    pub fn variant(&self, name: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.name == name)
    }

    /// Normalised source handler, folding the legacy `use_yt_dlp` +
    /// `yt_dlp_format` pair into the explicit form.
    pub fn effective_source_handler(&self) -> Option<SourceHandler> {
        if let Some(handler) = &self.source_handler {
            return Some(handler.clone());
        }
        if self.use_yt_dlp {
            return Some(SourceHandler::YtDlp {
                format: self.yt_dlp_format.clone(),
                options: BTreeMap::new(),
            });
        }
        None
    }

    /// Produce the effective channel for a named variant.
    ///
    /// `default` (or an empty name) returns the base channel unchanged.
    /// Returns `None` when the variant is unknown; callers turn that into
    /// a `BadVariant` rejection.
    pub fn resolve_variant(&self, name: &str) -> Option<Channel> {
        if name.is_empty() || name == DEFAULT_VARIANT {
            return Some(self.clone());
        }
        let variant = self.variant(name)?;
        let mut resolved = self.clone();
        if let Some(profile) = &variant.ffmpeg_profile {
            resolved.ffmpeg_profile = Some(profile.clone());
            // A variant that names a profile opts out of the base channel's
            // inline command unless it carries its own.
            resolved.custom_ffmpeg = variant.custom_ffmpeg.clone();
        }
        if let Some(custom) = &variant.custom_ffmpeg {
            resolved.custom_ffmpeg = Some(custom.clone());
        }
        if let Some(source) = &variant.source {
            resolved.source = Some(source.clone());
        }
        if let Some(handler) = &variant.source_handler {
            resolved.source_handler = Some(handler.clone());
        }
        if !variant.input_options.is_empty() {
            resolved.input_options.extend(variant.input_options.clone());
        }
        if !variant.input_args.is_empty() {
            resolved.input_args = variant.input_args.clone();
        }
        if let Some(format) = variant.output_format {
            resolved.output_format = Some(format);
        }
        if let Some(hwaccel) = &variant.hwaccel {
            resolved.hwaccel = Some(hwaccel.clone());
        }
        if let Some(audio_only) = variant.audio_only {
            resolved.audio_only = audio_only;
        }
        if let Some(ll_hls) = variant.ll_hls {
            resolved.ll_hls = ll_hls;
        }
        Some(resolved)
    }

    /// Uppercase both region lists in place (codes compare case-insensitively)
    pub fn normalize_regions(&mut self) {
        for code in self
            .regions_allowed
            .iter_mut()
            .chain(self.regions_blocked.iter_mut())
        {
            *code = code.trim().to_ascii_uppercase();
        }
        self.regions_allowed.retain(|c| is_region_code(c));
        self.regions_blocked.retain(|c| is_region_code(c));
    }

    /// Whether a client in `region` may view this channel.
    ///
    /// The block list is evaluated first, then the allow list; a non-empty
    /// allow list rejects clients with no resolvable region at all.
    pub fn allowed_for_region(&self, region: Option<&str>) -> bool {
        let region = region.map(|r| r.to_ascii_uppercase());
        if let Some(region) = &region {
            if self.regions_blocked.iter().any(|c| c == region) {
                return false;
            }
        }
        if !self.regions_allowed.is_empty() {
            match &region {
                Some(region) => return self.regions_allowed.iter().any(|c| c == region),
                None => return false,
            }
        }
        true
    }
}

/// ISO 3166-1 alpha-2 sanity check (two ASCII letters)
pub fn is_region_code(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Variant names are lowercase and URL-safe
pub fn is_valid_variant_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'_' | b'.'))
}

/// Activation window for a scheduled channel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Eligible now: start has passed (or is missing) and end has not
    pub fn active_at(&self, now: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| s <= now) && self.end.map_or(true, |e| e > now)
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end.is_some_and(|e| e <= now)
    }
}

/// A channel that exists only inside its `[start, end)` window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledChannel {
    #[serde(flatten)]
    pub channel: Channel,
    #[serde(default)]
    pub schedule: Schedule,
}
