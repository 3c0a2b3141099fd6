//! FFmpeg profile templates
//!
//! A profile is a named, boot-time-frozen template that turns a channel's
//! inputs (source URL, id, name) into an FFmpeg argument vector. Two YAML
//! shapes are accepted: a bare argv template, or a structured spec whose
//! options map is passed through as `-key value` output arguments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::channel::{HwAccel, OutputFormat};

fn is_false(value: &bool) -> bool {
    !value
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileSpec {
    /// Raw argv template; `{source}`, `{id}` and `{name}` are substituted
    /// per launch. The vector excludes the ffmpeg binary itself.
    Args(Vec<String>),
    Structured(StructuredProfile),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredProfile {
    /// Output options rendered as `-key value` (`null` renders a bare flag)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<OutputFormat>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub audio_only: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ll_hls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwaccel: Option<HwAccel>,
    /// Whether late-joining subscribers receive the ring-buffer snapshot.
    /// Some containers cannot tolerate a mid-stream join.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub bootstrap: bool,
}

impl Default for StructuredProfile {
    fn default() -> Self {
        Self {
            options: BTreeMap::new(),
            output_format: None,
            audio_only: false,
            ll_hls: false,
            hwaccel: None,
            bootstrap: true,
        }
    }
}

impl ProfileSpec {
    /// Shape declared by the profile itself, if any
    pub fn declared_format(&self) -> Option<OutputFormat> {
        match self {
            ProfileSpec::Args(_) => None,
            ProfileSpec::Structured(profile) => {
                if profile.audio_only {
                    Some(OutputFormat::Audio)
                } else {
                    profile.output_format
                }
            }
        }
    }
}
