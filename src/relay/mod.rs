//! Stream lifecycle engine
//!
//! Maps a stream key (channel id + variant + output shape) to at most one
//! running FFmpeg child, multiplexes byte delivery to any number of HTTP
//! clients, and handles crashes, restarts and idle reaping.

pub mod command;
pub mod manager;
pub mod resolver;
pub mod ring_buffer;

pub use command::LaunchPlan;
pub use manager::{LiveStream, RelaySettings, Subscription, TranscoderManager};
pub use resolver::{ResolvedSource, SourceResolver};

use serde::Serialize;

use crate::models::OutputFormat;

/// Output shape component of a stream key
///
/// `Overlap` keys are private, non-shared instances carrying a unique
/// sequence number; they never match a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputShape {
    Ts,
    Hls,
    LlHls,
    Dash,
    Rtsp,
    Audio,
    Overlap(u64),
}

impl OutputShape {
    pub fn from_format(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Ts => OutputShape::Ts,
            OutputFormat::Hls => OutputShape::Hls,
            OutputFormat::LlHls => OutputShape::LlHls,
            OutputFormat::Dash => OutputShape::Dash,
            OutputFormat::Rtsp => OutputShape::Rtsp,
            OutputFormat::Audio => OutputShape::Audio,
        }
    }

    pub fn is_overlap(self) -> bool {
        matches!(self, OutputShape::Overlap(_))
    }

    pub fn is_segmented(self) -> bool {
        matches!(self, OutputShape::Hls | OutputShape::LlHls | OutputShape::Dash)
    }
}

impl std::fmt::Display for OutputShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputShape::Ts => f.write_str("ts"),
            OutputShape::Hls => f.write_str("hls"),
            OutputShape::LlHls => f.write_str("ll-hls"),
            OutputShape::Dash => f.write_str("dash"),
            OutputShape::Rtsp => f.write_str("rtsp"),
            OutputShape::Audio => f.write_str("audio"),
            OutputShape::Overlap(n) => write!(f, "overlap#{n}"),
        }
    }
}

/// The unit of sharing in the transcoder manager
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub channel_id: u32,
    pub variant: String,
    pub shape: OutputShape,
}

impl StreamKey {
    pub fn new(channel_id: u32, variant: impl Into<String>, shape: OutputShape) -> Self {
        Self {
            channel_id,
            variant: variant.into(),
            shape,
        }
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.channel_id, self.variant, self.shape)
    }
}

impl Serialize for StreamKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
