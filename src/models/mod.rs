//! Core data model for channels, variants, profiles and schedules

pub mod channel;
pub mod profile;

pub use channel::{
    Channel, CommandTemplate, CustomCommand, CustomCommandSpec, HwAccel, HwAccelKind,
    OutputFormat, Program, Schedule, ScheduledChannel, SourceHandler, Variant, DEFAULT_VARIANT,
};
pub use profile::{ProfileSpec, StructuredProfile};
