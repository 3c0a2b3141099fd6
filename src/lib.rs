//! Amps - Advanced Media Playlist Server
//!
//! A long-lived media relay: publishes a playlist of logical channels,
//! launches and reuses FFmpeg subprocesses to produce continuous byte
//! streams from upstream sources, and exposes those streams to HTTP
//! clients, optionally wrapped in HLS/DASH segment directories or
//! stripped to audio.

pub mod config;
pub mod errors;
pub mod models;
pub mod playlist;
pub mod registry;
pub mod relay;
pub mod scheduler;
pub mod services;
pub mod web;

pub use errors::{AmpsError, AmpsResult};
