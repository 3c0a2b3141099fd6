//! Service layer composing the registry and the transcoder manager

pub mod channels;

pub use channels::ChannelService;
