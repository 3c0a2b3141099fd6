//! Channel business service
//!
//! Thin composition of the channel registry and the transcoder manager so
//! that registry mutations cascade into the stream lifecycle engine:
//! deleting a channel terminates every live transcoder whose key belongs
//! to it, and replacing a channel whose launch spec changed stops its
//! stale children so the next client picks up the new configuration.

use std::sync::Arc;

use tracing::{info, warn};

use crate::errors::{AmpsError, AmpsResult};
use crate::models::{Channel, Program};
use crate::registry::ChannelRegistry;
use crate::relay::TranscoderManager;

pub struct ChannelService {
    registry: Arc<ChannelRegistry>,
    manager: Arc<TranscoderManager>,
}

impl ChannelService {
    pub fn new(registry: Arc<ChannelRegistry>, manager: Arc<TranscoderManager>) -> Arc<Self> {
        Arc::new(Self { registry, manager })
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<TranscoderManager> {
        &self.manager
    }

    fn validate(&self, channel: &mut Channel) -> AmpsResult<()> {
        crate::config::validate_channel(channel, self.manager.profiles())
            .map_err(|e| AmpsError::bad_request(e.to_string()))
    }

    pub async fn add(&self, mut channel: Channel) -> AmpsResult<Channel> {
        self.validate(&mut channel)?;
        self.registry.add(channel.clone()).await?;
        info!(id = channel.id, name = %channel.name, "added stream");
        Ok(channel)
    }

    pub async fn replace(&self, id: u32, mut channel: Channel) -> AmpsResult<Channel> {
        self.validate(&mut channel)?;
        let previous = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| AmpsError::not_found("stream", id))?;

        let launch_changed = previous.source != channel.source
            || previous.ffmpeg_profile != channel.ffmpeg_profile
            || previous.custom_ffmpeg != channel.custom_ffmpeg;

        self.registry.replace(id, channel.clone()).await?;

        if launch_changed {
            let stopped = self.manager.kill_channel(id).await;
            if stopped > 0 {
                info!(
                    id,
                    stopped, "stream launch spec changed; stopped live transcoders"
                );
            }
        }
        Ok(channel)
    }

    /// Delete the channel and terminate every transcoder record whose
    /// key's channel matches.
    pub async fn delete(&self, id: u32) -> AmpsResult<Channel> {
        let removed = self.registry.delete(id).await?;
        let stopped = self.manager.kill_channel(id).await;
        info!(id, stopped, "deleted stream");
        Ok(removed)
    }

    pub async fn get_programs(&self, id: u32) -> AmpsResult<Vec<Program>> {
        self.registry.get_programs(id).await
    }

    pub async fn replace_programs(
        &self,
        id: u32,
        programs: Vec<Program>,
    ) -> AmpsResult<Vec<Program>> {
        for (index, program) in programs.iter().enumerate() {
            if program.title.trim().is_empty() {
                return Err(AmpsError::bad_request(format!(
                    "program entry at index {index} is missing a title"
                )));
            }
        }
        self.registry.replace_programs(id, programs).await
    }

    /// Activation path for the scheduler: an id clash with an existing
    /// (static) channel is logged and skipped, never fatal.
    pub async fn activate_scheduled(&self, channel: Channel) -> bool {
        let id = channel.id;
        match self.registry.add(channel).await {
            Ok(()) => {
                info!(id, "activated scheduled stream");
                true
            }
            Err(AmpsError::Conflict { .. }) => {
                warn!(
                    id,
                    "scheduled stream id collides with an existing channel; skipping"
                );
                false
            }
            Err(e) => {
                warn!(id, "failed to activate scheduled stream: {e}");
                false
            }
        }
    }

    /// Retirement path for the scheduler; missing channels are fine (an
    /// operator may have deleted the entry early through the API).
    pub async fn retire_scheduled(&self, id: u32) {
        match self.delete(id).await {
            Ok(_) => info!(id, "retired scheduled stream"),
            Err(AmpsError::NotFound { .. }) => {}
            Err(e) => warn!(id, "failed to retire scheduled stream: {e}"),
        }
    }
}
