//! Channel registry
//!
//! The in-memory mapping from channel id to channel record; source of
//! truth for CRUD and playlist rendering. A single read/write lock keeps
//! mutations linearizable (writers are rare); `snapshot` hands out a
//! consistent, id-sorted copy.

use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::errors::{AmpsError, AmpsResult};
use crate::models::{Channel, Program};

pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<u32, Channel>>,
}

impl ChannelRegistry {
    pub fn new(initial: Vec<Channel>) -> Self {
        let channels = initial.into_iter().map(|c| (c.id, c)).collect();
        Self {
            channels: RwLock::new(channels),
        }
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    pub async fn contains(&self, id: u32) -> bool {
        self.channels.read().await.contains_key(&id)
    }

    pub async fn get(&self, id: u32) -> Option<Channel> {
        self.channels.read().await.get(&id).cloned()
    }

    /// Consistent point-in-time copy, sorted by id
    pub async fn snapshot(&self) -> Vec<Channel> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn list(&self) -> Vec<Channel> {
        self.snapshot().await
    }

    pub async fn add(&self, channel: Channel) -> AmpsResult<()> {
        let mut channels = self.channels.write().await;
        if channels.contains_key(&channel.id) {
            return Err(AmpsError::conflict(format!(
                "stream id {} already exists",
                channel.id
            )));
        }
        channels.insert(channel.id, channel);
        Ok(())
    }

    /// Replace the full channel body; the body's id must match `id`
    pub async fn replace(&self, id: u32, channel: Channel) -> AmpsResult<()> {
        if channel.id != id {
            return Err(AmpsError::bad_request(format!(
                "body id {} does not match url id {id}",
                channel.id
            )));
        }
        let mut channels = self.channels.write().await;
        if !channels.contains_key(&id) {
            return Err(AmpsError::not_found("stream", id));
        }
        channels.insert(id, channel);
        Ok(())
    }

    pub async fn delete(&self, id: u32) -> AmpsResult<Channel> {
        self.channels
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| AmpsError::not_found("stream", id))
    }

    pub async fn get_programs(&self, id: u32) -> AmpsResult<Vec<Program>> {
        self.channels
            .read()
            .await
            .get(&id)
            .map(|c| c.next_programs.clone())
            .ok_or_else(|| AmpsError::not_found("stream", id))
    }

    /// Replace the whole upcoming-programme list, preserving order
    pub async fn replace_programs(
        &self,
        id: u32,
        programs: Vec<Program>,
    ) -> AmpsResult<Vec<Program>> {
        let mut channels = self.channels.write().await;
        let channel = channels
            .get_mut(&id)
            .ok_or_else(|| AmpsError::not_found("stream", id))?;
        channel.next_programs = programs;
        Ok(channel.next_programs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: u32, name: &str) -> Channel {
        serde_yaml::from_str(&format!(
            "id: {id}\nname: {name}\nsource: http://x/{id}\nffmpeg_profile: copy\n"
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let registry = ChannelRegistry::new(vec![channel(1, "one")]);
        match registry.add(channel(1, "again")).await {
            Err(AmpsError::Conflict { .. }) => {}
            other => panic!("expected conflict, got {other:?}"),
        }
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn replace_requires_matching_ids() {
        let registry = ChannelRegistry::new(vec![channel(1, "one")]);
        match registry.replace(1, channel(2, "two")).await {
            Err(AmpsError::BadRequest { .. }) => {}
            other => panic!("expected bad request, got {other:?}"),
        }
        match registry.replace(9, channel(9, "nine")).await {
            Err(AmpsError::NotFound { .. }) => {}
            other => panic!("expected not found, got {other:?}"),
        }
        registry.replace(1, channel(1, "renamed")).await.unwrap();
        assert_eq!(registry.get(1).await.unwrap().name, "renamed");
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_id() {
        let registry = ChannelRegistry::new(vec![channel(5, "e"), channel(2, "b"), channel(9, "i")]);
        let ids: Vec<u32> = registry.snapshot().await.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[tokio::test]
    async fn programs_round_trip_preserves_order() {
        let registry = ChannelRegistry::new(vec![channel(1, "one")]);
        let programs: Vec<Program> = serde_json::from_value(serde_json::json!([
            {"title": "B show"},
            {"title": "A show", "description": "second in order"}
        ]))
        .unwrap();
        registry.replace_programs(1, programs.clone()).await.unwrap();
        assert_eq!(registry.get_programs(1).await.unwrap(), programs);
        assert!(registry.get_programs(404).await.is_err());
    }
}
