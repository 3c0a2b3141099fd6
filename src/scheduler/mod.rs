//! Time-driven activation of scheduled channels
//!
//! Holds every scheduled entry and walks wall-clock boundaries on a 1 s
//! monotonic tick: a fired `start` clones the entry into the registry, a
//! fired `end` deletes it (which cascades into the transcoder manager).
//! Nothing is persisted; a restart re-applies the rules from the current
//! clock, so past starts activate immediately and entries whose end has
//! already passed are skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::models::ScheduledChannel;
use crate::services::ChannelService;

const TICK: Duration = Duration::from_secs(1);

struct EntryState {
    entry: ScheduledChannel,
    activated: bool,
    retired: bool,
}

pub struct Scheduler {
    entries: Vec<EntryState>,
    service: Arc<ChannelService>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(entries: Vec<ScheduledChannel>, service: Arc<ChannelService>) -> Self {
        Self::with_tick(entries, service, TICK)
    }

    pub fn with_tick(
        entries: Vec<ScheduledChannel>,
        service: Arc<ChannelService>,
        tick: Duration,
    ) -> Self {
        let entries = entries
            .into_iter()
            .map(|entry| EntryState {
                entry,
                activated: false,
                retired: false,
            })
            .collect();
        Self {
            entries,
            service,
            tick,
        }
    }

    /// Apply boundaries due at `now`. Boundaries are processed in
    /// non-decreasing wall-clock order because each pass retires before
    /// it activates nothing-yet-due entries on later passes.
    async fn apply(&mut self, now: chrono::DateTime<Utc>) {
        for state in &mut self.entries {
            if state.retired {
                continue;
            }
            let schedule = &state.entry.schedule;

            if state.activated {
                if schedule.expired_at(now) {
                    self.service.retire_scheduled(state.entry.channel.id).await;
                    state.retired = true;
                }
                continue;
            }

            if schedule.expired_at(now) {
                // Window already over at boot; never activate
                debug!(
                    id = state.entry.channel.id,
                    "scheduled stream window already passed; skipping"
                );
                state.retired = true;
                continue;
            }

            if schedule.active_at(now) {
                state.activated = self.service.activate_scheduled(state.entry.channel.clone()).await;
                if !state.activated {
                    // Collision with a static channel: drop the entry
                    state.retired = true;
                }
            }
        }
    }

    /// Run the ticker until aborted
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.entries.is_empty() {
                info!("scheduler watching {} scheduled stream(s)", self.entries.len());
            }
            let mut ticker = tokio::time::interval(self.tick);
            loop {
                ticker.tick().await;
                self.apply(Utc::now()).await;
            }
        })
    }
}
