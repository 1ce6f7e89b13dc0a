//! Heartbeat channel - aged priority delivery queue
//!
//! One channel feeds one vehicle agent. Producers enqueue from any task; the
//! consumer waits on a bounded timeout. An empty channel at the deadline is a
//! normal "no heartbeat this tick" outcome, reported as `Reception::Empty`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::contracts::Heartbeat;

/// How queued entries are ranked against the channel's age factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgingPolicy {
    /// `max(1, priority - age)` fixed at enqueue time; later bumps only
    /// affect heartbeats enqueued after them
    #[default]
    AtEnqueue,

    /// Re-scored on every dequeue as `max(1, priority - bumps_waited)`, so
    /// entries that waited through more bumps move ahead
    WhileQueued,
}

/// Result of a dequeue attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reception {
    Delivered {
        adjusted_priority: u32,
        heartbeat: Heartbeat,
    },
    Empty,
}

impl Reception {
    pub fn into_heartbeat(self) -> Option<Heartbeat> {
        match self {
            Reception::Delivered { heartbeat, .. } => Some(heartbeat),
            Reception::Empty => None,
        }
    }
}

#[derive(Debug)]
struct QueuedHeartbeat {
    adjusted_priority: u32,
    age_at_enqueue: u64,
    sequence: u64,
    heartbeat: Heartbeat,
}

#[derive(Debug, Default)]
struct ChannelState {
    entries: Vec<QueuedHeartbeat>,
    age_factor: u64,
    next_sequence: u64,
}

/// Aged priority queue carrying heartbeats to a single consumer
#[derive(Debug)]
pub struct HeartbeatChannel {
    state: Mutex<ChannelState>,
    policy: AgingPolicy,
    ready: Notify,
}

impl HeartbeatChannel {
    /// Create a channel with the enqueue-time aging policy
    pub fn new() -> Self {
        Self::with_policy(AgingPolicy::AtEnqueue)
    }

    pub fn with_policy(policy: AgingPolicy) -> Self {
        Self {
            state: Mutex::new(ChannelState::default()),
            policy,
            ready: Notify::new(),
        }
    }

    pub fn policy(&self) -> AgingPolicy {
        self.policy
    }

    /// Queue a heartbeat
    ///
    /// Under `AtEnqueue` the priority is discounted by the current age factor.
    /// Returns the adjusted priority the entry was stored with.
    pub fn enqueue(&self, heartbeat: Heartbeat) -> u32 {
        let adjusted_priority = {
            let mut state = self.state.lock();
            let adjusted_priority = match self.policy {
                AgingPolicy::AtEnqueue => discount(heartbeat.priority, state.age_factor),
                AgingPolicy::WhileQueued => discount(heartbeat.priority, 0),
            };
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let age_at_enqueue = state.age_factor;
            state.entries.push(QueuedHeartbeat {
                adjusted_priority,
                age_at_enqueue,
                sequence,
                heartbeat,
            });
            adjusted_priority
        };

        trace!(adjusted_priority, "heartbeat queued");
        self.ready.notify_one();
        adjusted_priority
    }

    /// Take the most urgent heartbeat without waiting
    pub fn try_dequeue(&self) -> Reception {
        let mut state = self.state.lock();
        let age_now = state.age_factor;

        let next = state
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, entry)| (self.rank(entry, age_now), entry.sequence))
            .map(|(index, entry)| (index, self.rank(entry, age_now)));

        match next {
            Some((index, adjusted_priority)) => {
                // Order among the rest is recomputed on every call, so
                // swap_remove does not disturb it
                let entry = state.entries.swap_remove(index);
                Reception::Delivered {
                    adjusted_priority,
                    heartbeat: entry.heartbeat,
                }
            }
            None => Reception::Empty,
        }
    }

    /// Wait up to `timeout` for a heartbeat
    pub async fn dequeue(&self, timeout: Duration) -> Reception {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.ready.notified();

            if let reception @ Reception::Delivered { .. } = self.try_dequeue() {
                return reception;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Reception::Empty;
            }
        }
    }

    /// Advance the age factor by one step
    pub fn bump_age(&self) -> u64 {
        let mut state = self.state.lock();
        state.age_factor += 1;
        state.age_factor
    }

    pub fn age_factor(&self) -> u64 {
        self.state.lock().age_factor
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn rank(&self, entry: &QueuedHeartbeat, age_now: u64) -> u32 {
        match self.policy {
            AgingPolicy::AtEnqueue => entry.adjusted_priority,
            AgingPolicy::WhileQueued => {
                discount(entry.heartbeat.priority, age_now - entry.age_at_enqueue)
            }
        }
    }
}

impl Default for HeartbeatChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn discount(priority: u32, age: u64) -> u32 {
    let age = u32::try_from(age).unwrap_or(u32::MAX);
    priority.saturating_sub(age).max(1)
}
