//! Delayed writes — debounced, cancelable future state writes keyed by
//! target id.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use rulehub_domain::error::RuleHubError;
use rulehub_domain::id::StateId;

use crate::engine::{Engine, lock};
use crate::ports::StateStore;

/// Options for [`Engine::set_state_delayed`].
///
/// One explicit structure instead of positional optional arguments;
/// unset fields keep the defaults (`ack: false`, immediate, cancel
/// existing timers, no completion signal).
pub struct DelayedWrite {
    /// Acknowledged flag of the eventual write.
    pub ack: bool,
    /// How long to wait; zero writes immediately and allocates no
    /// timer.
    pub delay: Duration,
    /// Cancel every existing timer for the same id first (debounce).
    pub clear_running: bool,
    /// Completion signal, resolved after the write went through.
    pub done: Option<oneshot::Sender<()>>,
}

impl Default for DelayedWrite {
    fn default() -> Self {
        Self {
            ack: false,
            delay: Duration::ZERO,
            clear_running: true,
            done: None,
        }
    }
}

impl DelayedWrite {
    /// Write after `delay`.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_ack(mut self, ack: bool) -> Self {
        self.ack = ack;
        self
    }

    /// Keep existing timers for the id instead of debouncing them.
    #[must_use]
    pub fn keep_running(mut self) -> Self {
        self.clear_running = false;
        self
    }

    #[must_use]
    pub fn notify(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }
}

/// Snapshot of one pending delayed write.
#[derive(Debug, Clone, PartialEq)]
pub struct DelayedInfo {
    pub timer_id: u32,
    /// Remaining time until the write fires.
    pub left: Duration,
    /// The configured delay.
    pub delay: Duration,
    pub val: Value,
    pub ack: bool,
}

pub(crate) struct DelayedEntry {
    timer_id: u32,
    armed_at: Instant,
    delay: Duration,
    val: Value,
    ack: bool,
    abort: AbortHandle,
}

impl DelayedEntry {
    fn info(&self) -> DelayedInfo {
        DelayedInfo {
            timer_id: self.timer_id,
            left: self.delay.saturating_sub(self.armed_at.elapsed()),
            delay: self.delay,
            val: self.val.clone(),
            ack: self.ack,
        }
    }
}

/// All pending delayed writes, keyed by target id.
#[derive(Default)]
pub(crate) struct DelayedTable {
    next_id: u32,
    entries: HashMap<StateId, Vec<DelayedEntry>>,
}

impl DelayedTable {
    /// Allocate the next timer id: monotonically increasing, wrapping
    /// at the 32-bit maximum back to zero, never handing out an id
    /// still present in the table.
    fn allocate(&mut self) -> u32 {
        loop {
            self.next_id = if self.next_id >= 0xFFFF_FFFE {
                0
            } else {
                self.next_id + 1
            };
            let taken = self
                .entries
                .values()
                .flatten()
                .any(|entry| entry.timer_id == self.next_id);
            if !taken {
                return self.next_id;
            }
        }
    }
}

impl<S: StateStore> Engine<S> {
    /// Schedule a (possibly debounced) future write.
    ///
    /// With `clear_running` (the default) every existing timer for the
    /// id is canceled first. A zero delay writes immediately and
    /// returns `None`; otherwise the numeric timer handle is returned
    /// and the write happens after the delay. Write failures at fire
    /// time are reported, not propagated.
    ///
    /// # Errors
    ///
    /// Immediate writes (zero delay) propagate [`Engine::set_state`]
    /// errors.
    pub async fn set_state_delayed(
        self: &Arc<Self>,
        id: &StateId,
        value: Value,
        options: DelayedWrite,
    ) -> Result<Option<u32>, RuleHubError> {
        let id = self.resolve_id(id);
        let DelayedWrite {
            ack,
            delay,
            clear_running,
            done,
        } = options;

        if clear_running {
            self.clear_state_delayed(&id, None);
        }

        if delay.is_zero() {
            let result = self.set_state(&id, value, Some(ack)).await;
            if result.is_ok() {
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            return result.map(|()| None);
        }

        let timer_id = lock(&self.delayed).allocate();
        let engine = Arc::clone(self);
        let target = id.clone();
        let pending = value.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = engine.set_state(&target, pending, Some(ack)).await {
                warn!(id = %target, timer_id, error = %err, "delayed write failed");
            }
            engine.remove_delayed_entry(&target, timer_id);
            if let Some(done) = done {
                let _ = done.send(());
            }
        });
        debug!(id = %id, timer_id, ?delay, "delayed write armed");
        lock(&self.delayed)
            .entries
            .entry(id)
            .or_default()
            .push(DelayedEntry {
                timer_id,
                armed_at: Instant::now(),
                delay,
                val: value,
                ack,
                abort: task.abort_handle(),
            });
        Ok(Some(timer_id))
    }

    /// Cancel delayed writes for an id: one specific timer, or all of
    /// them. Returns whether anything was canceled.
    pub fn clear_state_delayed(&self, id: &StateId, timer_id: Option<u32>) -> bool {
        let id = self.resolve_id(id);
        let mut table = lock(&self.delayed);
        let Some(timers) = table.entries.get_mut(&id) else {
            return false;
        };
        match timer_id {
            None => {
                for entry in timers.iter() {
                    entry.abort.abort();
                }
                table.entries.remove(&id);
                debug!(id = %id, "cleared all delayed writes");
                true
            }
            Some(timer_id) => {
                let Some(pos) = timers.iter().position(|entry| entry.timer_id == timer_id)
                else {
                    return false;
                };
                let entry = timers.remove(pos);
                entry.abort.abort();
                if timers.is_empty() {
                    table.entries.remove(&id);
                }
                debug!(id = %id, timer_id, "cleared delayed write");
                true
            }
        }
    }

    /// Pending delayed writes for one id, in arming order.
    #[must_use]
    pub fn get_state_delayed(&self, id: &StateId) -> Vec<DelayedInfo> {
        let id = self.resolve_id(id);
        lock(&self.delayed)
            .entries
            .get(&id)
            .map(|timers| timers.iter().map(DelayedEntry::info).collect())
            .unwrap_or_default()
    }

    /// Look one timer up across all ids.
    #[must_use]
    pub fn get_state_delayed_by_timer(&self, timer_id: u32) -> Option<(StateId, DelayedInfo)> {
        let table = lock(&self.delayed);
        table.entries.iter().find_map(|(id, timers)| {
            timers
                .iter()
                .find(|entry| entry.timer_id == timer_id)
                .map(|entry| (id.clone(), entry.info()))
        })
    }

    /// Every outstanding delayed write, grouped by id.
    #[must_use]
    pub fn get_all_state_delayed(&self) -> BTreeMap<StateId, Vec<DelayedInfo>> {
        lock(&self.delayed)
            .entries
            .iter()
            .map(|(id, timers)| (id.clone(), timers.iter().map(DelayedEntry::info).collect()))
            .collect()
    }

    /// Fired-timer cleanup: drop exactly this entry, collapsing the
    /// id's list when it empties.
    pub(crate) fn remove_delayed_entry(&self, id: &StateId, timer_id: u32) {
        let mut table = lock(&self.delayed);
        if let Some(timers) = table.entries.get_mut(id) {
            timers.retain(|entry| entry.timer_id != timer_id);
            if timers.is_empty() {
                table.entries.remove(id);
            }
        }
    }
}
