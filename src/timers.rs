//! Per-key event-time timers.
//!
//! Each timer is identified by `(key, namespace, timer id)` and moves through
//! `Unset -> Scheduled(target) -> fired -> Unset`. Setting a timer always
//! overwrites the previous schedule for the same identity (last write wins);
//! deleting forces it back to `Unset`.
//!
//! When the input watermark reaches `W`, every scheduled timer whose target is
//! `<= W` becomes due. [`PerKeyTimerManager::pop_due`] removes due timers and
//! hands them to the caller for firing, so a fired timer never fires again
//! unless it is set again.
//!
//! Only event time is driven here. Processing-time and synchronized
//! processing-time timers are rejected with
//! [`UnsupportedOperation::TimerDomain`].

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::codec::StructuralKey;
use crate::error::UnsupportedOperation;
use crate::state::StateNamespace;
use crate::time::{Instant, TimeDomain};

/// A timer scoped to one key.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct TimerData {
    /// Namespace the timer lives in.
    pub namespace: StateNamespace,
    /// User-chosen timer id.
    pub timer_id: String,
    /// Firing time.
    pub target: Instant,
    /// Time domain of `target`.
    pub domain: TimeDomain,
}

impl TimerData {
    /// Creates an event-time timer.
    pub fn event_time(namespace: StateNamespace, timer_id: impl Into<String>, target: Instant) -> Self {
        Self {
            namespace,
            timer_id: timer_id.into(),
            target,
            domain: TimeDomain::EventTime,
        }
    }
}

/// Observable state of one timer identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerState {
    /// Not scheduled (never set, deleted, or already fired).
    Unset,
    /// Scheduled to fire at `target`.
    Scheduled {
        /// Firing time.
        target: Instant,
        /// Time domain.
        domain: TimeDomain,
    },
}

/// A timer that became due, with the key it is bound to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FiredTimer {
    /// Key the timer belongs to.
    pub key: StructuralKey,
    /// The timer.
    pub timer: TimerData,
}

type TimerSlot = (StateNamespace, String);

/// Timer tables for all keys of one operator instance.
///
/// A key's table is created on its first `set_timer` and dropped once empty.
#[derive(Clone, Debug, Default)]
pub struct PerKeyTimerManager {
    timers: HashMap<StructuralKey, BTreeMap<TimerSlot, TimerData>>,
    due_index: BTreeSet<(Instant, StructuralKey, TimerSlot)>,
}

impl PerKeyTimerManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `timer` for `key`, replacing any schedule for the same
    /// namespace and id.
    pub fn set_timer(&mut self, key: &StructuralKey, timer: TimerData) -> Result<(), UnsupportedOperation> {
        if timer.domain != TimeDomain::EventTime {
            return Err(UnsupportedOperation::TimerDomain(timer.domain));
        }
        let slot = (timer.namespace, timer.timer_id.clone());
        let target = timer.target;
        let table = self.timers.entry(key.clone()).or_default();
        if let Some(previous) = table.insert(slot.clone(), timer) {
            self.due_index.remove(&(previous.target, key.clone(), slot.clone()));
        }
        self.due_index.insert((target, key.clone(), slot));
        Ok(())
    }

    /// Deletes a timer. Returns the schedule it had, if any.
    pub fn delete_timer(
        &mut self,
        key: &StructuralKey,
        namespace: &StateNamespace,
        timer_id: &str,
    ) -> Option<TimerData> {
        let table = self.timers.get_mut(key)?;
        let slot = (*namespace, timer_id.to_string());
        let removed = table.remove(&slot)?;
        if table.is_empty() {
            self.timers.remove(key);
        }
        self.due_index.remove(&(removed.target, key.clone(), slot));
        Some(removed)
    }

    /// Returns the state of one timer identity.
    pub fn timer_state(&self, key: &StructuralKey, namespace: &StateNamespace, timer_id: &str) -> TimerState {
        self.timers
            .get(key)
            .and_then(|table| table.get(&(*namespace, timer_id.to_string())))
            .map_or(TimerState::Unset, |timer| TimerState::Scheduled {
                target: timer.target,
                domain: timer.domain,
            })
    }

    /// Removes and returns every timer with `target <= watermark`, earliest
    /// first.
    pub fn pop_due(&mut self, watermark: Instant) -> Vec<FiredTimer> {
        let mut fired = Vec::new();
        while let Some(first) = self.due_index.first() {
            if first.0 > watermark {
                break;
            }
            let Some((_, key, slot)) = self.due_index.pop_first() else {
                break;
            };
            if let Some(table) = self.timers.get_mut(&key) {
                if let Some(timer) = table.remove(&slot) {
                    if table.is_empty() {
                        self.timers.remove(&key);
                    }
                    fired.push(FiredTimer { key, timer });
                }
            }
        }
        fired
    }

    /// Earliest scheduled target, if any.
    pub fn next_due(&self) -> Option<Instant> {
        self.due_index.first().map(|(target, _, _)| *target)
    }

    /// Total number of scheduled timers.
    pub fn pending_count(&self) -> usize {
        self.due_index.len()
    }

    /// Number of keys with at least one scheduled timer.
    pub fn active_keys(&self) -> usize {
        self.timers.len()
    }

    /// Scheduled timers of one key, ordered by namespace and id.
    pub fn timers_for(&self, key: &StructuralKey) -> Vec<TimerData> {
        self.timers
            .get(key)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }
}
