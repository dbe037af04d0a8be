//! Bundle scope and bundle results.
//!
//! Everything a user function does while a bundle is open is staged in a
//! [`BundleScope`]: emitted values, pushed-back residue, splittable
//! residuals, timer mutations and state writes. The runner applies the scope
//! only after `finish_bundle` returns successfully. If any step of the bundle
//! fails the scope is dropped and the runner's state is exactly what it was
//! before the bundle started.
//!
//! The committed outcome is handed to the caller as a [`BundleResult`].

use std::collections::BTreeMap;
use std::time::Duration;

use crate::codec::StructuralKey;
use crate::error::ExecutionError;
use crate::output::{Channel, TaggedOutputs};
use crate::state::{StateAddress, StateNamespace};
use crate::time::Instant;
use crate::timers::{TimerData, TimerState};
use crate::windowed_value::WindowedValue;

/// A staged timer mutation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TimerOp {
    Set(StructuralKey, TimerData),
    Delete(StructuralKey, StateNamespace, String),
}

/// Unfinished splittable work to run again later.
#[derive(Clone, Debug, PartialEq)]
pub struct Residual<I> {
    /// The element with its remaining restriction.
    pub value: WindowedValue<I>,
    /// Suggested delay before resuming, if the function asked for one.
    pub resume_delay: Option<Duration>,
}

/// Staged effects of one open bundle.
pub(crate) struct BundleScope<I, O> {
    pub(crate) outputs: Vec<(Channel, WindowedValue<O>)>,
    pub(crate) pushed_back: Vec<WindowedValue<I>>,
    pub(crate) residuals: Vec<Residual<I>>,
    pub(crate) timer_ops: Vec<TimerOp>,
    pub(crate) state_writes: BTreeMap<StateAddress, Option<Vec<u8>>>,
    pub(crate) fired_timers: usize,
    failure: Option<ExecutionError>,
}

impl<I, O> BundleScope<I, O> {
    pub(crate) fn new() -> Self {
        Self {
            outputs: Vec::new(),
            pushed_back: Vec::new(),
            residuals: Vec::new(),
            timer_ops: Vec::new(),
            state_writes: BTreeMap::new(),
            fired_timers: 0,
            failure: None,
        }
    }

    /// Records an engine-side failure. The first one wins.
    pub(crate) fn fail(&mut self, err: ExecutionError) {
        if self.failure.is_none() {
            self.failure = Some(err);
        }
    }

    pub(crate) fn take_failure(&mut self) -> Option<ExecutionError> {
        self.failure.take()
    }

    /// Latest staged state of a timer identity, if this bundle touched it.
    pub(crate) fn staged_timer(
        &self,
        key: &StructuralKey,
        namespace: &StateNamespace,
        timer_id: &str,
    ) -> Option<TimerState> {
        self.timer_ops.iter().rev().find_map(|op| match op {
            TimerOp::Set(k, t) if k == key && t.namespace == *namespace && t.timer_id == timer_id => {
                Some(TimerState::Scheduled {
                    target: t.target,
                    domain: t.domain,
                })
            }
            TimerOp::Delete(k, ns, id) if k == key && ns == namespace && id == timer_id => {
                Some(TimerState::Unset)
            }
            _ => None,
        })
    }

    /// Staged value of a state cell: `Some(None)` if cleared in this bundle.
    pub(crate) fn staged_state(&self, address: &StateAddress) -> Option<Option<&[u8]>> {
        self.state_writes
            .get(address)
            .map(|value| value.as_deref())
    }
}

/// The committed outcome of one bundle or watermark pass.
#[derive(Clone, Debug)]
pub struct BundleResult<I, O> {
    /// Emitted values and watermarks, per channel.
    pub outputs: TaggedOutputs<O>,
    /// Splittable residuals to schedule for continuation.
    pub residuals: Vec<Residual<I>>,
    /// Number of values pushed back by this bundle.
    pub pushed_back: usize,
    /// Minimum timestamp still held back by pushed-back elements after the
    /// bundle, `Instant::MAX` if none.
    pub watermark_hold: Instant,
    /// New output watermark, if this pass advanced it.
    pub output_watermark: Option<Instant>,
    /// Number of timers fired.
    pub fired_timers: usize,
}

impl<I, O> BundleResult<I, O> {
    /// Returns true if the bundle emitted nothing and left no residual work.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.residuals.is_empty() && self.pushed_back == 0
    }
}
