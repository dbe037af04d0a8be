//! # Watermark Tracking
//!
//! Watermarks assert that no future element with a lower timestamp will be
//! produced. This module provides the two trackers of the execution core.
//!
//! ## [`WatermarkTracker`]
//!
//! Tracks the input and output watermark of one operator instance. The output
//! watermark is held back by the minimum timestamp of pushed-back elements so
//! it never overtakes data the operator will still emit:
//!
//! ```text
//! candidate = min(pushback.min_timestamp(), input_watermark)
//! emit candidate iff candidate > output_watermark
//! ```
//!
//! With no declared side inputs nothing can be pushed back and the output
//! watermark mirrors the input watermark exactly.
//!
//! A regressing input watermark is an internal consistency violation. It is
//! rejected with an error and never clamped.
//!
//! ```rust
//! use tidemark::time::Instant;
//! use tidemark::watermark::WatermarkTracker;
//!
//! let mut tracker = WatermarkTracker::new(true);
//! // An element at t=40 is still buffered.
//! let held = tracker.advance(Instant::from_millis(100), Instant::from_millis(40)).unwrap();
//! assert_eq!(held, Some(Instant::from_millis(40)));
//! // The buffer drained.
//! let released = tracker.advance(Instant::from_millis(100), Instant::MAX).unwrap();
//! assert_eq!(released, Some(Instant::from_millis(100)));
//! ```
//!
//! ## [`PartitionedWatermarks`]
//!
//! Aggregates `(low, high, synchronized processing time)` reports from
//! independent upstream sources. Each source has a FIFO queue of reports; an
//! aggregation pass pops one report per source and merges it with that
//! source's stored values using `max`. The merged aggregate, holding the
//! sources that reported in the pass, replaces the stored one in a single
//! swap, so readers never see a half-applied pass.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

use crate::error::InternalError;
use crate::state::StateError;
use crate::time::Instant;

/// Input and output watermark of one operator instance.
#[derive(Clone, Debug)]
pub struct WatermarkTracker {
    input: Instant,
    output: Instant,
    has_side_inputs: bool,
}

impl WatermarkTracker {
    /// Creates a tracker with both watermarks at negative infinity.
    ///
    /// With `has_side_inputs == false` the output mirrors the input.
    pub fn new(has_side_inputs: bool) -> Self {
        Self {
            input: Instant::MIN,
            output: Instant::MIN,
            has_side_inputs,
        }
    }

    /// Current input watermark.
    #[inline]
    pub fn input_watermark(&self) -> Instant {
        self.input
    }

    /// Current output watermark.
    #[inline]
    pub fn output_watermark(&self) -> Instant {
        self.output
    }

    /// Advances the input watermark and returns the new output watermark if
    /// it moved.
    ///
    /// `pushback_min` is the minimum timestamp of pushed-back elements
    /// (`Instant::MAX` when none). It is ignored without side inputs.
    ///
    /// # Errors
    ///
    /// [`InternalError::WatermarkRegression`] if `new_input` is behind the
    /// current input watermark. Neither watermark changes.
    pub fn advance(
        &mut self,
        new_input: Instant,
        pushback_min: Instant,
    ) -> Result<Option<Instant>, InternalError> {
        if new_input < self.input {
            return Err(InternalError::WatermarkRegression {
                current: self.input,
                attempted: new_input,
            });
        }
        self.input = new_input;

        let candidate = if self.has_side_inputs {
            pushback_min.min(self.input)
        } else {
            self.input
        };
        if candidate > self.output {
            self.output = candidate;
            Ok(Some(candidate))
        } else {
            Ok(None)
        }
    }

    /// Re-runs output computation at the current input watermark, e.g. after
    /// pushed-back elements were released.
    pub fn reevaluate(&mut self, pushback_min: Instant) -> Option<Instant> {
        // Re-advancing to the current input cannot regress.
        self.advance(self.input, pushback_min).ok().flatten()
    }
}

/// Watermarks reported by, or aggregated for, one upstream source.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SourceWatermarks {
    /// Low watermark.
    pub low: Instant,
    /// High watermark.
    pub high: Instant,
    /// Synchronized processing time of the report.
    pub synchronized_processing_time: Instant,
}

impl SourceWatermarks {
    /// Creates a report.
    pub fn new(low: Instant, high: Instant, synchronized_processing_time: Instant) -> Self {
        Self {
            low,
            high,
            synchronized_processing_time,
        }
    }
}

/// Aggregated watermarks per source id.
pub type WatermarkSnapshot = Arc<HashMap<u32, SourceWatermarks>>;

/// Multi-source watermark aggregation.
///
/// Safe to share between reporting threads and the thread running passes.
#[derive(Debug)]
pub struct PartitionedWatermarks {
    pending: Mutex<HashMap<u32, VecDeque<SourceWatermarks>>>,
    current: RwLock<WatermarkSnapshot>,
    last_watermarked_batch_time: AtomicI64,
}

impl PartitionedWatermarks {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            current: RwLock::new(Arc::new(HashMap::new())),
            last_watermarked_batch_time: AtomicI64::new(Instant::MIN.millis()),
        }
    }

    /// Queues a report from `source_id`.
    pub fn report(&self, source_id: u32, watermarks: SourceWatermarks) -> Result<(), InternalError> {
        let mut pending = self.pending.lock().map_err(|_| StateError::LockPoisoned)?;
        pending.entry(source_id).or_default().push_back(watermarks);
        Ok(())
    }

    /// Number of queued, unapplied reports across all sources.
    pub fn pending_reports(&self) -> Result<usize, InternalError> {
        let pending = self.pending.lock().map_err(|_| StateError::LockPoisoned)?;
        Ok(pending.values().map(VecDeque::len).sum())
    }

    /// Current aggregate.
    pub fn get(&self) -> Result<WatermarkSnapshot, InternalError> {
        let current = self.current.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(Arc::clone(&current))
    }

    /// Current aggregate for one source.
    pub fn get_source(&self, source_id: u32) -> Result<Option<SourceWatermarks>, InternalError> {
        Ok(self.get()?.get(&source_id).copied())
    }

    /// Runs one aggregation pass.
    ///
    /// Pops the oldest queued report of every source that has one and merges
    /// it with that source's stored values. The new aggregate holds only the
    /// sources that reported in this pass and replaces the stored one.
    /// Returns `None` (aggregate untouched) when nothing was queued.
    ///
    /// # Errors
    ///
    /// [`InternalError::WatermarkInverted`] if a merged low is later than the
    /// merged high; [`InternalError::SynchronizedTimeStalled`] if a report's
    /// synchronized processing time does not advance past the stored one. On
    /// error no report is consumed and the aggregate is unchanged.
    pub fn advance(&self) -> Result<Option<WatermarkSnapshot>, InternalError> {
        let mut pending = self.pending.lock().map_err(|_| StateError::LockPoisoned)?;
        if pending.values().all(VecDeque::is_empty) {
            debug!("no new watermarks reported, aggregate unchanged");
            return Ok(None);
        }

        let stored = self.get()?;
        let mut merged: HashMap<u32, SourceWatermarks> = HashMap::with_capacity(pending.len());
        for (&source_id, queue) in pending.iter() {
            let Some(reported) = queue.front() else {
                continue;
            };
            let next = match stored.get(&source_id) {
                Some(stored) => {
                    let low = stored.low.max(reported.low);
                    let high = stored.high.max(reported.high);
                    if low > high {
                        return Err(InternalError::WatermarkInverted { source_id, low, high });
                    }
                    if reported.synchronized_processing_time <= stored.synchronized_processing_time {
                        return Err(InternalError::SynchronizedTimeStalled {
                            source_id,
                            current: stored.synchronized_processing_time,
                            attempted: reported.synchronized_processing_time,
                        });
                    }
                    SourceWatermarks::new(low, high, reported.synchronized_processing_time)
                }
                None => {
                    if reported.low > reported.high {
                        return Err(InternalError::WatermarkInverted {
                            source_id,
                            low: reported.low,
                            high: reported.high,
                        });
                    }
                    *reported
                }
            };
            merged.insert(source_id, next);
        }

        for queue in pending.values_mut() {
            queue.pop_front();
        }
        pending.retain(|_, queue| !queue.is_empty());

        let snapshot = Arc::new(merged);
        *self.current.write().map_err(|_| StateError::LockPoisoned)? = Arc::clone(&snapshot);
        for (source_id, watermarks) in snapshot.iter() {
            debug!(
                source_id,
                low = %watermarks.low,
                high = %watermarks.high,
                synchronized_processing_time = %watermarks.synchronized_processing_time,
                "aggregated source watermarks"
            );
        }
        Ok(Some(snapshot))
    }

    /// Runs a pass for a completed batch and records the batch time if the
    /// aggregate advanced.
    pub fn on_batch_completed(&self, batch_time: Instant) -> Result<Option<WatermarkSnapshot>, InternalError> {
        let advanced = self.advance()?;
        if advanced.is_some() {
            self.last_watermarked_batch_time
                .store(batch_time.millis(), Ordering::Release);
            info!(batch_time = %batch_time, "watermarks advanced for batch");
        }
        Ok(advanced)
    }

    /// Time of the last batch whose completion advanced the aggregate.
    pub fn last_watermarked_batch_time(&self) -> Instant {
        Instant::from_millis(self.last_watermarked_batch_time.load(Ordering::Acquire))
    }

    /// Drops queued reports and the stored aggregate.
    pub fn clear(&self) -> Result<(), InternalError> {
        self.pending.lock().map_err(|_| StateError::LockPoisoned)?.clear();
        *self.current.write().map_err(|_| StateError::LockPoisoned)? = Arc::new(HashMap::new());
        self.last_watermarked_batch_time
            .store(Instant::MIN.millis(), Ordering::Release);
        Ok(())
    }
}

impl Default for PartitionedWatermarks {
    fn default() -> Self {
        Self::new()
    }
}
