//! # Splittable Restriction Processing
//!
//! A splittable function processes an element together with a *restriction*
//! describing which part of the element's work is still to do (for example
//! an offset range of a file). Work is claimed position by position through a
//! [`RestrictionTracker`].
//!
//! [`SplittableRestrictionProcessor`] runs the function under a
//! [`SplittableBudget`]: it calls the user's step repeatedly until the
//! restriction is done, the function asks to stop, or the budget (claimed
//! records or wall-clock time) runs out. It then checkpoints the tracker and
//! returns the unclaimed remainder as a residual instead of blocking.
//!
//! ```text
//! restriction [0, 50000), budget 10000 records
//!   invoke -> outputs for [0, 10000), residual [10000, 50000)
//!   invoke(residual) -> outputs for [10000, 20000), residual [20000, 50000)
//!   ...
//! ```
//!
//! [`SplittableProcessFn`] adapts a splittable function to a regular
//! [`DoFn`] over [`ElementAndRestriction`] values, so it runs inside a
//! [`DoFnRunner`](crate::runner::DoFnRunner) and reports residuals through the
//! bundle result.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::time::{Duration, Instant as WallClock};
use tracing::debug;

use crate::config::SplittableBudget;
use crate::dofn::{DoFn, ProcessContext};
use crate::error::{BoxError, ExecutionError, ExecutionResult, LifecycleStage};
use crate::windowed_value::WindowedValue;

/// Tracks claims against a restriction.
pub trait RestrictionTracker: Send {
    /// The restriction type.
    type Restriction: Clone + fmt::Debug + Send + 'static;
    /// A position within a restriction.
    type Position;

    /// The restriction as currently bounded (shrinks on checkpoint).
    fn current_restriction(&self) -> Self::Restriction;

    /// Claims `position`. Returns `false` if it lies outside the restriction
    /// or is not after the last claimed position; the caller must then stop.
    fn try_claim(&mut self, position: Self::Position) -> bool;

    /// Splits off everything after the last claimed position. Returns the
    /// residual, or `None` if nothing remains.
    fn checkpoint(&mut self) -> Option<Self::Restriction>;

    /// Returns true when every position has been claimed.
    fn is_done(&self) -> bool;
}

/// Half-open range of offsets `[from, to)`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct OffsetRange {
    /// First offset (inclusive).
    pub from: u64,
    /// End offset (exclusive).
    pub to: u64,
}

impl OffsetRange {
    /// Creates a range.
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of offsets in the range.
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    /// Returns true for an empty range.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

/// Tracker over an [`OffsetRange`] claiming strictly increasing offsets.
#[derive(Clone, Debug)]
pub struct OffsetRangeTracker {
    range: OffsetRange,
    last_claimed: Option<u64>,
}

impl OffsetRangeTracker {
    /// Creates a tracker for `range`.
    pub fn new(range: OffsetRange) -> Self {
        Self {
            range,
            last_claimed: None,
        }
    }

    /// Next offset to claim, if any remains.
    pub fn next_position(&self) -> Option<u64> {
        let next = self.last_claimed.map_or(self.range.from, |last| last + 1);
        (next < self.range.to).then_some(next)
    }

    /// Last successfully claimed offset.
    pub fn last_claimed(&self) -> Option<u64> {
        self.last_claimed
    }
}

impl RestrictionTracker for OffsetRangeTracker {
    type Restriction = OffsetRange;
    type Position = u64;

    fn current_restriction(&self) -> OffsetRange {
        self.range
    }

    fn try_claim(&mut self, position: u64) -> bool {
        if position < self.range.from || position >= self.range.to {
            return false;
        }
        if self.last_claimed.is_some_and(|last| position <= last) {
            return false;
        }
        self.last_claimed = Some(position);
        true
    }

    fn checkpoint(&mut self) -> Option<OffsetRange> {
        let split_at = self.last_claimed.map_or(self.range.from, |last| last + 1);
        if split_at >= self.range.to {
            return None;
        }
        let residual = OffsetRange::new(split_at, self.range.to);
        self.range.to = split_at;
        Some(residual)
    }

    fn is_done(&self) -> bool {
        self.next_position().is_none()
    }
}

/// A tracker that stops granting claims once the budget is spent.
///
/// Dereferences to the wrapped tracker for read-only queries.
pub struct BudgetedTracker<'a, T> {
    inner: &'a mut T,
    budget: SplittableBudget,
    started: WallClock,
    claimed: u64,
}

impl<'a, T: RestrictionTracker> BudgetedTracker<'a, T> {
    /// Wraps `inner`; the clock starts now.
    pub fn new(inner: &'a mut T, budget: SplittableBudget) -> Self {
        Self {
            inner,
            budget,
            started: WallClock::now(),
            claimed: 0,
        }
    }

    /// Claims `position` if budget remains.
    pub fn try_claim(&mut self, position: T::Position) -> bool {
        if self.is_exhausted() {
            return false;
        }
        let granted = self.inner.try_claim(position);
        if granted {
            self.claimed += 1;
        }
        granted
    }

    /// Records claimed so far.
    pub fn claimed(&self) -> u64 {
        self.claimed
    }

    /// Time since the invocation started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Returns true once either limit has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.budget.is_exhausted(self.claimed, self.elapsed())
    }
}

impl<T> Deref for BudgetedTracker<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &*self.inner
    }
}

/// What a step asks the processor to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepOutcome {
    /// Keep calling while budget remains.
    Continue,
    /// Stop; whatever is unclaimed becomes the residual.
    Done,
    /// Stop now and resume the residual after at least this delay.
    Resume(Duration),
}

/// A function that processes an element in bounded, resumable steps.
pub trait SplittableDoFn<E, O>: Send {
    /// Tracker for this function's restrictions.
    type Tracker: RestrictionTracker;

    /// Creates a tracker for `restriction`.
    fn new_tracker(
        &self,
        restriction: <Self::Tracker as RestrictionTracker>::Restriction,
    ) -> Self::Tracker;

    /// Does one step of work, claiming positions through `tracker` and
    /// pushing results onto `output`. Must return once a claim is refused.
    fn process_step(
        &mut self,
        element: &E,
        tracker: &mut BudgetedTracker<'_, Self::Tracker>,
        output: &mut Vec<O>,
    ) -> Result<StepOutcome, BoxError>;
}

/// Result of one bounded invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessOutcome<O, R> {
    /// Outputs produced, in order.
    pub outputs: Vec<O>,
    /// Remaining restriction, if the work is not finished.
    pub residual: Option<R>,
    /// Delay requested by the function before resuming.
    pub resume_delay: Option<Duration>,
    /// Records claimed in this invocation.
    pub claimed: u64,
    /// Number of steps run.
    pub steps: u64,
}

/// Runs splittable functions under a budget.
#[derive(Clone, Copy, Debug, Default)]
pub struct SplittableRestrictionProcessor {
    budget: SplittableBudget,
}

impl SplittableRestrictionProcessor {
    /// Creates a processor with `budget`.
    pub fn new(budget: SplittableBudget) -> Self {
        Self { budget }
    }

    /// The budget applied to every invocation.
    pub fn budget(&self) -> SplittableBudget {
        self.budget
    }

    /// Runs `dofn` over `restriction` until it completes, stops, or the
    /// budget runs out, and checkpoints what is left.
    pub fn invoke<E, O, F>(
        &self,
        dofn: &mut F,
        element: &E,
        restriction: <F::Tracker as RestrictionTracker>::Restriction,
    ) -> ExecutionResult<ProcessOutcome<O, <F::Tracker as RestrictionTracker>::Restriction>>
    where
        F: SplittableDoFn<E, O>,
    {
        let mut tracker = dofn.new_tracker(restriction);
        let mut outputs = Vec::new();
        let mut steps = 0u64;
        let mut resume_delay = None;

        let mut budgeted = BudgetedTracker::new(&mut tracker, self.budget);
        loop {
            steps += 1;
            let outcome = dofn
                .process_step(element, &mut budgeted, &mut outputs)
                .map_err(|source| ExecutionError::user(LifecycleStage::ProcessRestriction, source))?;
            match outcome {
                StepOutcome::Done => break,
                StepOutcome::Resume(delay) => {
                    resume_delay = Some(delay);
                    break;
                }
                StepOutcome::Continue => {
                    if budgeted.is_exhausted() || budgeted.is_done() {
                        break;
                    }
                }
            }
        }
        let claimed = budgeted.claimed();
        let elapsed = budgeted.elapsed();

        let residual = tracker.checkpoint();
        debug!(
            claimed,
            steps,
            elapsed_ms = elapsed.as_millis() as u64,
            residual = ?residual,
            "splittable invocation checkpointed"
        );
        Ok(ProcessOutcome {
            outputs,
            residual,
            resume_delay,
            claimed,
            steps,
        })
    }
}

/// An element paired with the restriction still to process.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ElementAndRestriction<E, R> {
    /// The element.
    pub element: E,
    /// The remaining restriction.
    pub restriction: R,
}

impl<E, R> ElementAndRestriction<E, R> {
    /// Pairs an element with a restriction.
    pub fn new(element: E, restriction: R) -> Self {
        Self {
            element,
            restriction,
        }
    }
}

/// Runs a [`SplittableDoFn`] as a regular [`DoFn`].
///
/// Each input is one bounded invocation under the runner's configured
/// [`SplittableBudget`] unless [`with_budget`](Self::with_budget) overrides
/// it. Outputs inherit the input's timestamp and windows; the residual, if
/// any, is handed back through [`ProcessContext::resume_later`].
pub struct SplittableProcessFn<F, E, O> {
    dofn: F,
    budget: Option<SplittableBudget>,
    _marker: PhantomData<fn(E) -> O>,
}

impl<F, E, O> SplittableProcessFn<F, E, O>
where
    F: SplittableDoFn<E, O>,
{
    /// Wraps `dofn`, budgeted by the hosting runner's configuration.
    pub fn new(dofn: F) -> Self {
        Self {
            dofn,
            budget: None,
            _marker: PhantomData,
        }
    }

    /// Uses `budget` instead of the runner's.
    pub fn with_budget(mut self, budget: SplittableBudget) -> Self {
        self.budget = Some(budget);
        self
    }
}

impl<F, E, O> DoFn<ElementAndRestriction<E, <F::Tracker as RestrictionTracker>::Restriction>, O>
    for SplittableProcessFn<F, E, O>
where
    F: SplittableDoFn<E, O>,
    E: Clone + Send,
{
    fn process_element(
        &mut self,
        element: &WindowedValue<ElementAndRestriction<E, <F::Tracker as RestrictionTracker>::Restriction>>,
        ctx: &mut ProcessContext<'_, ElementAndRestriction<E, <F::Tracker as RestrictionTracker>::Restriction>, O>,
    ) -> Result<(), BoxError> {
        let input = element.value();
        let processor =
            SplittableRestrictionProcessor::new(self.budget.unwrap_or(ctx.splittable_budget()));
        let outcome = processor
            .invoke(&mut self.dofn, &input.element, input.restriction.clone())
            .map_err(|err| ctx.abort(err))?;
        for output in outcome.outputs {
            ctx.output(output)?;
        }
        if let Some(restriction) = outcome.residual {
            ctx.resume_later(
                ElementAndRestriction::new(input.element.clone(), restriction),
                outcome.resume_delay,
            )?;
        }
        Ok(())
    }
}
