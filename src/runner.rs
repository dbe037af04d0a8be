//! # DoFn Evaluation Runner
//!
//! [`DoFnRunner`] drives one user function ([`DoFn`]) for one operator
//! instance. It owns everything that instance needs between calls:
//!
//! - the static output table (main tag plus side tags, capacity-checked),
//! - the declared side-input views and the readiness strategy,
//! - the pushback buffer of elements waiting for side inputs,
//! - the watermark tracker,
//! - the per-key timer tables,
//! - a handle to the keyed state store.
//!
//! ## Input
//!
//! Input arrives as [`InputMessage`]s: main-channel data and watermarks, and
//! side-channel data tagged with the ordinal of the view it feeds.
//!
//! - **Main data** is processed as a bundle. The current key is resolved
//!   first (when the runner is keyed), the element is split by side-input
//!   readiness, the ready part runs through the function and the rest is
//!   pushed back.
//! - **Main watermarks** advance the tracker, fire every timer that became
//!   due (repeating until no timer set during firing is still due) and then
//!   emit the new output watermark after the timer outputs.
//! - **Side data** is materialized and the whole pushback buffer is replayed;
//!   the residue of the replay replaces the buffer. The output watermark is
//!   then re-evaluated so a drained buffer releases it immediately.
//!   Watermarks on side channels are ignored.
//!
//! ## Atomicity
//!
//! Each call is one bundle. Its effects (outputs, residue, timer mutations,
//! state writes, splittable residuals) are staged and applied only when the
//! bundle finishes successfully. A failure in any lifecycle stage discards
//! the bundle and leaves the runner as it was.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::bundle::{BundleResult, BundleScope, Residual, TimerOp};
use crate::codec::{Coder, StructuralKey};
use crate::config::{RunnerConfig, SplittableBudget};
use crate::dofn::{DoFn, OutputScope, OutputTag, ProcessContext, StateBinding};
use crate::error::{
    BoxError, ConfigError, ExecutionError, ExecutionResult, InternalError, LifecycleStage,
};
use crate::grouping::KeyedWorkItem;
use crate::output::{OutputTable, TaggedOutputs};
use crate::pushback::{SideInputPushbackBuffer, split_ready_windows};
use crate::side_input::{
    NullSideInputReader, SideInputHandler, SideInputReader, SideInputView, SideValue,
};
use crate::state::{KeyedStateStore, OperatorId};
use crate::time::{Instant, StreamMessage};
use crate::timers::PerKeyTimerManager;
use crate::watermark::WatermarkTracker;
use crate::windowed_value::WindowedValue;

/// Resolves the structural key of an input element.
pub trait KeyEncoder<I>: Send + Sync {
    /// Encodes the element's key.
    fn encode_key(&self, element: &I) -> Result<StructuralKey, InternalError>;
}

/// Key encoder for `(K, V)` pairs and keyed work items.
#[derive(Clone, Debug, Default)]
pub struct KvKeyEncoder<C> {
    coder: C,
}

impl<C> KvKeyEncoder<C> {
    /// Creates an encoder using `coder` for keys.
    pub fn new(coder: C) -> Self {
        Self { coder }
    }
}

impl<K: fmt::Debug, V, C: Coder<K>> KeyEncoder<(K, V)> for KvKeyEncoder<C> {
    fn encode_key(&self, element: &(K, V)) -> Result<StructuralKey, InternalError> {
        StructuralKey::of(&element.0, &self.coder)
    }
}

impl<K: fmt::Debug, V, C: Coder<K>> KeyEncoder<KeyedWorkItem<K, V>> for KvKeyEncoder<C> {
    fn encode_key(&self, element: &KeyedWorkItem<K, V>) -> Result<StructuralKey, InternalError> {
        StructuralKey::of(&element.key, &self.coder)
    }
}

/// A message on one of the runner's input channels.
#[derive(Clone, Debug)]
pub enum InputMessage<I> {
    /// Main-channel data or watermark.
    Main(StreamMessage<I>),
    /// Side-channel message for the view at `index`.
    Side {
        /// Ordinal of the declared view.
        index: usize,
        /// The message. Watermarks are ignored.
        message: StreamMessage<SideValue>,
    },
}

/// Builder for [`DoFnRunner`].
pub struct RunnerBuilder<I, O> {
    dofn: Box<dyn DoFn<I, O>>,
    config: RunnerConfig,
    main_output: OutputTag,
    side_outputs: Vec<OutputTag>,
    views: Vec<SideInputView>,
    reader: Option<Box<dyn SideInputReader>>,
    state: Option<Arc<dyn KeyedStateStore>>,
    key_encoder: Option<Box<dyn KeyEncoder<I>>>,
}

impl<I, O> RunnerBuilder<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Sets the main output tag. Defaults to `"main"`.
    pub fn main_output(mut self, tag: impl Into<OutputTag>) -> Self {
        self.main_output = tag.into();
        self
    }

    /// Declares the side output tags, in channel order.
    pub fn side_outputs(mut self, tags: impl IntoIterator<Item = OutputTag>) -> Self {
        self.side_outputs = tags.into_iter().collect();
        self
    }

    /// Declares side-input views. Without an explicit reader a
    /// [`SideInputHandler`] is used.
    pub fn side_inputs(mut self, views: impl IntoIterator<Item = SideInputView>) -> Self {
        self.views = views.into_iter().collect();
        self
    }

    /// Sets the side-input readiness strategy.
    pub fn side_input_reader(mut self, reader: impl SideInputReader + 'static) -> Self {
        self.reader = Some(Box::new(reader));
        self
    }

    /// Sets the keyed state store.
    pub fn state_store(mut self, store: Arc<dyn KeyedStateStore>) -> Self {
        self.state = Some(store);
        self
    }

    /// Makes the runner keyed: every element's key is resolved with `encoder`
    /// and bound for state and timer access.
    pub fn keyed(mut self, encoder: impl KeyEncoder<I> + 'static) -> Self {
        self.key_encoder = Some(Box::new(encoder));
        self
    }

    /// Builds the runner.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if the side outputs exceed the configured capacity,
    /// a tag is declared twice, or the splittable budget is invalid.
    pub fn build(self) -> Result<DoFnRunner<I, O>, ConfigError> {
        self.config.validate()?;
        let outputs = OutputTable::new(
            self.main_output,
            self.side_outputs,
            self.config.max_side_outputs,
        )?;
        let reader: Box<dyn SideInputReader> = match self.reader {
            Some(reader) => reader,
            None if self.views.is_empty() => Box::new(NullSideInputReader),
            None => Box::new(SideInputHandler::new()),
        };
        let has_side_inputs = !self.views.is_empty();
        Ok(DoFnRunner {
            dofn: self.dofn,
            operator: OperatorId::new(self.config.operator_id.clone()),
            config: self.config,
            outputs,
            views: self.views,
            reader,
            pushback: SideInputPushbackBuffer::new(),
            watermark: WatermarkTracker::new(has_side_inputs),
            timers: PerKeyTimerManager::new(),
            state: self.state,
            key_encoder: self.key_encoder,
            lifecycle: Lifecycle::Created,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Lifecycle {
    Created,
    Active,
    TornDown,
}

/// Runs one user function for one operator instance.
pub struct DoFnRunner<I, O> {
    dofn: Box<dyn DoFn<I, O>>,
    config: RunnerConfig,
    operator: OperatorId,
    outputs: OutputTable,
    views: Vec<SideInputView>,
    reader: Box<dyn SideInputReader>,
    pushback: SideInputPushbackBuffer<I>,
    watermark: WatermarkTracker,
    timers: PerKeyTimerManager,
    state: Option<Arc<dyn KeyedStateStore>>,
    key_encoder: Option<Box<dyn KeyEncoder<I>>>,
    lifecycle: Lifecycle,
}

/// Shared, read-only pieces of a context, borrowed from the runner.
struct Env<'a> {
    outputs: &'a OutputTable,
    views: &'a [SideInputView],
    reader: &'a dyn SideInputReader,
    store: Option<&'a dyn KeyedStateStore>,
    operator: &'a OperatorId,
    input_watermark: Instant,
    splittable: SplittableBudget,
}

impl<'a> Env<'a> {
    fn context<'s, I, O>(
        &self,
        scope: &'s mut BundleScope<I, O>,
        timers: &'s PerKeyTimerManager,
        key: Option<&'s StructuralKey>,
        current: Option<OutputScope>,
    ) -> ProcessContext<'s, I, O>
    where
        'a: 's,
    {
        ProcessContext {
            scope,
            outputs: self.outputs,
            views: self.views,
            reader: self.reader,
            timers,
            state: self.store.map(|store| StateBinding {
                store,
                operator: self.operator,
            }),
            key,
            current,
            input_watermark: self.input_watermark,
            splittable: self.splittable,
        }
    }
}

/// Engine-side failures recorded in the scope take precedence over what the
/// user function returned.
fn settle<I, O>(
    scope: &mut BundleScope<I, O>,
    stage: LifecycleStage,
    result: Result<(), BoxError>,
) -> ExecutionResult<()> {
    if let Some(err) = scope.take_failure() {
        return Err(err);
    }
    result.map_err(|source| ExecutionError::user(stage, source))
}

fn apply_timer_ops(timers: &mut PerKeyTimerManager, ops: Vec<TimerOp>) -> ExecutionResult<()> {
    for op in ops {
        match op {
            TimerOp::Set(key, timer) => timers.set_timer(&key, timer)?,
            TimerOp::Delete(key, namespace, timer_id) => {
                timers.delete_timer(&key, &namespace, &timer_id);
            }
        }
    }
    Ok(())
}

/// Applied effects of a committed scope.
struct Committed<I, O> {
    outputs: TaggedOutputs<O>,
    residuals: Vec<Residual<I>>,
    pushed_back: Vec<WindowedValue<I>>,
    fired_timers: usize,
}

impl<I, O> DoFnRunner<I, O>
where
    I: Clone + Send + 'static,
    O: Send + 'static,
{
    /// Starts building a runner for `dofn`.
    pub fn builder(dofn: impl DoFn<I, O> + 'static, config: RunnerConfig) -> RunnerBuilder<I, O> {
        RunnerBuilder {
            dofn: Box::new(dofn),
            config,
            main_output: OutputTag::new("main"),
            side_outputs: Vec::new(),
            views: Vec::new(),
            reader: None,
            state: None,
            key_encoder: None,
        }
    }

    /// Calls the function's `setup`. Runs implicitly before the first bundle.
    pub fn setup(&mut self) -> ExecutionResult<()> {
        if self.lifecycle != Lifecycle::Created {
            return Ok(());
        }
        self.dofn
            .setup()
            .map_err(|source| ExecutionError::user(LifecycleStage::Setup, source))?;
        self.lifecycle = Lifecycle::Active;
        debug!(operator = %self.operator, "runner set up");
        Ok(())
    }

    /// Calls the function's `teardown` if it was set up. Idempotent.
    pub fn teardown(&mut self) -> ExecutionResult<()> {
        let was_active = self.lifecycle == Lifecycle::Active;
        self.lifecycle = Lifecycle::TornDown;
        if was_active {
            self.dofn
                .teardown()
                .map_err(|source| ExecutionError::user(LifecycleStage::Teardown, source))?;
            debug!(operator = %self.operator, "runner torn down");
        }
        Ok(())
    }

    /// Dispatches one input message.
    pub fn process(&mut self, message: InputMessage<I>) -> ExecutionResult<BundleResult<I, O>> {
        match message {
            InputMessage::Main(StreamMessage::Data(element)) => self.process_element(element),
            InputMessage::Main(StreamMessage::Watermark(watermark)) => {
                self.process_watermark(watermark)
            }
            InputMessage::Side { index, message } => self.process_side_input(index, message),
        }
    }

    /// Processes one element as its own bundle.
    pub fn process_element(&mut self, element: WindowedValue<I>) -> ExecutionResult<BundleResult<I, O>> {
        self.process_bundle(vec![element])
    }

    /// Processes elements as one bundle, in order.
    ///
    /// Not-ready windows are added to the pushback buffer on commit.
    pub fn process_bundle(
        &mut self,
        elements: Vec<WindowedValue<I>>,
    ) -> ExecutionResult<BundleResult<I, O>> {
        let scope = self.execute_bundle(elements)?;
        let committed = self.commit(scope)?;
        let pushed_back = committed.pushed_back.len();
        self.pushback.extend(committed.pushed_back);
        Ok(BundleResult {
            outputs: committed.outputs,
            residuals: committed.residuals,
            pushed_back,
            watermark_hold: self.pushback.min_timestamp(),
            output_watermark: None,
            fired_timers: committed.fired_timers,
        })
    }

    /// Handles a message on side channel `index`.
    ///
    /// Data is materialized, then every pushed-back element is retried. The
    /// residue replaces the buffer and the output watermark is re-evaluated.
    ///
    /// # Errors
    ///
    /// [`InternalError::UnknownSideInput`] if `index` names no declared view.
    /// A failed replay leaves the buffer as it was; the materialized value
    /// is kept.
    pub fn process_side_input(
        &mut self,
        index: usize,
        message: StreamMessage<SideValue>,
    ) -> ExecutionResult<BundleResult<I, O>> {
        let declared = self.views.len();
        let Some(view) = self.views.get(index) else {
            return Err(InternalError::UnknownSideInput { index, declared }.into());
        };
        let value = match message {
            StreamMessage::Watermark(watermark) => {
                trace!(operator = %self.operator, view = %view, watermark = %watermark, "ignoring side input watermark");
                return Ok(self.empty_result());
            }
            StreamMessage::Data(value) => value,
        };
        if self.config.trace_elements {
            debug!(
                operator = %self.operator,
                view = %view,
                timestamp = %value.timestamp(),
                windows = ?value.windows(),
                "side input"
            );
        }
        self.reader.materialize(view, value);

        let mut result = self.empty_result();
        if !self.pushback.is_empty() {
            let buffered = self.pushback.take();
            let replayed = self
                .execute_bundle(buffered.clone())
                .and_then(|scope| self.commit(scope));
            match replayed {
                Ok(committed) => {
                    result.pushed_back = committed.pushed_back.len();
                    result.outputs = committed.outputs;
                    result.residuals = committed.residuals;
                    self.pushback.replace(committed.pushed_back);
                }
                Err(err) => {
                    self.pushback.replace(buffered);
                    return Err(err);
                }
            }
        }

        result.output_watermark = self.watermark.reevaluate(self.pushback.min_timestamp());
        if let Some(watermark) = result.output_watermark {
            debug!(operator = %self.operator, watermark = %watermark, "output watermark released");
            result.outputs.push_watermark(watermark);
        }
        result.watermark_hold = self.pushback.min_timestamp();
        Ok(result)
    }

    /// Advances the input watermark, fires due timers and emits the new
    /// output watermark after the timer outputs.
    ///
    /// # Errors
    ///
    /// [`InternalError::WatermarkRegression`] if `watermark` is behind the
    /// current input watermark. A failing timer callback discards the whole
    /// pass, including the watermark advance.
    pub fn process_watermark(&mut self, watermark: Instant) -> ExecutionResult<BundleResult<I, O>> {
        self.setup()?;
        let mut tracker = self.watermark.clone();
        let advanced = tracker.advance(watermark, self.pushback.min_timestamp())?;

        let mut timers = self.timers.clone();
        let splittable = self.config.splittable;
        let mut scope = BundleScope::new();
        let mut started = false;
        {
            let Self {
                dofn,
                outputs,
                views,
                reader,
                state,
                operator,
                ..
            } = &mut *self;
            let env = Env {
                outputs,
                views,
                reader: &**reader,
                store: state.as_deref(),
                operator,
                input_watermark: tracker.input_watermark(),
                splittable,
            };
            let operator = env.operator;
            loop {
                let due = timers.pop_due(tracker.input_watermark());
                if due.is_empty() {
                    break;
                }
                if !started {
                    let result = dofn.start_bundle(&mut env.context(&mut scope, &timers, None, None));
                    settle(&mut scope, LifecycleStage::StartBundle, result)?;
                    started = true;
                }
                for fired in &due {
                    debug!(
                        operator = %operator,
                        timer_id = %fired.timer.timer_id,
                        namespace = %fired.timer.namespace,
                        target = %fired.timer.target,
                        "firing timer"
                    );
                    let result = dofn.on_timer(
                        &fired.timer,
                        &mut env.context(
                            &mut scope,
                            &timers,
                            Some(&fired.key),
                            Some(OutputScope::timer(&fired.timer)),
                        ),
                    );
                    settle(&mut scope, LifecycleStage::OnTimer, result)?;
                }
                scope.fired_timers += due.len();
                apply_timer_ops(&mut timers, std::mem::take(&mut scope.timer_ops))?;
            }
            if started {
                let result = dofn.finish_bundle(&mut env.context(&mut scope, &timers, None, None));
                settle(&mut scope, LifecycleStage::FinishBundle, result)?;
                // Timers touched in finish_bundle are not fired until the next pass.
                apply_timer_ops(&mut timers, std::mem::take(&mut scope.timer_ops))?;
            }
        }

        let mut committed = self.commit(scope)?;
        self.watermark = tracker;
        self.timers = timers;
        if let Some(output) = advanced {
            debug!(operator = %self.operator, watermark = %output, "output watermark advanced");
            committed.outputs.push_watermark(output);
        }
        Ok(BundleResult {
            outputs: committed.outputs,
            residuals: committed.residuals,
            pushed_back: 0,
            watermark_hold: self.pushback.min_timestamp(),
            output_watermark: advanced,
            fired_timers: committed.fired_timers,
        })
    }

    /// Runs one bundle over `elements` and returns its staged effects.
    fn execute_bundle(&mut self, elements: Vec<WindowedValue<I>>) -> ExecutionResult<BundleScope<I, O>> {
        self.setup()?;
        let trace_elements = self.config.trace_elements;
        let splittable = self.config.splittable;
        let mut scope = BundleScope::new();
        let Self {
            dofn,
            outputs,
            views,
            reader,
            state,
            operator,
            timers,
            key_encoder,
            watermark,
            ..
        } = &mut *self;
        let env = Env {
            outputs,
            views,
            reader: &**reader,
            store: state.as_deref(),
            operator,
            input_watermark: watermark.input_watermark(),
            splittable,
        };
        let operator = env.operator;

        let result = dofn.start_bundle(&mut env.context(&mut scope, timers, None, None));
        settle(&mut scope, LifecycleStage::StartBundle, result)?;

        for element in elements {
            if trace_elements {
                debug!(
                    operator = %operator,
                    timestamp = %element.timestamp(),
                    windows = ?element.windows(),
                    "input element"
                );
            }
            let key = key_encoder
                .as_ref()
                .map(|encoder| encoder.encode_key(element.value()))
                .transpose()?;
            let split = split_ready_windows(element, env.views, env.reader);
            for ready in &split.ready {
                let result = dofn.process_element(
                    ready,
                    &mut env.context(&mut scope, timers, key.as_ref(), Some(OutputScope::of(ready))),
                );
                settle(&mut scope, LifecycleStage::ProcessElement, result)?;
            }
            if trace_elements && !split.pushed_back.is_empty() {
                debug!(operator = %operator, windows = split.pushed_back.len(), "pushed back");
            }
            scope.pushed_back.extend(split.pushed_back);
        }

        let result = dofn.finish_bundle(&mut env.context(&mut scope, timers, None, None));
        settle(&mut scope, LifecycleStage::FinishBundle, result)?;
        Ok(scope)
    }

    /// Applies state writes and timer mutations and resolves outputs.
    fn commit(&mut self, scope: BundleScope<I, O>) -> ExecutionResult<Committed<I, O>> {
        let mut timers = self.timers.clone();
        apply_timer_ops(&mut timers, scope.timer_ops)?;
        if let Some(store) = &self.state {
            if !scope.state_writes.is_empty() {
                store.apply(scope.state_writes.into_iter().collect())?;
            }
        }
        self.timers = timers;
        let mut outputs = TaggedOutputs::new(&self.outputs);
        for (channel, value) in scope.outputs {
            if self.config.trace_elements {
                debug!(
                    operator = %self.operator,
                    channel = ?channel,
                    timestamp = %value.timestamp(),
                    "emit"
                );
            }
            outputs.push(channel, value);
        }
        Ok(Committed {
            outputs,
            residuals: scope.residuals,
            pushed_back: scope.pushed_back,
            fired_timers: scope.fired_timers,
        })
    }

    fn empty_result(&self) -> BundleResult<I, O> {
        BundleResult {
            outputs: TaggedOutputs::new(&self.outputs),
            residuals: Vec::new(),
            pushed_back: 0,
            watermark_hold: self.pushback.min_timestamp(),
            output_watermark: None,
            fired_timers: 0,
        }
    }

    /// Current input watermark.
    pub fn input_watermark(&self) -> Instant {
        self.watermark.input_watermark()
    }

    /// Current output watermark.
    pub fn output_watermark(&self) -> Instant {
        self.watermark.output_watermark()
    }

    /// Elements currently pushed back.
    pub fn pushback(&self) -> &SideInputPushbackBuffer<I> {
        &self.pushback
    }

    /// Timer tables.
    pub fn timers(&self) -> &PerKeyTimerManager {
        &self.timers
    }

    /// Output table.
    pub fn output_table(&self) -> &OutputTable {
        &self.outputs
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }
}

impl<I, O> Drop for DoFnRunner<I, O> {
    fn drop(&mut self) {
        if self.lifecycle == Lifecycle::Active {
            if let Err(err) = self.dofn.teardown() {
                debug!(operator = %self.operator, error = %err, "teardown failed on drop");
            }
        }
    }
}
