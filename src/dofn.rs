//! User functions and their processing context.
//!
//! A user function implements [`DoFn`]: an explicit lifecycle of `setup`,
//! `start_bundle`, `process_element`, `on_timer`, `finish_bundle` and
//! `teardown`. Only `process_element` is required.
//!
//! Every call receives a [`ProcessContext`] through which the function emits
//! output, reads side inputs and, when the runner is keyed, reads and writes
//! per-key state and timers. Nothing done through the context is visible
//! outside the runner until the bundle commits.
//!
//! Context operations that the engine rejects (an undeclared output tag, a
//! processing-time timer, state access without a current key) return an
//! [`ExecutionError`] *and* are recorded against the bundle, so the runner
//! reports them as engine-side errors even if the function swallows them or
//! converts them into its own error.
//!
//! Functions may be invoked more than once for the same element and window
//! when side inputs arrive: outputs must be safe to replay.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bundle::{BundleScope, Residual, TimerOp};
use crate::codec::StructuralKey;
use crate::config::SplittableBudget;
use crate::error::{BoxError, ExecutionError, ExecutionResult, InternalError, UnsupportedOperation};
use crate::output::{Channel, OutputTable};
use crate::side_input::{SideInputReader, SideInputView, SideValue};
use crate::state::{KeyedStateStore, OperatorId, StateAddress, StateError, StateNamespace};
use crate::time::{Instant, TimeDomain};
use crate::timers::{PerKeyTimerManager, TimerData, TimerState};
use crate::window::Window;
use crate::windowed_value::{PaneInfo, WindowedValue};

/// Name of an output channel.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct OutputTag(String);

impl OutputTag {
    /// Creates a tag.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Tag name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OutputTag {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A per-element user function with an explicit lifecycle.
#[allow(unused_variables)]
pub trait DoFn<I, O>: Send {
    /// Called once before the first bundle.
    fn setup(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called at the start of every bundle.
    fn start_bundle(&mut self, ctx: &mut ProcessContext<'_, I, O>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Processes one element in its ready windows.
    fn process_element(
        &mut self,
        element: &WindowedValue<I>,
        ctx: &mut ProcessContext<'_, I, O>,
    ) -> Result<(), BoxError>;

    /// Called when an event-time timer fires, with its key bound.
    fn on_timer(&mut self, timer: &TimerData, ctx: &mut ProcessContext<'_, I, O>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called at the end of every bundle.
    fn finish_bundle(&mut self, ctx: &mut ProcessContext<'_, I, O>) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called once when the runner shuts down.
    fn teardown(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Timestamp, windows and pane that outputs inherit by default.
#[derive(Clone, Debug)]
pub(crate) struct OutputScope {
    pub(crate) timestamp: Instant,
    pub(crate) windows: Vec<Window>,
    pub(crate) pane: PaneInfo,
}

impl OutputScope {
    pub(crate) fn of<T>(element: &WindowedValue<T>) -> Self {
        Self {
            timestamp: element.timestamp(),
            windows: element.windows().to_vec(),
            pane: element.pane(),
        }
    }

    pub(crate) fn timer(timer: &TimerData) -> Self {
        let window = match timer.namespace {
            StateNamespace::Window(window) => window,
            StateNamespace::Global => Window::Global,
        };
        Self {
            timestamp: timer.target,
            windows: vec![window],
            pane: PaneInfo::NO_FIRING,
        }
    }
}

/// Keyed state backend bound to the owning operator.
pub(crate) struct StateBinding<'a> {
    pub(crate) store: &'a dyn KeyedStateStore,
    pub(crate) operator: &'a OperatorId,
}

/// Everything a user function can reach during one call.
pub struct ProcessContext<'a, I, O> {
    pub(crate) scope: &'a mut BundleScope<I, O>,
    pub(crate) outputs: &'a OutputTable,
    pub(crate) views: &'a [SideInputView],
    pub(crate) reader: &'a dyn SideInputReader,
    pub(crate) timers: &'a PerKeyTimerManager,
    pub(crate) state: Option<StateBinding<'a>>,
    pub(crate) key: Option<&'a StructuralKey>,
    pub(crate) current: Option<OutputScope>,
    pub(crate) input_watermark: Instant,
    pub(crate) splittable: SplittableBudget,
}

impl<I, O> ProcessContext<'_, I, O> {
    fn reject(&mut self, make: impl Fn() -> ExecutionError) -> ExecutionError {
        self.scope.fail(make());
        make()
    }

    fn current(&mut self, operation: &'static str) -> ExecutionResult<OutputScope> {
        match &self.current {
            Some(current) => Ok(current.clone()),
            None => Err(self.reject(|| InternalError::NoCurrentElement(operation).into())),
        }
    }

    fn require_key(&mut self, operation: &'static str) -> ExecutionResult<StructuralKey> {
        match self.key {
            Some(key) => Ok(key.clone()),
            None => Err(self.reject(|| InternalError::NoCurrentKey(operation).into())),
        }
    }

    /// Emits `value` on the main channel with the current element's
    /// timestamp, windows and pane.
    pub fn output(&mut self, value: O) -> ExecutionResult<()> {
        let current = self.current("output")?;
        self.scope.outputs.push((
            Channel::Main,
            WindowedValue::new(value, current.timestamp, current.windows, current.pane),
        ));
        Ok(())
    }

    /// Emits `value` on the main channel with an explicit timestamp.
    pub fn output_with_timestamp(&mut self, value: O, timestamp: Instant) -> ExecutionResult<()> {
        let current = self.current("output_with_timestamp")?;
        self.scope.outputs.push((
            Channel::Main,
            WindowedValue::new(value, timestamp, current.windows, current.pane),
        ));
        Ok(())
    }

    /// Emits a fully specified value on the main channel. Usable from
    /// `start_bundle` and `finish_bundle`.
    pub fn output_windowed(&mut self, value: WindowedValue<O>) {
        self.scope
            .outputs
            .push((Channel::Main, value));
    }

    /// Emits `value` on the channel bound to `tag`, inheriting the current
    /// element's metadata.
    pub fn output_to(&mut self, tag: &OutputTag, value: O) -> ExecutionResult<()> {
        let Some(channel) = self.outputs.channel(tag) else {
            let name = tag.to_string();
            return Err(self.reject(|| InternalError::UnboundOutputTag(name.clone()).into()));
        };
        let current = self.current("output_to")?;
        self.scope.outputs.push((
            channel,
            WindowedValue::new(value, current.timestamp, current.windows, current.pane),
        ));
        Ok(())
    }

    /// Timestamp of the current element, or target of the firing timer.
    pub fn timestamp(&self) -> Option<Instant> {
        self.current.as_ref().map(|c| c.timestamp)
    }

    /// The current window when the element is in exactly one window.
    pub fn window(&self) -> Option<Window> {
        match self.current.as_ref().map(|c| c.windows.as_slice()) {
            Some([window]) => Some(*window),
            _ => None,
        }
    }

    /// Values of the side input at `index` visible from the current window,
    /// downcast to `T`. Values of another type are skipped.
    pub fn side_input<T: Any + Send + Sync>(&mut self, index: usize) -> ExecutionResult<Vec<Arc<T>>> {
        Ok(self
            .side_input_values(index)?
            .into_iter()
            .filter_map(|value| value.downcast::<T>().ok())
            .collect())
    }

    /// Type-erased values of the side input at `index`.
    pub fn side_input_values(&mut self, index: usize) -> ExecutionResult<Vec<SideValue>> {
        let declared = self.views.len();
        let Some(view) = self.views.get(index) else {
            return Err(self.reject(|| InternalError::UnknownSideInput { index, declared }.into()));
        };
        let window = self.window().unwrap_or(Window::Global);
        Ok(self.reader.values(view, &window))
    }

    /// Key of the current invocation, if the runner is keyed.
    pub fn current_key(&self) -> Option<&StructuralKey> {
        self.key
    }

    /// Input watermark at the time of the call.
    pub fn current_input_watermark(&self) -> Instant {
        self.input_watermark
    }

    /// Budget the runner applies to splittable invocations.
    pub fn splittable_budget(&self) -> SplittableBudget {
        self.splittable
    }

    /// Records `err` as the outcome of the current call. The runner reports
    /// it unchanged instead of wrapping what the function returns.
    pub(crate) fn abort(&mut self, err: ExecutionError) -> BoxError {
        let message = err.to_string();
        self.scope.fail(err);
        message.into()
    }

    /// Processing time is not available to this runner.
    pub fn current_processing_time(&mut self) -> ExecutionResult<Instant> {
        Err(self.reject(|| UnsupportedOperation::Clock(TimeDomain::ProcessingTime).into()))
    }

    /// Schedules a timer for the current key. Last set wins.
    pub fn set_timer(
        &mut self,
        namespace: StateNamespace,
        timer_id: impl Into<String>,
        target: Instant,
        domain: TimeDomain,
    ) -> ExecutionResult<()> {
        if domain != TimeDomain::EventTime {
            return Err(self.reject(|| UnsupportedOperation::TimerDomain(domain).into()));
        }
        let key = self.require_key("set_timer")?;
        let timer = TimerData {
            namespace,
            timer_id: timer_id.into(),
            target,
            domain,
        };
        self.scope.timer_ops.push(TimerOp::Set(key, timer));
        Ok(())
    }

    /// Deletes a timer of the current key.
    pub fn delete_timer(&mut self, namespace: StateNamespace, timer_id: &str) -> ExecutionResult<()> {
        let key = self.require_key("delete_timer")?;
        self.scope
            .timer_ops
            .push(TimerOp::Delete(key, namespace, timer_id.to_string()));
        Ok(())
    }

    /// State of a timer of the current key, including changes staged in
    /// this bundle.
    pub fn timer_state(&mut self, namespace: StateNamespace, timer_id: &str) -> ExecutionResult<TimerState> {
        let key = self.require_key("timer_state")?;
        Ok(self
            .scope
            .staged_timer(&key, &namespace, timer_id)
            .unwrap_or_else(|| self.timers.timer_state(&key, &namespace, timer_id)))
    }

    fn address(&mut self, operation: &'static str, namespace: StateNamespace, tag: &str) -> ExecutionResult<StateAddress> {
        let key = self.require_key(operation)?;
        match &self.state {
            Some(binding) => Ok(StateAddress::new(binding.operator.clone(), &key, namespace, tag)),
            None => Err(self.reject(|| {
                StateError::Storage("no state store configured".to_string()).into()
            })),
        }
    }

    /// Reads a state cell of the current key.
    pub fn read_state<T: DeserializeOwned>(
        &mut self,
        namespace: StateNamespace,
        tag: &str,
    ) -> ExecutionResult<Option<T>> {
        let address = self.address("read_state", namespace, tag)?;
        let bytes = match self.scope.staged_state(&address) {
            Some(staged) => staged.map(<[u8]>::to_vec),
            None => {
                let stored = self
                    .state
                    .as_ref()
                    .map(|binding| binding.store.get(&address))
                    .transpose();
                match stored {
                    Ok(value) => value.flatten(),
                    Err(err) => return Err(self.reject(|| err.clone().into())),
                }
            }
        };
        match bytes {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                let message = e.to_string();
                self.reject(|| StateError::Serialization(message.clone()).into())
            }),
        }
    }

    /// Writes a state cell of the current key.
    pub fn write_state<T: Serialize>(
        &mut self,
        namespace: StateNamespace,
        tag: &str,
        value: &T,
    ) -> ExecutionResult<()> {
        let address = self.address("write_state", namespace, tag)?;
        let bytes = serde_json::to_vec(value).map_err(|e| {
            let message = e.to_string();
            self.reject(|| StateError::Serialization(message.clone()).into())
        })?;
        self.scope.state_writes.insert(address, Some(bytes));
        Ok(())
    }

    /// Clears a state cell of the current key.
    pub fn clear_state(&mut self, namespace: StateNamespace, tag: &str) -> ExecutionResult<()> {
        let address = self.address("clear_state", namespace, tag)?;
        self.scope.state_writes.insert(address, None);
        Ok(())
    }

    /// Hands back unfinished work for later continuation, inheriting the
    /// current element's metadata.
    pub fn resume_later(&mut self, residual: I, resume_delay: Option<Duration>) -> ExecutionResult<()> {
        let current = self.current("resume_later")?;
        self.scope.residuals.push(Residual {
            value: WindowedValue::new(residual, current.timestamp, current.windows, current.pane),
            resume_delay,
        });
        Ok(())
    }
}
