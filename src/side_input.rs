//! Side inputs: read-only, window-keyed views of another collection.
//!
//! A main-input element may only be processed in a window once every side
//! input it declares is *ready* for that window. What "ready" means is a
//! strategy, expressed by the [`SideInputReader`] trait:
//!
//! - [`SideInputHandler`]: the materialising default. A view is ready for a
//!   window once at least one value for that window has been materialized.
//! - [`NullSideInputReader`]: used when no side inputs are declared; every
//!   view is trivially ready and empty.
//!
//! Side values are type-erased ([`SideValue`]) because one runner reads views
//! of many element types; [`crate::dofn::ProcessContext::side_input`] downcasts
//! them back for the user function.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::window::Window;
use crate::windowed_value::WindowedValue;

/// Type-erased side-input value.
pub type SideValue = Arc<dyn Any + Send + Sync>;

/// How a main-input window maps to the side-input window that serves it.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum WindowMapping {
    /// The side input is read in the same window as the main element.
    #[default]
    Identity,
    /// The side input is global; every main window reads the global window.
    Global,
}

impl WindowMapping {
    /// Maps a main-input window to the side-input window.
    pub fn side_window(&self, main: &Window) -> Window {
        match self {
            WindowMapping::Identity => *main,
            WindowMapping::Global => Window::Global,
        }
    }
}

/// A declared side-input view.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SideInputView {
    id: String,
    mapping: WindowMapping,
}

impl SideInputView {
    /// Declares a view read in the main element's own window.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mapping: WindowMapping::Identity,
        }
    }

    /// Declares a view read in the global window regardless of the main window.
    pub fn global(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mapping: WindowMapping::Global,
        }
    }

    /// View id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Window mapping of the view.
    pub fn mapping(&self) -> WindowMapping {
        self.mapping
    }
}

impl fmt::Display for SideInputView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Readiness and lookup strategy for side inputs.
pub trait SideInputReader: Send {
    /// Whether `view` is ready for the main-input window `window`.
    fn is_ready(&self, view: &SideInputView, window: &Window) -> bool;

    /// Values of `view` visible from the main-input window `window`.
    fn values(&self, view: &SideInputView, window: &Window) -> Vec<SideValue>;

    /// Materializes a side-input value in each of its windows.
    fn materialize(&mut self, view: &SideInputView, value: WindowedValue<SideValue>);
}

/// Reader for runners without side inputs: always ready, never any values.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSideInputReader;

impl SideInputReader for NullSideInputReader {
    fn is_ready(&self, _view: &SideInputView, _window: &Window) -> bool {
        true
    }

    fn values(&self, _view: &SideInputView, _window: &Window) -> Vec<SideValue> {
        Vec::new()
    }

    fn materialize(&mut self, _view: &SideInputView, _value: WindowedValue<SideValue>) {}
}

/// Materialising side-input store.
///
/// Values accumulate per `(view, window)` in arrival order.
#[derive(Default)]
pub struct SideInputHandler {
    entries: HashMap<(String, Window), Vec<SideValue>>,
}

impl SideInputHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `view` in `window`.
    pub fn add_value(&mut self, view: &SideInputView, window: Window, value: SideValue) {
        self.entries
            .entry((view.id.clone(), window))
            .or_default()
            .push(value);
    }

    /// Number of materialized `(view, window)` entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing has been materialized.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SideInputHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut materialized: Vec<&(String, Window)> = self.entries.keys().collect();
        materialized.sort();
        f.debug_struct("SideInputHandler")
            .field("materialized", &materialized)
            .finish()
    }
}

impl SideInputReader for SideInputHandler {
    fn is_ready(&self, view: &SideInputView, window: &Window) -> bool {
        self.entries
            .contains_key(&(view.id.clone(), view.mapping.side_window(window)))
    }

    fn values(&self, view: &SideInputView, window: &Window) -> Vec<SideValue> {
        self.entries
            .get(&(view.id.clone(), view.mapping.side_window(window)))
            .cloned()
            .unwrap_or_default()
    }

    fn materialize(&mut self, view: &SideInputView, value: WindowedValue<SideValue>) {
        let (value, _, windows, _) = value.into_parts();
        for window in windows {
            self.add_value(view, window, Arc::clone(&value));
        }
    }
}
