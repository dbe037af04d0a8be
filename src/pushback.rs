//! Side-input pushback.
//!
//! Elements whose side inputs are not yet ready for one of their windows are
//! *pushed back*: held in a [`SideInputPushbackBuffer`] and replayed when new
//! side-input data arrives. The buffer's minimum timestamp holds the output
//! watermark so it never passes data the runner will still emit.
//!
//! [`split_ready_windows`] is the readiness partition. With at least one
//! declared view an element is exploded into one value per window; each
//! window is tested on its own, so a multi-window element can be partially
//! processed and partially pushed back. With no views, or no windows, the
//! element is returned whole and ready.

use crate::side_input::{SideInputReader, SideInputView};
use crate::time::Instant;
use crate::windowed_value::WindowedValue;

/// Ordered multiset of elements awaiting side-input readiness.
///
/// Elements keep arrival order. [`min_timestamp`](Self::min_timestamp) is
/// always the true minimum of the contents, or [`Instant::MAX`] when empty.
#[derive(Clone, Debug)]
pub struct SideInputPushbackBuffer<T> {
    elements: Vec<WindowedValue<T>>,
    min_timestamp: Instant,
}

impl<T> SideInputPushbackBuffer<T> {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            elements: Vec::new(),
            min_timestamp: Instant::MAX,
        }
    }

    /// Appends one element.
    pub fn push(&mut self, element: WindowedValue<T>) {
        self.min_timestamp = self.min_timestamp.min(element.timestamp());
        self.elements.push(element);
    }

    /// Appends elements in order.
    pub fn extend(&mut self, elements: impl IntoIterator<Item = WindowedValue<T>>) {
        for element in elements {
            self.push(element);
        }
    }

    /// Removes and returns all elements, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<WindowedValue<T>> {
        self.min_timestamp = Instant::MAX;
        std::mem::take(&mut self.elements)
    }

    /// Replaces the contents, recomputing the minimum.
    pub fn replace(&mut self, elements: Vec<WindowedValue<T>>) {
        self.min_timestamp = elements
            .iter()
            .map(WindowedValue::timestamp)
            .min()
            .unwrap_or(Instant::MAX);
        self.elements = elements;
    }

    /// Minimum timestamp of the buffered elements, `Instant::MAX` when empty.
    #[inline]
    pub fn min_timestamp(&self) -> Instant {
        self.min_timestamp
    }

    /// Number of buffered elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns true when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterates over buffered elements in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &WindowedValue<T>> {
        self.elements.iter()
    }
}

impl<T> Default for SideInputPushbackBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// An element partitioned by side-input readiness.
#[derive(Clone, Debug, PartialEq)]
pub struct ReadySplit<T> {
    /// Values to process now.
    pub ready: Vec<WindowedValue<T>>,
    /// Values, one per not-ready window, to push back.
    pub pushed_back: Vec<WindowedValue<T>>,
}

impl<T> ReadySplit<T> {
    /// Returns true if nothing was pushed back.
    pub fn is_fully_ready(&self) -> bool {
        self.pushed_back.is_empty()
    }
}

/// Partitions `element` into ready and not-ready windows.
///
/// A window is ready iff every view in `views` is ready for it. An element
/// without side inputs, or without windows, is processed unexploded.
pub fn split_ready_windows<T: Clone>(
    element: WindowedValue<T>,
    views: &[SideInputView],
    reader: &dyn SideInputReader,
) -> ReadySplit<T> {
    if views.is_empty() || element.windows().is_empty() {
        return ReadySplit {
            ready: vec![element],
            pushed_back: Vec::new(),
        };
    }
    let (ready, pushed_back): (Vec<_>, Vec<_>) = element.explode_windows().into_iter().partition(|single| {
        single
            .windows()
            .iter()
            .all(|window| views.iter().all(|view| reader.is_ready(view, window)))
    });
    ReadySplit { ready, pushed_back }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::side_input::{NullSideInputReader, SideInputHandler};
    use crate::window::Window;
    use crate::windowed_value::PaneInfo;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn at(value: u32, ts: i64, windows: &[Window]) -> WindowedValue<u32> {
        WindowedValue::new(
            value,
            Instant::from_millis(ts),
            windows.iter().copied(),
            PaneInfo::NO_FIRING,
        )
    }

    #[test]
    fn empty_buffer_minimum_is_max() {
        let buffer = SideInputPushbackBuffer::<u32>::new();
        assert_eq!(buffer.min_timestamp(), Instant::MAX);
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_and_replace_track_minimum() {
        let mut buffer = SideInputPushbackBuffer::new();
        buffer.push(at(1, 30, &[Window::Global]));
        buffer.push(at(2, 10, &[Window::Global]));
        buffer.push(at(3, 20, &[Window::Global]));
        assert_eq!(buffer.min_timestamp(), Instant::from_millis(10));

        let mut drained = buffer.take();
        assert_eq!(buffer.min_timestamp(), Instant::MAX);
        assert_eq!(drained.iter().map(|v| *v.value()).collect::<Vec<_>>(), vec![1, 2, 3]);

        drained.remove(1);
        buffer.replace(drained);
        assert_eq!(buffer.min_timestamp(), Instant::from_millis(20));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn no_views_returns_element_unexploded() {
        let element = at(7, 0, &[Window::interval(0, 10), Window::interval(5, 15)]);
        let split = split_ready_windows(element.clone(), &[], &NullSideInputReader);
        assert_eq!(split.ready, vec![element]);
        assert!(split.is_fully_ready());
    }

    #[test]
    fn partial_readiness_splits_per_window() {
        let view = SideInputView::new("v");
        let mut handler = SideInputHandler::new();
        handler.add_value(&view, Window::interval(0, 10), Arc::new(0u8));

        let element = at(7, 5, &[Window::interval(0, 10), Window::interval(5, 15)]);
        let split = split_ready_windows(element, &[view], &handler);
        assert_eq!(split.ready.len(), 1);
        assert_eq!(split.ready[0].windows(), &[Window::interval(0, 10)]);
        assert_eq!(split.pushed_back.len(), 1);
        assert_eq!(split.pushed_back[0].windows(), &[Window::interval(5, 15)]);
        assert_eq!(split.pushed_back[0].timestamp(), Instant::from_millis(5));
    }

    #[test]
    fn every_view_must_be_ready() {
        let a = SideInputView::new("a");
        let b = SideInputView::new("b");
        let w = Window::interval(0, 10);
        let mut handler = SideInputHandler::new();
        handler.add_value(&a, w, Arc::new(0u8));

        let split = split_ready_windows(at(1, 0, &[w]), &[a.clone(), b.clone()], &handler);
        assert!(split.ready.is_empty());

        handler.add_value(&b, w, Arc::new(0u8));
        let split = split_ready_windows(at(1, 0, &[w]), &[a, b], &handler);
        assert!(split.is_fully_ready());
    }

    #[test]
    fn windowless_element_is_not_dropped() {
        let view = SideInputView::new("rates");
        let split = split_ready_windows(at(7, 3, &[]), &[view], &SideInputHandler::new());
        assert_eq!(split.ready, vec![at(7, 3, &[])]);
        assert!(split.is_fully_ready());

        let split = split_ready_windows(at(7, 3, &[]), &[], &NullSideInputReader);
        assert_eq!(split.ready, vec![at(7, 3, &[])]);
    }

    proptest! {
        #[test]
        fn minimum_is_true_minimum(timestamps in prop::collection::vec(-1_000i64..1_000, 0..40), keep in 0usize..40) {
            let mut buffer = SideInputPushbackBuffer::new();
            for (i, ts) in timestamps.iter().enumerate() {
                buffer.push(at(i as u32, *ts, &[Window::Global]));
            }
            let expected = timestamps.iter().copied().min().map(Instant::from_millis).unwrap_or(Instant::MAX);
            prop_assert_eq!(buffer.min_timestamp(), expected);

            let mut contents = buffer.take();
            contents.truncate(keep);
            let expected = contents.iter().map(|v| v.timestamp()).min().unwrap_or(Instant::MAX);
            buffer.replace(contents);
            prop_assert_eq!(buffer.min_timestamp(), expected);
        }
    }
}
