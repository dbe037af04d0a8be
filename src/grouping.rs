//! # Keyed Regrouping
//!
//! [`KeyedRegrouper`] turns a bundle of `(K, V)` windowed elements into one
//! [`KeyedWorkItem`] per distinct key. Keys are compared by their encoding
//! under the declared [`Coder`]: two keys are the same key iff their bytes are
//! equal, whatever the key type's own equality says.
//!
//! Values keep their own timestamps and windows but are not re-windowed here.
//! Every work item is emitted in the global window with
//! [`PaneInfo::NO_FIRING`]; a later window-aware stage restores per-window
//! semantics from the values it carries.
//!
//! If any key fails to encode the whole bundle is aborted: the error names
//! the key and codec and nothing accumulated so far is emitted.
//!
//! No order is guaranteed among the values of one key.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use tracing::debug;

use crate::codec::{Coder, StructuralKey};
use crate::error::InternalError;
use crate::timers::TimerData;
use crate::window::Window;
use crate::windowed_value::{PaneInfo, WindowedValue};
use crate::time::Instant;

/// A key with its grouped values and fired timers.
#[derive(Clone, Debug, PartialEq)]
pub struct KeyedWorkItem<K, V> {
    /// The key (first instance seen in the bundle).
    pub key: K,
    /// Values for the key, key stripped.
    pub elements: Vec<WindowedValue<V>>,
    /// Timers fired for the key.
    pub timers: Vec<TimerData>,
}

impl<K, V> KeyedWorkItem<K, V> {
    /// Creates a work item holding only elements.
    pub fn elements(key: K, elements: Vec<WindowedValue<V>>) -> Self {
        Self {
            key,
            elements,
            timers: Vec::new(),
        }
    }

    /// Creates a work item holding only fired timers.
    pub fn timers(key: K, timers: Vec<TimerData>) -> Self {
        Self {
            key,
            elements: Vec::new(),
            timers,
        }
    }
}

/// A work item addressed to the shard that owns its key.
#[derive(Clone, Debug)]
pub struct KeyedBundle<K, V> {
    /// Encoded key.
    pub structural_key: StructuralKey,
    /// The work item, in the global window.
    pub item: WindowedValue<KeyedWorkItem<K, V>>,
}

impl<K, V> KeyedBundle<K, V> {
    /// Destination shard among `total_shards`.
    pub fn shard(&self, total_shards: u32) -> u32 {
        self.structural_key.shard(total_shards)
    }
}

/// Per-bundle grouping of `(K, V)` elements by encoded key.
pub struct KeyedRegrouper<K, V, C> {
    coder: C,
    groups: HashMap<StructuralKey, KeyedWorkItem<K, V>>,
    order: Vec<StructuralKey>,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V, C> KeyedRegrouper<K, V, C>
where
    K: fmt::Debug,
    C: Coder<K>,
{
    /// Creates a regrouper encoding keys with `coder`.
    pub fn new(coder: C) -> Self {
        Self {
            coder,
            groups: HashMap::new(),
            order: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Adds one element to the current bundle.
    ///
    /// # Errors
    ///
    /// [`InternalError::KeyEncoding`] if the key cannot be encoded. Everything
    /// accumulated in the bundle is discarded.
    pub fn process_element(&mut self, element: WindowedValue<(K, V)>) -> Result<(), InternalError> {
        let structural_key = match StructuralKey::of(&element.value().0, &self.coder) {
            Ok(key) => key,
            Err(err) => {
                self.abort();
                return Err(err);
            }
        };
        let ((key, value), timestamp, windows, pane) = element.into_parts();
        let value = WindowedValue::new(value, timestamp, windows, pane);
        match self.groups.get_mut(&structural_key) {
            Some(item) => item.elements.push(value),
            None => {
                self.order.push(structural_key.clone());
                self.groups
                    .insert(structural_key, KeyedWorkItem::elements(key, vec![value]));
            }
        }
        Ok(())
    }

    /// Emits one work item per distinct key and starts a new bundle.
    pub fn finish_bundle(&mut self) -> Vec<KeyedBundle<K, V>> {
        let mut groups = std::mem::take(&mut self.groups);
        let bundles: Vec<KeyedBundle<K, V>> = std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|structural_key| {
                groups.remove(&structural_key).map(|item| KeyedBundle {
                    item: WindowedValue::of(item, Instant::MIN, Window::Global, PaneInfo::NO_FIRING),
                    structural_key,
                })
            })
            .collect();
        debug!(keys = bundles.len(), "regrouped bundle");
        bundles
    }

    /// Groups a whole bundle. Either every element is grouped or none is.
    pub fn process_bundle(
        &mut self,
        elements: impl IntoIterator<Item = WindowedValue<(K, V)>>,
    ) -> Result<Vec<KeyedBundle<K, V>>, InternalError> {
        for element in elements {
            self.process_element(element)?;
        }
        Ok(self.finish_bundle())
    }

    /// Number of distinct keys in the open bundle.
    pub fn key_count(&self) -> usize {
        self.groups.len()
    }

    fn abort(&mut self) {
        self.groups.clear();
        self.order.clear();
    }
}
