//! Tagged output channels.
//!
//! A runner emits on one main channel and a small, fixed number of side
//! channels. The tag-to-channel mapping is an [`OutputTable`] built once at
//! construction and immutable afterwards:
//!
//! - The side-channel count is checked against a static capacity; declaring
//!   more tags than the capacity fails with
//!   [`ConfigError::TooManySideOutputs`] and no runner is created.
//! - Tags are unique, and no side tag may equal the main tag.
//!
//! The main channel carries both data and watermark markers
//! ([`StreamMessage`]); side channels carry data only.
//!
//! # Example
//!
//! ```rust
//! use tidemark::dofn::OutputTag;
//! use tidemark::output::OutputTable;
//!
//! let table = OutputTable::new(
//!   OutputTag::new("main"),
//!   vec![OutputTag::new("errors")],
//!   5,
//! )
//! .unwrap();
//! assert_eq!(table.side_tags().len(), 1);
//! ```

use std::collections::HashSet;

use crate::dofn::OutputTag;
use crate::error::ConfigError;
use crate::time::{Instant, StreamMessage};
use crate::windowed_value::WindowedValue;

/// A resolved output channel.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Channel {
  /// The main output.
  Main,
  /// The side output at this index.
  Side(usize),
}

/// Immutable tag-to-channel mapping.
#[derive(Clone, Debug)]
pub struct OutputTable {
  main: OutputTag,
  side: Vec<OutputTag>,
}

impl OutputTable {
  /// Builds the table, checking side tags against `capacity`.
  pub fn new(main: OutputTag, side: Vec<OutputTag>, capacity: usize) -> Result<Self, ConfigError> {
    if side.len() > capacity {
      return Err(ConfigError::TooManySideOutputs {
        declared: side.len(),
        capacity,
      });
    }
    let mut seen = HashSet::with_capacity(side.len() + 1);
    seen.insert(main.clone());
    for tag in &side {
      if !seen.insert(tag.clone()) {
        return Err(ConfigError::DuplicateOutputTag(tag.to_string()));
      }
    }
    Ok(Self { main, side })
  }

  /// The main tag.
  pub fn main(&self) -> &OutputTag {
    &self.main
  }

  /// Side tags, in channel order.
  pub fn side_tags(&self) -> &[OutputTag] {
    &self.side
  }

  /// Resolves a tag to its channel.
  pub fn channel(&self, tag: &OutputTag) -> Option<Channel> {
    if *tag == self.main {
      return Some(Channel::Main);
    }
    self.side.iter().position(|t| t == tag).map(Channel::Side)
  }
}

/// Outputs of one bundle (or pass), per channel, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub struct TaggedOutputs<O> {
  main: Vec<StreamMessage<O>>,
  side: Vec<Vec<WindowedValue<O>>>,
  side_tags: Vec<OutputTag>,
}

impl<O> TaggedOutputs<O> {
  /// Creates empty outputs shaped after `table`.
  pub fn new(table: &OutputTable) -> Self {
    Self {
      main: Vec::new(),
      side: table.side_tags().iter().map(|_| Vec::new()).collect(),
      side_tags: table.side_tags().to_vec(),
    }
  }

  pub(crate) fn push(&mut self, channel: Channel, value: WindowedValue<O>) {
    match channel {
      Channel::Main => self.main.push(StreamMessage::Data(value)),
      Channel::Side(index) => {
        if let Some(values) = self.side.get_mut(index) {
          values.push(value);
        }
      }
    }
  }

  pub(crate) fn push_watermark(&mut self, watermark: Instant) {
    self.main.push(StreamMessage::Watermark(watermark));
  }

  /// Main-channel messages: data and watermarks, in order.
  pub fn main(&self) -> &[StreamMessage<O>] {
    &self.main
  }

  /// Data on the main channel.
  pub fn main_values(&self) -> impl Iterator<Item = &WindowedValue<O>> {
    self.main.iter().filter_map(StreamMessage::data)
  }

  /// Watermarks emitted on the main channel.
  pub fn watermarks(&self) -> Vec<Instant> {
    self.main.iter().filter_map(StreamMessage::watermark).collect()
  }

  /// Data on a side channel, by tag.
  pub fn side(&self, tag: &OutputTag) -> Option<&[WindowedValue<O>]> {
    self
      .side_tags
      .iter()
      .position(|t| t == tag)
      .and_then(|index| self.side.get(index))
      .map(Vec::as_slice)
  }

  /// Returns true if nothing was emitted on any channel.
  pub fn is_empty(&self) -> bool {
    self.main.is_empty() && self.side.iter().all(Vec::is_empty)
  }

  /// Consumes the outputs, returning main messages and side values by tag.
  pub fn into_parts(self) -> (Vec<StreamMessage<O>>, Vec<(OutputTag, Vec<WindowedValue<O>>)>) {
    (self.main, self.side_tags.into_iter().zip(self.side).collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tags(n: usize) -> Vec<OutputTag> {
    (0..n).map(|i| OutputTag::new(format!("side-{i}"))).collect()
  }

  #[test]
  fn capacity_is_enforced() {
    assert!(OutputTable::new(OutputTag::new("main"), tags(5), 5).is_ok());
    assert_eq!(
      OutputTable::new(OutputTag::new("main"), tags(6), 5).unwrap_err(),
      ConfigError::TooManySideOutputs {
        declared: 6,
        capacity: 5
      }
    );
  }

  #[test]
  fn duplicate_tags_rejected() {
    let err = OutputTable::new(OutputTag::new("main"), vec![OutputTag::new("main")], 5).unwrap_err();
    assert_eq!(err, ConfigError::DuplicateOutputTag("main".to_string()));
    let err = OutputTable::new(
      OutputTag::new("main"),
      vec![OutputTag::new("a"), OutputTag::new("a")],
      5,
    )
    .unwrap_err();
    assert_eq!(err, ConfigError::DuplicateOutputTag("a".to_string()));
  }

  #[test]
  fn channels_resolve() {
    let table = OutputTable::new(OutputTag::new("main"), tags(2), 5).unwrap();
    assert_eq!(table.channel(&OutputTag::new("main")), Some(Channel::Main));
    assert_eq!(table.channel(&OutputTag::new("side-1")), Some(Channel::Side(1)));
    assert_eq!(table.channel(&OutputTag::new("nope")), None);
  }

  #[test]
  fn outputs_by_channel() {
    let table = OutputTable::new(OutputTag::new("main"), tags(2), 5).unwrap();
    let mut outputs = TaggedOutputs::new(&table);
    assert!(outputs.is_empty());
    outputs.push(Channel::Main, WindowedValue::in_global_window(1));
    outputs.push(Channel::Side(1), WindowedValue::in_global_window(2));
    outputs.push_watermark(Instant::from_millis(10));

    assert_eq!(outputs.main_values().count(), 1);
    assert_eq!(outputs.watermarks(), vec![Instant::from_millis(10)]);
    assert_eq!(outputs.side(&OutputTag::new("side-0")).unwrap().len(), 0);
    assert_eq!(*outputs.side(&OutputTag::new("side-1")).unwrap()[0].value(), 2);
    assert!(outputs.side(&OutputTag::new("main")).is_none());

    let (main, side) = outputs.into_parts();
    assert_eq!(main.len(), 2);
    assert_eq!(side.len(), 2);
  }
}
