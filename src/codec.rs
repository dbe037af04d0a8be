//! # Key Codecs and Structural Keys
//!
//! Grouping, timers and state are addressed by a key's **byte encoding**, not
//! by the key type's own `Eq`/`Hash`. Two keys are the same key iff their
//! encodings under the declared [`Coder`] are byte-equal. This lets keys
//! without well-behaved equality (floats, maps with unstable iteration order
//! wrapped in ordered encoders, foreign types) be grouped correctly.
//!
//! [`StructuralKey`] is the encoded form. Its structural hash is also the
//! routing hash used to pick a destination shard when work is distributed.
//!
//! ## Usage
//!
//! ```rust
//! use tidemark::codec::{JsonCoder, StructuralKey};
//!
//! let coder = JsonCoder::<(String, u32)>::new();
//! let a = StructuralKey::of(&("user".to_string(), 7), &coder).unwrap();
//! let b = StructuralKey::of(&("user".to_string(), 7), &coder).unwrap();
//! assert_eq!(a, b);
//! assert!(a.shard(4) < 4);
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{CodecError, InternalError};

/// Encodes values of `T` to bytes.
///
/// The encoding must be deterministic: equal logical keys must always produce
/// the same bytes.
pub trait Coder<T: ?Sized>: Send + Sync {
    /// Encodes a value.
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Name used in error messages.
    fn name(&self) -> &str;
}

/// Coder that encodes any `Serialize` type as JSON.
pub struct JsonCoder<T: ?Sized> {
    _marker: PhantomData<fn(&T)>,
}

impl<T: ?Sized> JsonCoder<T> {
    /// Creates a JSON coder.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: ?Sized> Default for JsonCoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for JsonCoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + ?Sized> Coder<T> for JsonCoder<T> {
    fn encode(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn name(&self) -> &str {
        "JsonCoder"
    }
}

/// Coder for UTF-8 strings: the encoding is the string's bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Utf8Coder;

impl Coder<str> for Utf8Coder {
    fn encode(&self, value: &str) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn name(&self) -> &str {
        "Utf8Coder"
    }
}

impl Coder<String> for Utf8Coder {
    fn encode(&self, value: &String) -> Result<Vec<u8>, CodecError> {
        Ok(value.as_bytes().to_vec())
    }

    fn name(&self) -> &str {
        "Utf8Coder"
    }
}

/// A key identified by its encoded bytes.
///
/// Equality, ordering and hashing are defined on the encoding only.
#[derive(Clone)]
pub struct StructuralKey {
    encoded: Bytes,
    hash: u64,
}

impl StructuralKey {
    /// Wraps an already-encoded key.
    pub fn from_encoded(encoded: impl Into<Bytes>) -> Self {
        let encoded = encoded.into();
        let mut hasher = DefaultHasher::new();
        encoded.as_ref().hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            encoded,
        }
    }

    /// Encodes `key` with `coder`.
    ///
    /// # Errors
    ///
    /// Returns [`InternalError::KeyEncoding`] naming the key and codec if the
    /// coder fails.
    pub fn of<K, C>(key: &K, coder: &C) -> Result<Self, InternalError>
    where
        K: fmt::Debug + ?Sized,
        C: Coder<K> + ?Sized,
    {
        coder
            .encode(key)
            .map(Self::from_encoded)
            .map_err(|source| InternalError::KeyEncoding {
                key: format!("{:?}", key),
                codec: coder.name().to_string(),
                source,
            })
    }

    /// Returns the encoded bytes.
    #[inline]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Returns the structural hash of the encoding.
    #[inline]
    pub fn structural_hash(&self) -> u64 {
        self.hash
    }

    /// Returns the shard this key routes to among `total_shards`.
    ///
    /// `total_shards` of zero is treated as one.
    pub fn shard(&self, total_shards: u32) -> u32 {
        (self.hash % u64::from(total_shards.max(1))) as u32
    }
}

impl PartialEq for StructuralKey {
    fn eq(&self, other: &Self) -> bool {
        self.encoded == other.encoded
    }
}

impl Eq for StructuralKey {}

impl Hash for StructuralKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encoded.hash(state);
    }
}

impl PartialOrd for StructuralKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StructuralKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.encoded.cmp(&other.encoded)
    }
}

impl fmt::Debug for StructuralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StructuralKey").field(&self.encoded).finish()
    }
}
