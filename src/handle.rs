//! Typed handles and their opaque integer representation.
//!
//! A [`Handle<T>`] names one slot in the [`HandleTable<T>`](crate::registry::HandleTable) that
//! holds objects of type `T`. When it crosses the boundary it is packed into a single `u64`:
//!
//! ```text
//!  63        56 55                    32 31                               0
//! +------------+------------------------+----------------------------------+
//! |    kind    |       generation       |              index               |
//! +------------+------------------------+----------------------------------+
//! ```
//!
//! The kind tag is never zero, so `0` is never a valid token and can be used by callers as a
//! "no handle" sentinel.
use std::{fmt, hash::Hash, marker::PhantomData};

use derive_more::Display;
use serde::Serialize;

use crate::{Error, Result};

/// Kinds of objects that can be referenced by a handle.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HandleKind {
    /// [`Options`](crate::Options).
    #[display("options")]
    Options = 1,
    /// [`Client`](crate::Client).
    #[display("client")]
    Client = 2,
    /// [`UserContext`](crate::UserContext).
    #[display("user")]
    User = 3,
}

impl HandleKind {
    fn from_tag(tag: u8) -> Option<HandleKind> {
        match tag {
            1 => Some(HandleKind::Options),
            2 => Some(HandleKind::Client),
            3 => Some(HandleKind::User),
            _ => None,
        }
    }
}

/// Implemented by every type that can live in a handle table.
pub trait HandleTarget: Send + Sync + 'static {
    /// Kind tag embedded into the tokens of this type.
    const KIND: HandleKind;
}

const INDEX_BITS: u32 = 32;
const GENERATION_BITS: u32 = 24;
const KIND_SHIFT: u32 = INDEX_BITS + GENERATION_BITS;

/// Generations wrap within this mask.
pub(crate) const GENERATION_MASK: u32 = (1 << GENERATION_BITS) - 1;

/// A typed, generation-checked reference to an object owned by a
/// [`Registry`](crate::Registry).
///
/// Handles are `Copy`: holding a copy after release is harmless, because the slot generation
/// no longer matches and every lookup fails with [`Error::InvalidHandle`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

/// Handle to a [`Client`](crate::Client).
pub type ClientHandle = Handle<crate::Client>;
/// Handle to [`Options`](crate::Options).
pub type OptionsHandle = Handle<crate::Options>;
/// Handle to a [`UserContext`](crate::UserContext).
pub type UserHandle = Handle<crate::UserContext>;

impl<T: HandleTarget> Handle<T> {
    pub(crate) fn new(index: u32, generation: u32) -> Handle<T> {
        Handle {
            index,
            generation: generation & GENERATION_MASK,
            _marker: PhantomData,
        }
    }

    pub(crate) fn index(self) -> u32 {
        self.index
    }

    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Pack the handle into the opaque token handed out across the boundary.
    pub fn to_raw(self) -> u64 {
        ((T::KIND as u64) << KIND_SHIFT)
            | ((self.generation as u64) << INDEX_BITS)
            | self.index as u64
    }

    /// Unpack an opaque token.
    ///
    /// Only checks the kind tag; whether the slot is still live is checked by the registry.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if `raw` is zero or was minted for another kind.
    pub fn from_raw(raw: u64) -> Result<Handle<T>> {
        let tag = (raw >> KIND_SHIFT) as u8;
        if HandleKind::from_tag(tag) != Some(T::KIND) {
            return Err(Error::InvalidHandle { kind: T::KIND });
        }

        let generation = ((raw >> INDEX_BITS) as u32) & GENERATION_MASK;
        let index = raw as u32;
        Ok(Handle::new(index, generation))
    }
}

// Manual impls so that `T` is not required to implement these traits.

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T: HandleTarget> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", T::KIND, self.index, self.generation)
    }
}

impl<T: HandleTarget> From<Handle<T>> for u64 {
    fn from(value: Handle<T>) -> u64 {
        value.to_raw()
    }
}

impl<T: HandleTarget> log::kv::ToValue for Handle<T> {
    fn to_value(&self) -> log::kv::Value {
        log::kv::Value::from_debug(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Client, Options, UserContext};

    #[test]
    fn raw_roundtrip_preserves_index_and_generation() {
        let handle = Handle::<Options>::new(42, 7);
        let back = Handle::<Options>::from_raw(handle.to_raw()).unwrap();
        assert_eq!(back, handle);
        assert_eq!(back.index(), 42);
        assert_eq!(back.generation(), 7);
    }

    #[test]
    fn raw_token_is_never_zero() {
        assert_ne!(Handle::<Client>::new(0, 0).to_raw(), 0);
        assert_ne!(Handle::<UserContext>::new(0, 0).to_raw(), 0);
    }

    #[test]
    fn zero_is_rejected() {
        assert!(matches!(
            Handle::<Client>::from_raw(0),
            Err(Error::InvalidHandle {
                kind: HandleKind::Client
            })
        ));
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let raw = Handle::<Options>::new(1, 1).to_raw();
        assert!(matches!(
            Handle::<Client>::from_raw(raw),
            Err(Error::InvalidHandle {
                kind: HandleKind::Client
            })
        ));
        assert!(Handle::<UserContext>::from_raw(raw).is_err());
    }

    #[test]
    fn unknown_kind_tag_is_rejected() {
        let raw = (0xffu64 << KIND_SHIFT) | 5;
        assert!(Handle::<Options>::from_raw(raw).is_err());
    }

    #[test]
    fn generation_is_masked() {
        let handle = Handle::<Options>::new(3, GENERATION_MASK + 2);
        assert_eq!(handle.generation(), 1);
    }
}
