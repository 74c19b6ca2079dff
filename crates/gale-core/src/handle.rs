//! Opaque integer handles and the arena that resolves them
//!
//! Every server and WebSocket endpoint crossing the embedding boundary is
//! addressed by a 32-bit handle, never a pointer. A handle packs the table
//! kind, the slot's generation at allocation time, and the slot index, with
//! the sign bit clear; the boundary's failure sentinel is any negative value
//! (`Handle::INVALID`). Releasing a slot bumps its generation, so a handle
//! held across a release resolves to nothing instead of the slot's next
//! occupant.

use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

const INDEX_BITS: u32 = 16;
const INDEX_MASK: i32 = (1 << INDEX_BITS) - 1;
const GEN_BITS: u32 = 13;
const GEN_MASK: u16 = (1 << GEN_BITS) - 1;
const KIND_SHIFT: u32 = INDEX_BITS + GEN_BITS;

/// Which table a handle belongs to. Kinds start at 1 so a valid handle is
/// always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum HandleKind {
    Server = 1,
    Endpoint = 2,
}

/// Opaque reference to a live server or endpoint object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(i32);

impl Handle {
    /// The boundary's invalid-handle sentinel.
    pub const INVALID: Handle = Handle(-1);

    /// Raw integer form, as passed across the embedding boundary.
    pub fn raw(self) -> i32 {
        self.0
    }

    /// Reconstruct a handle received from the embedding boundary.
    pub fn from_raw(raw: i32) -> Handle {
        Handle(raw)
    }

    /// False for the invalid sentinel and anything else that can never
    /// name a live object.
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }

    pub(crate) fn pack(kind: HandleKind, generation: u16, index: u16) -> Handle {
        Handle(((kind as i32) << KIND_SHIFT) | ((generation as i32) << INDEX_BITS) | index as i32)
    }

    fn kind(self) -> u8 {
        (self.0 >> KIND_SHIFT) as u8
    }

    fn generation(self) -> u16 {
        ((self.0 >> INDEX_BITS) as u16) & GEN_MASK
    }

    fn index(self) -> u16 {
        (self.0 & INDEX_MASK) as u16
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Slot<T> {
    generation: u16,
    value: Option<Arc<T>>,
}

struct TableInner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
}

/// Arena of live objects addressed by generation-tagged handles.
pub(crate) struct HandleTable<T> {
    kind: HandleKind,
    inner: RwLock<TableInner<T>>,
}

impl<T> HandleTable<T> {
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store `value` and return its handle. Freed slots are reused with a
    /// bumped generation, so the returned integer never collides with a
    /// previously released handle.
    pub fn allocate(&self, value: Arc<T>) -> Result<Handle> {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index as usize,
            None => {
                if inner.slots.len() > INDEX_MASK as usize {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "handle table exhausted",
                    )));
                }
                inner.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                inner.slots.len() - 1
            }
        };
        let slot = &mut inner.slots[index];
        slot.value = Some(value);
        Ok(Handle::pack(self.kind, slot.generation, index as u16))
    }

    /// Resolve a handle to its object, or `None` if the handle is stale,
    /// released, or from a different table.
    pub fn resolve(&self, handle: Handle) -> Option<Arc<T>> {
        if !handle.is_valid() || handle.kind() != self.kind as u8 {
            return None;
        }
        let inner = self.inner.read();
        let slot = inner.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Invalidate a handle and return the object it referenced. The slot's
    /// generation is bumped before it goes back on the free list.
    pub fn release(&self, handle: Handle) -> Option<Arc<T>> {
        if !handle.is_valid() || handle.kind() != self.kind as u8 {
            return None;
        }
        let mut inner = self.inner.write();
        let index = handle.index();
        let slot = inner.slots.get_mut(index as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = (slot.generation + 1) & GEN_MASK;
        inner.free.push(index);
        Some(value)
    }
}
