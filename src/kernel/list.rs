//! Intrusive ownership list.
//!
//! Entries live in an [`EntryArena`] and are addressed by generational
//! [`EntryId`] handles. A [`LinkedListSet`] only stores head/tail indices;
//! each entry carries its own prev/next indices, the id of the list it is
//! linked into and the [`OwnerId`] it was created for. Every mutation checks
//! that binding and reports misuse as a [`ListError`].
//!
//! There is no locking here: arenas and lists are always mutated under the
//! lock of the kernel object that owns them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Identity of the kernel object owning a list and its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListId(u64);

impl ListId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Generational handle to an arena entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    /// A handle that never resolves to a live entry.
    pub const fn dangling() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
        }
    }
}

/// Ownership list misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListError {
    #[error("entry {0:?} is stale or was never inserted")]
    StaleEntry(EntryId),

    #[error("entry {0:?} is already linked into a list")]
    AlreadyLinked(EntryId),

    #[error("entry {0:?} is not in this list")]
    NotInList(EntryId),

    #[error("entry owner {actual:?} does not match list owner {expected:?}")]
    WrongOwner { expected: OwnerId, actual: OwnerId },

    #[error("entry {0:?} is still linked and cannot be released")]
    StillLinked(EntryId),
}

#[derive(Debug, Clone, Copy)]
struct Link {
    list: ListId,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Debug)]
struct Entry<T> {
    value: T,
    owner: OwnerId,
    link: Option<Link>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Backing storage for list entries.
#[derive(Debug)]
pub struct EntryArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> EntryArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Create a detached entry bound to `owner`.
    pub fn insert(&mut self, owner: OwnerId, value: T) -> EntryId {
        let entry = Entry {
            value,
            owner,
            link: None,
        };
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            return EntryId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        EntryId {
            index,
            generation: 0,
        }
    }

    /// Release a detached entry, returning its value.
    pub fn remove(&mut self, id: EntryId) -> Result<T, ListError> {
        if self.entry(id)?.link.is_some() {
            return Err(ListError::StillLinked(id));
        }
        let slot = &mut self.slots[id.index as usize];
        let entry = slot.entry.take().ok_or(ListError::StaleEntry(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Ok(entry.value)
    }

    pub fn get(&self, id: EntryId) -> Option<&T> {
        self.entry(id).ok().map(|e| &e.value)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        self.entry_mut(id).ok().map(|e| &mut e.value)
    }

    pub fn owner(&self, id: EntryId) -> Option<OwnerId> {
        self.entry(id).ok().map(|e| e.owner)
    }

    pub fn is_linked(&self, id: EntryId) -> bool {
        self.entry(id).map(|e| e.link.is_some()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entry(&self, id: EntryId) -> Result<&Entry<T>, ListError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(ListError::StaleEntry(id))
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut Entry<T>, ListError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(ListError::StaleEntry(id))
    }

    fn id_at(&self, index: u32) -> EntryId {
        let generation = self
            .slots
            .get(index as usize)
            .map(|slot| slot.generation)
            .unwrap_or(u32::MAX);
        EntryId { index, generation }
    }

    fn link_at(&self, index: u32) -> Option<&Link> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .and_then(|entry| entry.link.as_ref())
    }

    fn link_at_mut(&mut self, index: u32) -> Option<&mut Link> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.entry.as_mut())
            .and_then(|entry| entry.link.as_mut())
    }
}

impl<T> Default for EntryArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Doubly linked set over arena entries sharing one owner.
#[derive(Debug)]
pub struct LinkedListSet {
    id: ListId,
    owner: OwnerId,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl LinkedListSet {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            id: ListId::next(),
            owner,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a detached entry owned by this list's owner.
    pub fn add<T>(&mut self, arena: &mut EntryArena<T>, id: EntryId) -> Result<(), ListError> {
        let entry = arena.entry_mut(id)?;
        if entry.link.is_some() {
            return Err(ListError::AlreadyLinked(id));
        }
        if entry.owner != self.owner {
            return Err(ListError::WrongOwner {
                expected: self.owner,
                actual: entry.owner,
            });
        }
        entry.link = Some(Link {
            list: self.id,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => {
                if let Some(link) = arena.link_at_mut(tail) {
                    link.next = Some(id.index);
                }
            }
            None => self.head = Some(id.index),
        }
        self.tail = Some(id.index);
        self.len += 1;
        Ok(())
    }

    /// Unlink an entry currently in this list.
    pub fn remove<T>(&mut self, arena: &mut EntryArena<T>, id: EntryId) -> Result<(), ListError> {
        let entry = arena.entry_mut(id)?;
        let link = match entry.link.take() {
            Some(link) if link.list == self.id => link,
            other => {
                entry.link = other;
                return Err(ListError::NotInList(id));
            }
        };

        match link.prev {
            Some(prev) => {
                if let Some(prev_link) = arena.link_at_mut(prev) {
                    prev_link.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next_link) = arena.link_at_mut(next) {
                    next_link.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }
        self.len -= 1;
        Ok(())
    }

    pub fn contains<T>(&self, arena: &EntryArena<T>, id: EntryId) -> bool {
        arena
            .entry(id)
            .ok()
            .and_then(|e| e.link)
            .map(|link| link.list == self.id)
            .unwrap_or(false)
    }

    /// Read-only snapshot of the chain, head first.
    pub fn copy<T>(&self, arena: &EntryArena<T>) -> Vec<EntryId> {
        let mut chain = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(index) = cursor {
            chain.push(arena.id_at(index));
            cursor = arena.link_at(index).and_then(|link| link.next);
        }
        chain
    }

    /// Detach every entry and return the chain that was linked.
    pub fn purge<T>(&mut self, arena: &mut EntryArena<T>) -> Vec<EntryId> {
        let chain = self.copy(arena);
        for id in &chain {
            if let Ok(entry) = arena.entry_mut(*id) {
                entry.link = None;
            }
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
        chain
    }

    pub fn iter<'a, T>(&self, arena: &'a EntryArena<T>) -> impl Iterator<Item = (EntryId, &'a T)> + 'a
    where
        T: 'a,
    {
        self.copy(arena)
            .into_iter()
            .filter_map(move |id| arena.get(id).map(|value| (id, value)))
    }
}

/// Ownership list that silently refuses entries equal to an existing member.
pub struct ComparatorLinkedListSet<T> {
    list: LinkedListSet,
    is_equal: fn(&T, &T) -> bool,
}

impl<T> fmt::Debug for ComparatorLinkedListSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComparatorLinkedListSet")
            .field("list", &self.list)
            .finish()
    }
}

impl<T> ComparatorLinkedListSet<T> {
    pub fn new(owner: OwnerId, is_equal: fn(&T, &T) -> bool) -> Self {
        Self {
            list: LinkedListSet::new(owner),
            is_equal,
        }
    }

    /// Returns `Ok(false)` without linking when an equal entry is present.
    /// An entry already linked in any list is rejected first.
    pub fn add(&mut self, arena: &mut EntryArena<T>, id: EntryId) -> Result<bool, ListError> {
        let candidate = arena.get(id).ok_or(ListError::StaleEntry(id))?;
        if arena.is_linked(id) {
            return Err(ListError::AlreadyLinked(id));
        }
        let duplicate = self
            .list
            .iter(arena)
            .any(|(other, value)| other != id && (self.is_equal)(value, candidate));
        if duplicate {
            return Ok(false);
        }
        self.list.add(arena, id)?;
        Ok(true)
    }

    pub fn remove(&mut self, arena: &mut EntryArena<T>, id: EntryId) -> Result<(), ListError> {
        self.list.remove(arena, id)
    }

    pub fn purge(&mut self, arena: &mut EntryArena<T>) -> Vec<EntryId> {
        self.list.purge(arena)
    }

    pub fn copy(&self, arena: &EntryArena<T>) -> Vec<EntryId> {
        self.list.copy(arena)
    }

    pub fn contains(&self, arena: &EntryArena<T>, id: EntryId) -> bool {
        self.list.contains(arena, id)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
