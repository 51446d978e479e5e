use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Typed index into a [`Pool`].
///
/// Handles are small, copyable, and generation-checked: releasing a slot
/// bumps its generation, so stale handles resolve to `None` instead of
/// aliasing whatever lives in the slot next.
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<T>,
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("slot", &self.slot)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<T> Handle<T> {
    pub(crate) fn new(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }

    /// A default-constructed handle has generation 0, which no live slot
    /// ever carries.
    pub fn valid(&self) -> bool {
        self.generation != 0
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self {
            slot: 0,
            generation: 0,
            phantom: PhantomData,
        }
    }
}

/// Generational slot arena. Consumers hold [`Handle`]s, never references,
/// so the arena can grow without invalidating anyone.
pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![1; initial_size],
        };

        p.empty = (0..initial_size).rev().collect();
        p.items.resize_with(initial_size, || None);
        p
    }

    /// Insert an item, growing the arena if needed. Returns `None` only once
    /// every representable slot (u16) is occupied.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let slot = match self.empty.pop() {
            Some(s) => s,
            None => {
                let old_len = self.items.len();
                if old_len > u16::MAX as usize {
                    return None;
                }
                let new_len = (old_len * 2).clamp(64, u16::MAX as usize + 1);
                self.items.resize_with(new_len, || None);
                self.generation.resize(new_len, 1);
                for idx in (old_len + 1..new_len).rev() {
                    self.empty.push(idx);
                }
                old_len
            }
        };

        self.items[slot] = Some(item);
        Some(Handle::new(slot as u16, self.generation[slot]))
    }

    /// Release a slot. The item is dropped and the slot's generation bumps,
    /// invalidating every outstanding handle to it.
    pub fn release(&mut self, item: Handle<T>) {
        let slot = item.slot as usize;
        if slot >= self.items.len() || self.generation[slot] != item.generation {
            return;
        }
        self.items[slot] = None;
        // Generation 0 is reserved for the null handle.
        self.generation[slot] = self.generation[slot].checked_add(1).unwrap_or(1);
        self.empty.push(slot);
    }

    /// Remove and return the item, invalidating its handle.
    pub fn take(&mut self, item: Handle<T>) -> Option<T> {
        let slot = item.slot as usize;
        if slot >= self.items.len() || self.generation[slot] != item.generation {
            return None;
        }
        let taken = self.items[slot].take();
        if taken.is_some() {
            self.generation[slot] = self.generation[slot].checked_add(1).unwrap_or(1);
            self.empty.push(slot);
        }
        taken
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        let slot = item.slot as usize;
        if slot < self.items.len() && self.generation[slot] == item.generation {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        let slot = item.slot as usize;
        if slot < self.items.len() && self.generation[slot] == item.generation {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.len() - self.empty.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each_occupied<F>(&self, mut func: F)
    where
        F: FnMut(&T),
    {
        for item in self.items.iter().flatten() {
            func(item);
        }
    }

    pub fn for_each_occupied_mut<F>(&mut self, mut func: F)
    where
        F: FnMut(&mut T),
    {
        for item in self.items.iter_mut().flatten() {
            func(item);
        }
    }

    /// Drain every occupied slot, invalidating all outstanding handles.
    pub fn drain_occupied<F>(&mut self, mut func: F)
    where
        F: FnMut(T),
    {
        for slot in 0..self.items.len() {
            if let Some(item) = self.items[slot].take() {
                self.generation[slot] = self.generation[slot].checked_add(1).unwrap_or(1);
                self.empty.push(slot);
                func(item);
            }
        }
    }
}
