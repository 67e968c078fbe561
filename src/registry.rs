// registry.rs - generational session arena and the bounded connecting table

use ahash::AHashMap;

/// Stable reference to an arena slot. A handle stops resolving once its
/// slot is removed, even if the slot is later reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena with O(1) insert and tombstoning remove.
#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, value: T) -> Handle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Tombstones the slot; the handle and any copies of it go stale.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    value,
                )
            })
        })
    }
}

/// Established sessions addressed by node id.
#[derive(Debug)]
pub struct Registry<T> {
    arena: Arena<T>,
    by_node: AHashMap<u64, Handle>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            by_node: AHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Registers `value` under `node_id`, returning whatever it replaced.
    pub fn insert(&mut self, node_id: u64, value: T) -> (Handle, Option<T>) {
        let replaced = self
            .by_node
            .remove(&node_id)
            .and_then(|old| self.arena.remove(old));
        let handle = self.arena.insert(value);
        self.by_node.insert(node_id, handle);
        (handle, replaced)
    }

    pub fn handle(&self, node_id: u64) -> Option<Handle> {
        self.by_node.get(&node_id).copied()
    }

    pub fn get(&self, node_id: u64) -> Option<&T> {
        self.arena.get(self.handle(node_id)?)
    }

    pub fn get_mut(&mut self, node_id: u64) -> Option<&mut T> {
        let handle = self.handle(node_id)?;
        self.arena.get_mut(handle)
    }

    pub fn resolve(&self, handle: Handle) -> Option<&T> {
        self.arena.get(handle)
    }

    pub fn remove(&mut self, node_id: u64) -> Option<T> {
        let handle = self.by_node.remove(&node_id)?;
        self.arena.remove(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.by_node
            .iter()
            .filter_map(|(node, handle)| self.arena.get(*handle).map(|value| (*node, value)))
    }

    pub fn node_ids(&self) -> Vec<u64> {
        self.by_node.keys().copied().collect()
    }
}

/// Fixed ring of pending handshakes addressed by 16-bit connect id.
///
/// Inserting always takes the slot under the cursor, so once the ring has
/// wrapped the oldest pending entry is overwritten.
#[derive(Debug)]
pub struct ConnectingTable<T> {
    slots: Vec<Option<T>>,
    cursor: usize,
}

impl<T> ConnectingTable<T> {
    /// `capacity` is clamped to `1..=65536` so every slot has a connect id.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, usize::from(u16::MAX) + 1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Claims the next slot and returns its connect id plus any overwritten entry.
    pub fn insert(&mut self, value: T) -> (u16, Option<T>) {
        self.insert_with(|_| value)
    }

    /// Like [`insert`](Self::insert) for values that need their own connect id.
    pub fn insert_with(&mut self, make: impl FnOnce(u16) -> T) -> (u16, Option<T>) {
        match self.try_insert_with(|id| Ok::<_, std::convert::Infallible>(make(id))) {
            Ok(inserted) => inserted,
            Err(never) => match never {},
        }
    }

    /// Builds the value for the next connect id; the cursor only moves when
    /// `make` succeeds, so a rejected handshake overwrites nothing.
    pub fn try_insert_with<E>(
        &mut self,
        make: impl FnOnce(u16) -> Result<T, E>,
    ) -> Result<(u16, Option<T>), E> {
        let id = self.cursor as u16;
        let value = make(id)?;
        self.cursor = (self.cursor + 1) % self.slots.len();
        let evicted = self.slots[usize::from(id)].replace(value);
        Ok((id, evicted))
    }

    pub fn get(&self, id: u16) -> Option<&T> {
        self.slots.get(usize::from(id)).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut T> {
        self.slots.get_mut(usize::from(id)).and_then(Option::as_mut)
    }

    pub fn remove(&mut self, id: u16) -> Option<T> {
        self.slots.get_mut(usize::from(id)).and_then(Option::take)
    }

    /// Removes and returns every entry matching `expired`.
    pub fn drain_where(&mut self, mut expired: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(&mut expired) {
                if let Some(value) = slot.take() {
                    out.push(value);
                }
            }
        }
        out
    }
}
