/// Items stored in a [`SortedSlots`] table expose the key they are ordered by.
pub trait Keyed {
    /// Ordering key, smallest first.
    type Key: Ord + Copy;

    /// Key of this item.
    fn key(&self) -> Self::Key;
}

/// A fixed capacity table kept sorted ascending by key. Items with equal
/// keys stay in insertion order, and the table never grows past the
/// capacity given at construction.
#[derive(Debug, Clone)]
pub struct SortedSlots<T> {
    slots: Vec<T>,
    capacity: usize,
}

impl<T: Keyed> SortedSlots<T> {
    /// Create an empty table able to hold `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Earliest item, if any.
    pub fn first(&self) -> Option<&T> {
        self.slots.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Insert `item` in front of the first slot whose key is strictly
    /// greater, shifting every later slot one place toward the end.
    /// Returns the index it landed on, or hands the item back untouched
    /// when the table is full.
    pub fn insert_sorted(&mut self, item: T) -> Result<usize, T> {
        if self.is_full() {
            return Err(item);
        }
        let key = item.key();
        let index = self
            .slots
            .iter()
            .position(|slot| slot.key() > key)
            .unwrap_or(self.slots.len());
        self.slots.insert(index, item);
        Ok(index)
    }

    /// Take the earliest item and compact the rest toward the front.
    pub fn remove_front(&mut self) -> Option<T> {
        if self.slots.is_empty() {
            None
        } else {
            Some(self.slots.remove(0))
        }
    }

    /// Remove every slot up to and including `index`, compacting the
    /// survivors toward the front. Out of range indexes clear the table.
    pub fn remove_through(&mut self, index: usize) -> std::vec::Drain<'_, T> {
        let end = (index + 1).min(self.slots.len());
        self.slots.drain(..end)
    }

    /// Index of the last item matching `predicate`, scanning from the end.
    pub fn rposition<P>(&self, predicate: P) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        self.slots.iter().rposition(predicate)
    }
}
