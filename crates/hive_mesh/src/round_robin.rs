//! Insertion-ordered set with a cyclic cursor, used to spread load over units.

/// A set that hands out its members one after another, forever.
///
/// Mutations never reset the cursor more than needed: removing a member
/// before the cursor shifts it back by one, and members appended while a
/// cycle is in progress are reached before the cycle wraps.
#[derive(Debug, Clone)]
pub struct RoundRobinSet<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> Default for RoundRobinSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
        }
    }
}

impl<T: PartialEq + Clone> RoundRobinSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `item` unless an equal item is already present. Returns whether
    /// it was added.
    pub fn insert(&mut self, item: T) -> bool {
        if self.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Remove `item`. Returns whether it was present.
    pub fn remove(&mut self, item: &T) -> bool {
        let Some(index) = self.items.iter().position(|x| x == item) else {
            return false;
        };
        self.items.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        true
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    /// The next member in cyclic order, or `None` when the set is empty.
    pub fn next(&mut self) -> Option<T> {
        if self.items.is_empty() {
            self.cursor = 0;
            return None;
        }
        if self.cursor >= self.items.len() {
            self.cursor = 0;
        }
        let item = self.items[self.cursor].clone();
        self.cursor += 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
