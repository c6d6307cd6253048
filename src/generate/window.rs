//! Repetition windows

use std::collections::{HashMap, VecDeque};

use crate::error::{Result, TesseraError};

/// The last `capacity` emitted ids of one sequence
///
/// A FIFO of ids plus an id → occurrence count map, both updated on every
/// push and eviction.
///
/// ```
/// use tessera::LastTokensUnit;
///
/// let mut window = LastTokensUnit::new(2);
/// for id in [5, 6, 5] {
///     window.push(id);
/// }
/// assert_eq!(window.tokens().collect::<Vec<_>>(), vec![6, 5]);
/// assert_eq!(window.count(5), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LastTokensUnit {
    capacity: usize,
    tokens: VecDeque<u32>,
    counts: HashMap<u32, usize>,
}

impl LastTokensUnit {
    /// Empty window holding at most `capacity` ids
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tokens: VecDeque::with_capacity(capacity),
            counts: HashMap::new(),
        }
    }

    /// Append `id`, evicting the oldest id when full
    pub fn push(&mut self, id: u32) {
        if self.capacity == 0 {
            return;
        }
        if self.tokens.len() == self.capacity {
            if let Some(old) = self.tokens.pop_front() {
                if let Some(n) = self.counts.get_mut(&old) {
                    *n -= 1;
                    if *n == 0 {
                        self.counts.remove(&old);
                    }
                }
            }
        }
        self.tokens.push_back(id);
        *self.counts.entry(id).or_insert(0) += 1;
    }

    /// Occurrences of `id` in the window
    #[must_use]
    pub fn count(&self, id: u32) -> usize {
        self.counts.get(&id).copied().unwrap_or(0)
    }

    /// Whether `id` is in the window
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.counts.contains_key(&id)
    }

    /// Distinct ids in the window
    pub fn distinct(&self) -> impl Iterator<Item = u32> + '_ {
        self.counts.keys().copied()
    }

    /// Ids oldest first
    pub fn tokens(&self) -> impl Iterator<Item = u32> + '_ {
        self.tokens.iter().copied()
    }

    /// Number of ids held
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the window is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Maximum number of ids
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget every id
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.counts.clear();
    }
}

/// One [`LastTokensUnit`] per sequence of a batch
#[derive(Debug, Clone, Default)]
pub struct LastTokensManager {
    units: Vec<LastTokensUnit>,
}

impl LastTokensManager {
    /// `batch` empty windows of `capacity`
    #[must_use]
    pub fn new(batch: usize, capacity: usize) -> Self {
        Self {
            units: vec![LastTokensUnit::new(capacity); batch],
        }
    }

    /// Number of sequences
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the batch is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Windows in batch order
    #[must_use]
    pub fn units(&self) -> &[LastTokensUnit] {
        &self.units
    }

    /// Window of sequence `b`
    #[must_use]
    pub fn get(&self, b: usize) -> Option<&LastTokensUnit> {
        self.units.get(b)
    }

    /// Mutable window of sequence `b`
    pub fn get_mut(&mut self, b: usize) -> Option<&mut LastTokensUnit> {
        self.units.get_mut(b)
    }

    /// Push one id per sequence
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `ids` does not have one entry per sequence.
    pub fn push_batch(&mut self, ids: &[u32]) -> Result<()> {
        if ids.len() != self.units.len() {
            return Err(TesseraError::InvalidShape {
                reason: format!("{} ids for a batch of {}", ids.len(), self.units.len()),
            });
        }
        for (unit, &id) in self.units.iter_mut().zip(ids) {
            unit.push(id);
        }
        Ok(())
    }
}
