//! Batch sources and transparent epoch cycling

use crate::error::{Error, Result};

/// Anything that can hand out training batches in a stable order
pub trait BatchSource {
    /// Batch type produced by this source
    type Batch;

    /// Next batch in the current pass, `None` once the pass is exhausted
    fn next_batch(&mut self) -> Result<Option<Self::Batch>>;

    /// Restart from the beginning of the dataset
    fn reset(&mut self) -> Result<()>;

    /// Number of batches in one full pass
    fn len(&self) -> usize;

    /// True when the source holds no batches at all
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Wraps a [`BatchSource`] so exhaustion restarts the source instead of
/// ending iteration. The training loop only sees an endless stream plus a
/// flag marking where each new pass begins.
pub struct CyclingSource<S: BatchSource> {
    inner: S,
}

impl<S: BatchSource> CyclingSource<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Pull the next batch, restarting the underlying source when a pass
    /// ends. The returned flag is true when this batch opens a new pass.
    pub fn next_cycled(&mut self) -> Result<(S::Batch, bool)> {
        if let Some(batch) = self.inner.next_batch()? {
            return Ok((batch, false));
        }
        self.inner.reset()?;
        match self.inner.next_batch()? {
            Some(batch) => Ok((batch, true)),
            None => Err(Error::config("dataset is empty, nothing to train on")),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// In-memory source over a fixed list of batches, used by the trainers for
/// pre-encoded data and by tests
pub struct VecSource<T: Clone> {
    items: Vec<T>,
    cursor: usize,
}

impl<T: Clone> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items, cursor: 0 }
    }
}

impl<T: Clone> BatchSource for VecSource<T> {
    type Batch = T;

    fn next_batch(&mut self) -> Result<Option<T>> {
        match self.items.get(self.cursor) {
            Some(item) => {
                self.cursor += 1;
                Ok(Some(item.clone()))
            }
            None => Ok(None),
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
