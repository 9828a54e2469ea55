use std::collections::VecDeque;

/// Bounded first-in first-out queue.
///
/// Used for every hand-off between units that do not share a clock edge,
/// e.g. transfer requests from the compute clock to the external-memory clock.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fifo<T> {
    inner: VecDeque<T>,
    max_size: Option<usize>,
}

impl<T> std::iter::IntoIterator for Fifo<T> {
    type Item = T;
    type IntoIter = std::collections::vec_deque::IntoIter<Self::Item>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<T> std::fmt::Display for Fifo<T>
where
    T: std::fmt::Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Fifo({:>2}/{:<2}){:?}",
            self.inner.len(),
            self.max_size
                .map(|max| max.to_string())
                .as_deref()
                .unwrap_or(""),
            self.inner
                .iter()
                .map(std::string::ToString::to_string)
                .collect::<Vec<_>>()
        )
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> Fifo<T> {
    #[must_use]
    pub fn new(max_size: Option<usize>) -> Self {
        Self {
            inner: VecDeque::new(),
            max_size,
        }
    }

    #[must_use]
    pub fn iter(&self) -> std::collections::vec_deque::Iter<T> {
        self.inner.iter()
    }

    /// Enqueue a value.
    ///
    /// # Panics
    /// If the queue is full. Producers must check `full()` first.
    pub fn enqueue(&mut self, value: T) {
        assert!(
            !self.full(),
            "enqueue into full fifo (max size={:?})",
            self.max_size
        );
        self.inner.push_back(value);
    }

    /// Enqueue a value unless the queue is full.
    ///
    /// Returns the value back if it did not fit.
    pub fn try_enqueue(&mut self, value: T) -> Result<(), T> {
        if self.full() {
            return Err(value);
        }
        self.inner.push_back(value);
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    #[must_use]
    pub fn first(&self) -> Option<&T> {
        self.inner.front()
    }

    #[must_use]
    pub fn full(&self) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() >= max,
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[must_use]
    pub fn can_fit(&self, n: usize) -> bool {
        match self.max_size {
            Some(max) => self.inner.len() + n <= max,
            None => true,
        }
    }

    pub fn drain(&mut self) -> std::collections::vec_deque::Drain<'_, T> {
        self.inner.drain(..)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
