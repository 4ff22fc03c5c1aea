//! Unordered 2-combinations over a fixed, ordered list.

use std::iter::FusedIterator;

/// Number of unordered pairs in a batch of `n` items.
pub const fn pair_count(n: usize) -> usize {
    if n < 2 { 0 } else { n * (n - 1) / 2 }
}

/// Lazily yields every `(items[i], items[j])` with `i < j` exactly once, in row-major order.
///
/// Callers impose their own total order on `items` beforehand; the iterator itself never reorders.
#[derive(Debug, Clone)]
pub struct Pairs<'a, T> {
    items: &'a [T],
    i: usize,
    j: usize,
}

impl<'a, T> Pairs<'a, T> {
    pub fn new(items: &'a [T]) -> Self {
        Self { items, i: 0, j: 1 }
    }
}

impl<'a, T: Copy> Iterator for Pairs<'a, T> {
    type Item = (T, T);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.items.len();
        if self.j >= n {
            self.i += 1;
            self.j = self.i + 1;
        }

        if self.j >= n {
            return None;
        }

        let pair = (self.items[self.i], self.items[self.j]);
        self.j += 1;

        Some(pair)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.items.len();
        // what's left in row `i` plus every row after it
        let remaining = n.saturating_sub(self.j) + pair_count(n.saturating_sub(self.i + 1));

        (remaining, Some(remaining))
    }
}

impl<T: Copy> ExactSizeIterator for Pairs<'_, T> {}
impl<T: Copy> FusedIterator for Pairs<'_, T> {}
