/// Iterator that can return to a marked position.
///
/// `mark_prev` marks the element most recently returned by `next`;
/// `mark_next` marks the element the next call to `next` would return.
/// `reset` moves the cursor back to the mark, so the marked element is
/// produced again. Without a mark, `reset` does nothing. Marking again
/// replaces the previous mark.
pub trait BacktrackingIterator: Iterator {
    fn mark_prev(&mut self);

    fn mark_next(&mut self);

    fn reset(&mut self);
}

/// Backtracking iterator over an owned vector.
#[derive(Debug, Clone)]
pub struct VecBacktrackingIterator<T> {
    items: Vec<T>,
    next: usize,
    prev: Option<usize>,
    marked: Option<usize>,
}

impl<T: Clone> VecBacktrackingIterator<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next: 0,
            prev: None,
            marked: None,
        }
    }
}

impl<T: Clone> Iterator for VecBacktrackingIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let item = self.items.get(self.next)?.clone();
        self.prev = Some(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.items.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl<T: Clone> BacktrackingIterator for VecBacktrackingIterator<T> {
    fn mark_prev(&mut self) {
        if let Some(prev) = self.prev {
            self.marked = Some(prev);
        }
    }

    fn mark_next(&mut self) {
        self.marked = Some(self.next);
    }

    fn reset(&mut self) {
        if let Some(marked) = self.marked {
            self.next = marked;
            self.prev = None;
        }
    }
}
