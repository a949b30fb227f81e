/*!
 * Ordered Queue
 *
 * Wait elements ordered by sequence tag, with the lowest and highest tags
 * tracked for O(1) range checks. Sequence-ordered insertion keeps the deque
 * sorted by ring order; insertion-ordered (first-fit mutexes) appends.
 */

use super::element::WaitElement;
use crate::context::ContextRef;
use crate::core::errors::PsynchError;
use crate::seq::{count, is_higher, is_lower, ring_max, ring_min, SeqWord};
use std::collections::{vec_deque, VecDeque};
use thiserror::Error;

/// Insertion discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    SequenceOrdered,
    InsertionOrdered,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InsertError {
    #[error("sequence {0:#x} already queued")]
    Conflict(SeqWord),

    #[error("no insertion point for sequence {0:#x}")]
    NoPosition(SeqWord),

    #[error("queue allocation failed")]
    Exhausted,
}

impl From<InsertError> for PsynchError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Conflict(_) => PsynchError::Busy(err.to_string()),
            InsertError::NoPosition(_) => PsynchError::invalid(err.to_string()),
            InsertError::Exhausted => PsynchError::AllocationFailed(err.to_string()),
        }
    }
}

#[derive(Debug, Default)]
pub struct OrderedQueue {
    elements: VecDeque<WaitElement>,
    first: SeqWord,
    last: SeqWord,
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Lowest tag present (0 when empty)
    pub fn first(&self) -> SeqWord {
        self.first
    }

    /// Highest tag present (0 when empty)
    pub fn last(&self) -> SeqWord {
        self.last
    }

    pub fn iter(&self) -> vec_deque::Iter<'_, WaitElement> {
        self.elements.iter()
    }

    pub fn get(&self, index: usize) -> Option<&WaitElement> {
        self.elements.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut WaitElement> {
        self.elements.get_mut(index)
    }

    pub fn front(&self) -> Option<&WaitElement> {
        self.elements.front()
    }

    /// Link `element`, returning its index
    pub fn insert(&mut self, element: WaitElement, fit: Fit) -> Result<usize, InsertError> {
        self.elements
            .try_reserve(1)
            .map_err(|_| InsertError::Exhausted)?;

        let seq = element.seq();
        if self.elements.is_empty() {
            self.elements.push_back(element);
            self.first = seq;
            self.last = seq;
            return Ok(0);
        }

        if fit == Fit::InsertionOrdered {
            self.elements.push_back(element);
            if is_lower(seq, self.first) {
                self.first = seq;
            }
            if is_higher(seq, self.last) {
                self.last = seq;
            }
            return Ok(self.elements.len() - 1);
        }

        if is_higher(seq, self.last) {
            self.elements.push_back(element);
            self.last = seq;
            return Ok(self.elements.len() - 1);
        }
        if is_lower(seq, self.first) {
            self.elements.push_front(element);
            self.first = seq;
            return Ok(0);
        }

        for index in 0..self.elements.len() {
            let existing = &self.elements[index];
            if existing.seq() == seq {
                // A cancel racing with a prepost may leave two entries at one tag
                if element.is_prepost() && existing.is_cancelled_waiter() {
                    self.elements.push_back(element);
                    return Ok(self.elements.len() - 1);
                }
                return Err(InsertError::Conflict(seq));
            }
            if is_higher(existing.seq(), seq) {
                self.elements.insert(index, element);
                return Ok(index);
            }
        }
        Err(InsertError::NoPosition(seq))
    }

    /// Unlink the element at `index`
    ///
    /// # Panics
    ///
    /// Removing from an empty queue or past its end corrupts every other
    /// waiter's bookkeeping and is fatal.
    pub fn remove(&mut self, index: usize) -> WaitElement {
        let removed = match self.elements.remove(index) {
            Some(element) => element,
            None => panic!(
                "removing item {} from queue of {}",
                index,
                self.elements.len()
            ),
        };

        if self.elements.is_empty() {
            self.first = 0;
            self.last = 0;
        } else if removed.seq() == self.first || removed.seq() == self.last {
            self.recompute_extremes();
        }
        removed
    }

    fn recompute_extremes(&mut self) {
        self.first = ring_min(self.elements.iter().map(WaitElement::seq)).unwrap_or(0);
        self.last = ring_max(self.elements.iter().map(WaitElement::seq)).unwrap_or(0);
    }

    pub fn position_of_seq(&self, seq: SeqWord) -> Option<usize> {
        let seq = count(seq);
        self.elements.iter().position(|e| e.seq() == seq)
    }

    pub fn position_of(&self, cx: &ContextRef) -> Option<usize> {
        self.elements.iter().position(|e| e.belongs_to(cx))
    }

    /// Elements with tag at or below `upto`
    pub fn count_up_to(&self, upto: SeqWord) -> u32 {
        let upto = count(upto);
        if self.elements.is_empty() || is_higher(self.first, upto) {
            return 0;
        }
        if upto == self.first {
            return 1;
        }

        let mut n = 0;
        for element in &self.elements {
            if is_higher(element.seq(), upto) {
                break;
            }
            n += 1;
            if element.seq() == upto {
                break;
            }
        }
        n
    }

    /// Unlink everything, front to back
    pub fn drain(&mut self) -> vec_deque::Drain<'_, WaitElement> {
        self.first = 0;
        self.last = 0;
        self.elements.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ThreadContext;
    use crate::seq::INC;
    use std::sync::Arc;

    fn waiter(tid: u64, seq: u32) -> WaitElement {
        WaitElement::waiting(Arc::new(ThreadContext::new(1, tid)), seq)
    }

    fn tags(q: &OrderedQueue) -> Vec<u32> {
        q.iter().map(|e| e.seq() >> 8).collect()
    }

    #[test]
    fn test_sequence_ordered_sorts() {
        let mut q = OrderedQueue::new();
        for s in [5, 2, 9, 7, 3] {
            q.insert(waiter(s as u64, s * INC), Fit::SequenceOrdered).unwrap();
        }
        assert_eq!(tags(&q), vec![2, 3, 5, 7, 9]);
        assert_eq!(q.first(), 2 * INC);
        assert_eq!(q.last(), 9 * INC);
    }

    #[test]
    fn test_insertion_ordered_appends() {
        let mut q = OrderedQueue::new();
        for s in [5, 2, 9] {
            q.insert(waiter(s as u64, s * INC), Fit::InsertionOrdered).unwrap();
        }
        assert_eq!(tags(&q), vec![5, 2, 9]);
        assert_eq!(q.first(), 2 * INC);
        assert_eq!(q.last(), 9 * INC);

        // removing the minimum rescans instead of trusting the head
        q.remove(1);
        assert_eq!(q.first(), 5 * INC);
    }

    #[test]
    fn test_duplicate_tag_conflicts() {
        let mut q = OrderedQueue::new();
        q.insert(waiter(1, 4 * INC), Fit::SequenceOrdered).unwrap();
        q.insert(waiter(2, 6 * INC), Fit::SequenceOrdered).unwrap();
        q.insert(waiter(3, 8 * INC), Fit::SequenceOrdered).unwrap();
        assert_eq!(
            q.insert(waiter(4, 6 * INC), Fit::SequenceOrdered),
            Err(InsertError::Conflict(6 * INC))
        );
        assert_eq!(
            q.insert(WaitElement::prepost(4 * INC), Fit::SequenceOrdered),
            Err(InsertError::Conflict(4 * INC))
        );
    }

    #[test]
    fn test_prepost_beside_cancelled_waiter() {
        let mut q = OrderedQueue::new();
        let cx = Arc::new(ThreadContext::new(1, 1));
        q.insert(WaitElement::waiting(cx.clone(), 4 * INC), Fit::SequenceOrdered)
            .unwrap();
        q.insert(WaitElement::prepost(6 * INC), Fit::SequenceOrdered)
            .unwrap();
        cx.cancel();
        let at = q
            .insert(WaitElement::prepost(4 * INC), Fit::SequenceOrdered)
            .unwrap();
        assert_eq!(at, 2);
        assert_eq!(tags(&q), vec![4, 6, 4]);
        assert_eq!(q.first(), 4 * INC);
        assert_eq!(q.last(), 6 * INC);
    }

    #[test]
    fn test_count_up_to() {
        let mut q = OrderedQueue::new();
        for s in [3, 4, 6, 9] {
            q.insert(WaitElement::prepost(s * INC), Fit::SequenceOrdered).unwrap();
        }
        assert_eq!(q.count_up_to(2 * INC), 0);
        assert_eq!(q.count_up_to(3 * INC), 1);
        assert_eq!(q.count_up_to(5 * INC), 2);
        assert_eq!(q.count_up_to(6 * INC), 3);
        assert_eq!(q.count_up_to(20 * INC), 4);
    }

    #[test]
    fn test_wrapping_tags_order() {
        let mut q = OrderedQueue::new();
        let top = crate::seq::MAX_COUNT;
        q.insert(WaitElement::prepost(INC), Fit::SequenceOrdered).unwrap();
        q.insert(WaitElement::prepost(top), Fit::SequenceOrdered).unwrap();
        assert_eq!(q.front().map(|e| e.seq()), Some(top));
        assert_eq!(q.first(), top);
        assert_eq!(q.last(), INC);
    }

    #[test]
    #[should_panic]
    fn test_remove_from_empty_is_fatal() {
        let mut q = OrderedQueue::new();
        q.remove(0);
    }
}
