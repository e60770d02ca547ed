use std::collections::{HashMap, VecDeque};

use tokio::time::Instant;

use super::job::{Job, Pri};

/// Every job a tube owns, in whatever state. Collections store ids only and
/// resolve them through this table, so a job lives in exactly one place.
pub type JobTable = HashMap<u64, Job>;

/// Ready jobs, smallest `(pri, id)` first. Ids are monotonic, so the tie
/// break doubles as insertion order.
pub type ReadyQueue = IndexedHeap<(Pri, u64)>;

/// Reserved jobs keyed by TTR deadline, and delayed jobs keyed by ready
/// time. The earliest entry drives the tube's next timer wake-up.
pub type DeadlineQueue = IndexedHeap<(Instant, u64)>;

/// A binary min-heap of job ids that writes each job's slot back into
/// [Job::heap_index] on every move, making removal of an arbitrary job
/// O(log n) rather than a scan.
#[derive(Debug, Default)]
pub struct IndexedHeap<K> {
    slots: Vec<(K, u64)>,
}

impl<K: Ord + Copy> IndexedHeap<K> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Id of the minimum entry without removing it.
    pub fn peek(&self) -> Option<u64> {
        self.slots.first().map(|&(_, id)| id)
    }

    /// Key of the minimum entry; for deadline heaps this is the next
    /// wake-up the owning tube must arm.
    pub fn peek_key(&self) -> Option<K> {
        self.slots.first().map(|&(k, _)| k)
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().map(|&(_, id)| id)
    }

    pub fn push(&mut self, jobs: &mut JobTable, key: K, id: u64) {
        self.slots.push((key, id));
        let i = self.slots.len() - 1;
        self.record(jobs, i);
        self.sift_up(jobs, i);
    }

    pub fn pop(&mut self, jobs: &mut JobTable) -> Option<u64> {
        if self.slots.is_empty() {
            return None;
        }

        let (_, id) = self.slots.swap_remove(0);
        if !self.slots.is_empty() {
            self.record(jobs, 0);
            self.sift_down(jobs, 0);
        }

        Some(id)
    }

    /// Removes the entry for `id` using its recorded heap index. Returns
    /// false if the job is unknown or the index doesn't point at it, which
    /// means the job is held by a different collection.
    pub fn remove(&mut self, jobs: &mut JobTable, id: u64) -> bool {
        let i = match jobs.get(&id) {
            Some(job) => job.heap_index,
            None => return false,
        };

        if i >= self.slots.len() || self.slots[i].1 != id {
            return false;
        }

        self.slots.swap_remove(i);
        if i < self.slots.len() {
            self.record(jobs, i);
            self.restore(jobs, i);
        }

        true
    }

    /// Replaces the key of `id` in place and restores heap order; this is
    /// how `touch` re-arms a reservation deadline.
    pub fn rekey(&mut self, jobs: &mut JobTable, id: u64, key: K) -> bool {
        let i = match jobs.get(&id) {
            Some(job) => job.heap_index,
            None => return false,
        };

        if i >= self.slots.len() || self.slots[i].1 != id {
            return false;
        }

        self.slots[i].0 = key;
        self.restore(jobs, i);

        true
    }

    fn record(&self, jobs: &mut JobTable, i: usize) {
        if let Some(job) = jobs.get_mut(&self.slots[i].1) {
            job.heap_index = i;
        }
    }

    /// The slot at `i` holds an arbitrary key after a swap_remove or rekey:
    /// move it in whichever direction restores the heap property.
    fn restore(&mut self, jobs: &mut JobTable, i: usize) {
        if i > 0 && self.slots[i].0 < self.slots[(i - 1) / 2].0 {
            self.sift_up(jobs, i);
        } else {
            self.sift_down(jobs, i);
        }
    }

    fn sift_up(&mut self, jobs: &mut JobTable, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.slots[i].0 >= self.slots[parent].0 {
                break;
            }
            self.slots.swap(i, parent);
            self.record(jobs, i);
            self.record(jobs, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, jobs: &mut JobTable, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut min = i;

            if left < self.slots.len() && self.slots[left].0 < self.slots[min].0
            {
                min = left;
            }
            if right < self.slots.len()
                && self.slots[right].0 < self.slots[min].0
            {
                min = right;
            }
            if min == i {
                break;
            }

            self.slots.swap(i, min);
            self.record(jobs, i);
            self.record(jobs, min);
            i = min;
        }
    }
}

/// Buried jobs in burial order. Kicks and peeks work from the front.
#[derive(Debug, Default)]
pub struct BuriedList {
    order: VecDeque<u64>,
}

impl BuriedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn push(&mut self, id: u64) {
        self.order.push_back(id);
    }

    pub fn peek(&self) -> Option<u64> {
        self.order.front().copied()
    }

    pub fn take(&mut self) -> Option<u64> {
        self.order.pop_front()
    }

    pub fn remove(&mut self, id: u64) -> bool {
        match self.order.iter().position(|&j| j == id) {
            Some(i) => {
                self.order.remove(i);
                true
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn table_with(ids: &[(u64, u32)]) -> JobTable {
        let mut jobs = JobTable::new();
        for &(id, pri) in ids {
            jobs.insert(
                id,
                Job::new(
                    id,
                    Pri(pri),
                    Duration::ZERO,
                    Duration::from_secs(1),
                    Bytes::new(),
                ),
            );
        }
        jobs
    }

    fn push_all(
        heap: &mut ReadyQueue,
        jobs: &mut JobTable,
        ids: &[(u64, u32)],
    ) {
        for &(id, pri) in ids {
            heap.push(jobs, (Pri(pri), id), id);
        }
    }

    #[test]
    fn orders_by_priority_then_id() {
        let items = [(1, 20), (2, 10), (3, 15), (4, 10)];
        let mut jobs = table_with(&items);
        let mut heap = ReadyQueue::new();
        push_all(&mut heap, &mut jobs, &items);

        assert_eq!(heap.peek(), Some(2));
        assert_eq!(heap.pop(&mut jobs), Some(2)); // pri 10, id 2
        assert_eq!(heap.pop(&mut jobs), Some(4)); // pri 10, id 4
        assert_eq!(heap.pop(&mut jobs), Some(3)); // pri 15
        assert_eq!(heap.pop(&mut jobs), Some(1)); // pri 20
        assert_eq!(heap.pop(&mut jobs), None);
    }

    #[test]
    fn heap_index_tracks_slots() {
        let items = [(1, 5), (2, 4), (3, 3), (4, 2), (5, 1)];
        let mut jobs = table_with(&items);
        let mut heap = ReadyQueue::new();
        push_all(&mut heap, &mut jobs, &items);

        for (i, id) in heap.ids().enumerate() {
            assert_eq!(jobs[&id].heap_index, i);
        }
    }

    #[test]
    fn removes_from_the_middle() {
        let items = [(1, 1), (2, 2), (3, 3), (4, 4), (5, 5)];
        let mut jobs = table_with(&items);
        let mut heap = ReadyQueue::new();
        push_all(&mut heap, &mut jobs, &items);

        assert!(heap.remove(&mut jobs, 3));
        assert!(!heap.remove(&mut jobs, 3), "second remove must miss");
        assert!(!heap.remove(&mut jobs, 99));

        let drained: Vec<u64> =
            std::iter::from_fn(|| heap.pop(&mut jobs)).collect();
        assert_eq!(drained, vec![1, 2, 4, 5]);
    }

    #[test]
    fn rekey_reorders() {
        let items = [(1, 10), (2, 20), (3, 30)];
        let mut jobs = table_with(&items);
        let mut heap = ReadyQueue::new();
        push_all(&mut heap, &mut jobs, &items);

        // Make the cheapest job the most expensive.
        assert!(heap.rekey(&mut jobs, 1, (Pri(40), 1)));
        assert_eq!(heap.pop(&mut jobs), Some(2));
        assert_eq!(heap.pop(&mut jobs), Some(3));
        assert_eq!(heap.pop(&mut jobs), Some(1));
    }

    #[test]
    fn buried_is_fifo() {
        let mut buried = BuriedList::new();
        buried.push(7);
        buried.push(8);
        buried.push(9);

        assert_eq!(buried.peek(), Some(7));
        assert_eq!(buried.take(), Some(7));
        assert!(buried.remove(9));
        assert!(!buried.remove(9));
        assert_eq!(buried.take(), Some(8));
        assert!(buried.is_empty());
    }
}
