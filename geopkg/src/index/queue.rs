use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};

/// Why a push did not enqueue its item. The item is handed back.
pub enum PushError<T> {
    /// The queue holds `capacity` items already.
    Full(T),
    /// The queue was closed.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }
}

impl<T> Debug for PushError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PushError::Full(_) => write!(f, "PushError::Full(..)"),
            PushError::Closed(_) => write!(f, "PushError::Closed(..)"),
        }
    }
}

/// Capacity-aware FIFO handing entry batches from the writer to the index
/// builder.
///
/// Many producers may push; one consumer pops. Items are delivered exactly in
/// push order and are never dropped: a push on a full queue returns the item
/// to the caller. After [`close`](Self::close) the consumer still receives
/// everything already queued before `pop` reports end of data.
pub struct BoundedHandoffQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    space: Condvar,
    capacity: usize,
    start_threshold: usize,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedHandoffQueue<T> {
    /// `start_threshold` is the queue length at which the producer should
    /// start the consumer; `capacity` is raised to at least that value.
    pub fn new(capacity: usize, start_threshold: usize) -> BoundedHandoffQueue<T> {
        let start_threshold = start_threshold.max(1);
        let capacity = capacity.max(start_threshold);
        BoundedHandoffQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            available: Condvar::new(),
            space: Condvar::new(),
            capacity,
            start_threshold,
        }
    }

    /// Enqueues without blocking.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PushError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Enqueues, waiting for space while the queue is full.
    ///
    /// Fails only when the queue is or becomes closed.
    pub fn push_blocking(&self, item: T) -> Result<(), PushError<T>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if state.items.len() < self.capacity {
                break;
            }
            self.space.wait(&mut state);
        }
        state.items.push_back(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Dequeues the oldest item, waiting while the queue is empty and open.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.space.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Marks the queue closed and wakes all waiters. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.available.notify_all();
        self.space.notify_all();
    }

    /// Removes and returns every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let mut state = self.state.lock();
        let items = state.items.drain(..).collect();
        drop(state);
        self.space.notify_all();
        items
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once enough items are buffered to start the consumer.
    pub fn reached_threshold(&self) -> bool {
        self.len() >= self.start_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = BoundedHandoffQueue::new(8, 2);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        queue.close();
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_full_returns_item() {
        let queue = BoundedHandoffQueue::new(2, 1);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        match queue.push("c") {
            Err(PushError::Full(item)) => assert_eq!(item, "c"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_capacity_never_below_threshold() {
        let queue: BoundedHandoffQueue<u8> = BoundedHandoffQueue::new(1, 10);
        assert_eq!(queue.capacity(), 10);
    }

    #[test]
    fn test_threshold() {
        let queue = BoundedHandoffQueue::new(10, 3);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(!queue.reached_threshold());
        queue.push(3).unwrap();
        assert!(queue.reached_threshold());
    }

    #[test]
    fn test_close_is_idempotent_and_drains_first() {
        let queue = BoundedHandoffQueue::new(4, 1);
        queue.push(1).unwrap();
        queue.close();
        queue.close();
        assert!(queue.is_closed());
        assert!(matches!(queue.push(2), Err(PushError::Closed(2))));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let queue = Arc::new(BoundedHandoffQueue::new(4, 1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.push(42).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_pop_wakes_on_close() {
        let queue: Arc<BoundedHandoffQueue<i32>> = Arc::new(BoundedHandoffQueue::new(4, 1));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_push_blocking_waits_for_space() {
        let queue = Arc::new(BoundedHandoffQueue::new(1, 1));
        queue.push(1).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push_blocking(2).is_ok())
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn test_push_blocking_fails_on_close() {
        let queue = Arc::new(BoundedHandoffQueue::new(1, 1));
        queue.push(1).unwrap();
        let producer = {
            let queue = queue.clone();
            thread::spawn(move || queue.push_blocking(2).map_err(|e| e.into_inner()))
        };
        thread::sleep(Duration::from_millis(50));
        queue.close();
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    #[test]
    fn test_drain_reclaims_items() {
        let queue = BoundedHandoffQueue::new(4, 1);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.drain(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_multiple_producers_keep_per_producer_order() {
        let queue = Arc::new(BoundedHandoffQueue::new(4, 1));
        let producers: Vec<_> = (0..3)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        queue.push_blocking((p, i)).unwrap();
                    }
                })
            })
            .collect();
        let mut last = [-1i32; 3];
        let mut received = 0;
        while received < 300 {
            let (p, i) = queue.pop().unwrap();
            assert!(i > last[p as usize]);
            last[p as usize] = i;
            received += 1;
        }
        for producer in producers {
            producer.join().unwrap();
        }
    }
}
