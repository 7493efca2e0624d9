//! Lock-protected bounded FIFO with the statistics congestion management needs.
//!
//! Used for every cross-thread hand-off in the stack: a transport's outbound
//! queue and the transaction controller's inbound queue.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::congestion::{CongestionManager, FifoStats, RejectionBehavior};

/// Weight of the newest sample in the service-time moving average
const SERVICE_TIME_ALPHA: f64 = 0.1;

struct FifoInner<T> {
    items: VecDeque<(Instant, T)>,
    last_get: Option<Instant>,
    /// Exponential moving average of time between successive gets while busy, in microseconds
    avg_service_us: f64,
}

pub struct Fifo<T> {
    description: String,
    /// 0 means unbounded
    max_depth: usize,
    inner: Mutex<FifoInner<T>>,
    congestion: RwLock<Option<Arc<dyn CongestionManager>>>,
}

impl<T> Fifo<T> {
    pub fn new(description: impl Into<String>, max_depth: usize) -> Self {
        Fifo {
            description: description.into(),
            max_depth,
            inner: Mutex::new(FifoInner {
                items: VecDeque::new(),
                last_get: None,
                avg_service_us: 0.0,
            }),
            congestion: RwLock::new(None),
        }
    }

    /// Appends an item. A full bounded FIFO hands the item back.
    pub fn add(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if self.max_depth != 0 && inner.items.len() >= self.max_depth {
            return Err(item);
        }
        inner.items.push_back((Instant::now(), item));
        Ok(())
    }

    /// Puts an item back at the head, e.g. after a would-block write.
    /// Ignores the depth bound since the item was already admitted once.
    pub fn push_front(&self, item: T) {
        self.inner.lock().items.push_front((Instant::now(), item));
    }

    pub fn try_get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let (_, item) = inner.items.pop_front()?;
        if let Some(last) = inner.last_get {
            let sample = now.duration_since(last).as_micros() as f64;
            inner.avg_service_us = if inner.avg_service_us == 0.0 {
                sample
            } else {
                inner.avg_service_us * (1.0 - SERVICE_TIME_ALPHA) + sample * SERVICE_TIME_ALPHA
            };
        }
        inner.last_get = if inner.items.is_empty() { None } else { Some(now) };
        Some(item)
    }

    /// Takes up to `max` items
    pub fn get_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.try_get() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Drops everything queued, returning how many items were discarded
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.items.len();
        inner.items.clear();
        inner.last_get = None;
        n
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_congestion_manager(&self, manager: Arc<dyn CongestionManager>) {
        *self.congestion.write() = Some(manager);
    }

    pub fn rejection_behavior(&self) -> RejectionBehavior
    where
        T: Send,
    {
        match self.congestion.read().as_ref() {
            Some(manager) => manager.rejection_behavior(self),
            None => RejectionBehavior::Normal,
        }
    }
}

impl<T: Send> FifoStats for Fifo<T> {
    fn description(&self) -> &str {
        &self.description
    }

    fn size(&self) -> usize {
        self.len()
    }

    fn time_depth(&self) -> Duration {
        self.inner
            .lock()
            .items
            .front()
            .map(|(added, _)| added.elapsed())
            .unwrap_or_default()
    }

    fn expected_wait(&self) -> Duration {
        let inner = self.inner.lock();
        let by_rate = Duration::from_micros((inner.avg_service_us * inner.items.len() as f64) as u64);
        let by_age = inner
            .items
            .front()
            .map(|(added, _)| added.elapsed())
            .unwrap_or_default();
        by_rate.max(by_age)
    }
}

/// Registers a shared FIFO with a congestion manager and installs the manager on it
pub fn attach_congestion_manager<T: Send + 'static>(
    fifo: &Arc<Fifo<T>>,
    manager: Arc<dyn CongestionManager>,
) {
    let stats: Arc<dyn FifoStats> = fifo.clone();
    let weak: Weak<dyn FifoStats> = Arc::downgrade(&stats);
    manager.register_fifo(weak);
    fifo.set_congestion_manager(manager);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::{GeneralCongestionManager, MetricType};

    #[test]
    fn test_bounded_add_returns_item() {
        let fifo = Fifo::new("tx", 2);
        assert!(fifo.add(1).is_ok());
        assert!(fifo.add(2).is_ok());
        assert_eq!(fifo.add(3), Err(3));
        fifo.push_front(0);
        assert_eq!(fifo.get_batch(10), vec![0, 1, 2]);
        assert!(fifo.is_empty());
    }

    #[test]
    fn test_unbounded_and_clear() {
        let fifo = Fifo::new("rx", 0);
        for i in 0..100 {
            fifo.add(i).unwrap();
        }
        assert_eq!(fifo.len(), 100);
        assert_eq!(fifo.clear(), 100);
        assert_eq!(fifo.try_get(), None);
    }

    #[test]
    fn test_congestion_follows_depth() {
        let fifo = Arc::new(Fifo::new("state machine", 0));
        let manager = GeneralCongestionManager::new();
        manager.set_tolerance("state machine", MetricType::Size, 10);
        attach_congestion_manager(&fifo, manager.clone());

        assert_eq!(fifo.rejection_behavior(), RejectionBehavior::Normal);
        for i in 0..8 {
            fifo.add(i).unwrap();
        }
        assert_eq!(fifo.rejection_behavior(), RejectionBehavior::RejectingNewWork);
        for i in 0..2 {
            fifo.add(i).unwrap();
        }
        assert_eq!(fifo.rejection_behavior(), RejectionBehavior::RejectingNonEssential);
        fifo.clear();
        assert_eq!(fifo.rejection_behavior(), RejectionBehavior::Normal);
        assert!(manager.encode_current_state().contains("state machine"));
    }
}
