//! Fair dispatch over the hardware queues of one family

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use ash::vk;

use crate::device::LogicalDevice;

struct QueueData {
    queue: vk::Queue,
    access_mutex: Mutex<()>,
    access_count: AtomicU32,
}

/// Exclusive lease on one hardware queue.
///
/// The queue's mutex is held for the lease's lifetime: two threads may hold
/// leases on different queues concurrently, never on the same one.
pub struct GuardedQueue<'a> {
    queue: vk::Queue,
    _guard: MutexGuard<'a, ()>,
}

impl GuardedQueue<'_> {
    /// The leased queue handle
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

/// Distributes submissions over the N queues of one family.
///
/// Selection picks the queue with the lowest access count; counters only
/// grow, so under contention the balancer degrades into fair round-robin.
pub struct QueueLoadBalancer {
    queues: Vec<QueueData>,
    selection_mutex: Mutex<()>,
}

impl QueueLoadBalancer {
    /// Fetch `queue_count` queues of `queue_family_index` from the device;
    /// at least one queue is always created
    pub fn new(logical_device: &LogicalDevice, queue_family_index: u32, queue_count: u32) -> Self {
        let queues = (0..queue_count.max(1))
            .map(|queue_index| QueueData {
                queue: logical_device
                    .dispatch()
                    .device_queue(queue_family_index, queue_index),
                access_mutex: Mutex::new(()),
                access_count: AtomicU32::new(0),
            })
            .collect();
        Self {
            queues,
            selection_mutex: Mutex::new(()),
        }
    }

    /// Lease the least-used queue.
    ///
    /// Blocks while every queue of the family is leased out.
    pub fn get_queue(&self) -> GuardedQueue<'_> {
        let entry = {
            let _selection = self
                .selection_mutex
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = self
                .queues
                .iter()
                .min_by_key(|data| data.access_count.load(Ordering::Relaxed))
                .expect("load balancer constructed with zero queues");
            entry.access_count.fetch_add(1, Ordering::Relaxed);
            entry
        };
        GuardedQueue {
            queue: entry.queue,
            _guard: entry
                .access_mutex
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        }
    }

    /// Number of queues under this balancer
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::headless::HeadlessDispatch;
    use std::sync::Arc;

    #[test]
    fn selection_rotates_over_all_queues() {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let balancer = QueueLoadBalancer::new(&device, 0, 3);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let lease = balancer.get_queue();
            seen.push(lease.queue());
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn concurrent_leases_land_on_distinct_queues() {
        let device = LogicalDevice::new(HeadlessDispatch::new());
        let balancer = Arc::new(QueueLoadBalancer::new(&device, 0, 2));

        let first = balancer.get_queue();
        let second = balancer.get_queue();
        assert_ne!(first.queue(), second.queue());
    }
}
