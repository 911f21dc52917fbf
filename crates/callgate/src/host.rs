//! Per-host admission counter.
//!
//! Every non-duplex call destined for the same host shares one `HostCounter`
//! (through an `Arc`) for as long as any of them is queued or running. The
//! value is the number of those calls currently admitted.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub struct HostCounter {
    running: AtomicUsize,
}

impl HostCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }

    /// Returns the value after the increment.
    pub fn increment(&self) -> usize {
        self.running.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the value after the decrement. Saturates at zero.
    pub fn decrement(&self) -> usize {
        let previous = self
            .running
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(n) => n - 1,
            Err(_) => {
                tracing::warn!("Host counter decremented below zero, ignoring");
                0
            }
        }
    }
}

impl fmt::Display for HostCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_at_zero() {
        assert_eq!(HostCounter::new().get(), 0);
    }

    #[test]
    fn increment_and_decrement() {
        let counter = HostCounter::new();
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.decrement(), 1);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn decrement_never_goes_below_zero() {
        let counter = HostCounter::new();
        assert_eq!(counter.decrement(), 0);
        assert_eq!(counter.get(), 0);
        counter.increment();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn shared_between_threads() {
        let counter = Arc::new(HostCounter::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment();
                        counter.decrement();
                    }
                    counter.increment();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.get(), 8);
    }
}
