//! Commit batch accumulation.
//!
//! Writes are executed as they arrive but their replies are held until the
//! batch commits. A batch is ready once it reaches `max_batch_size` or once
//! `max_batch_delay` has elapsed since its first write. Draining the queue
//! and reads force a flush independently of readiness.

use std::time::{Duration, Instant};

/// Size and time bounds of one commit batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_delay: Duration::from_millis(25),
        }
    }
}

impl BatchConfig {
    pub fn from_config(batch_size: usize, batch_window_ms: u64) -> Self {
        Self {
            max_batch_size: batch_size.max(1),
            max_batch_delay: Duration::from_millis(batch_window_ms),
        }
    }
}

/// Writes executed inside the open transaction, awaiting commit.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    config: BatchConfig,
    items: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> BatchAccumulator<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: Vec::with_capacity(config.max_batch_size),
            opened_at: None,
        }
    }

    /// Whether the next write must open a transaction first.
    pub fn needs_begin(&self) -> bool {
        self.opened_at.is_none()
    }

    /// Mark the transaction as opened. Called once `BEGIN` succeeded, so an
    /// open batch may briefly hold no items when its first write failed.
    pub fn open(&mut self) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    /// Add an executed write. Returns true if the batch is now ready.
    pub fn push(&mut self, item: T) -> bool {
        self.open();
        self.items.push(item);
        self.is_ready()
    }

    pub fn is_ready(&self) -> bool {
        let Some(opened_at) = self.opened_at else {
            return false;
        };
        self.items.len() >= self.config.max_batch_size
            || opened_at.elapsed() >= self.config.max_batch_delay
    }

    /// Close the batch, returning its items.
    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::replace(
            &mut self.items,
            Vec::with_capacity(self.config.max_batch_size),
        )
    }

    /// True when no transaction is open.
    pub fn is_empty(&self) -> bool {
        self.opened_at.is_none()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
