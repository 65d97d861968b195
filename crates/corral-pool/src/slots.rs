//! Weighted slot pool bounding total concurrent resource consumption.
//!
//! The [`SlotPool`] is a counting semaphore where a single acquisition can
//! consume more than one unit: a heavy transcode may reserve several slots
//! while a subtitle conversion takes one. Permits are RAII — dropping a
//! [`SlotPermit`] returns exactly the acquired weight, so a reservation can
//! never be released twice or leak.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A reservation of `weight` slots, returned to the pool on drop.
#[derive(Debug)]
pub struct SlotPermit {
    weight: u32,
    _permit: OwnedSemaphorePermit,
}

impl SlotPermit {
    /// Number of slots this permit holds.
    pub const fn weight(&self) -> u32 {
        self.weight
    }
}

/// Errors from slot acquisition.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AcquireError {
    /// The request can never be satisfied: it asks for more than the pool
    /// will ever hold. Surfaced instead of blocking forever.
    #[error("requested weight {weight} exceeds pool capacity {capacity}")]
    Oversized { weight: u32, capacity: u32 },

    /// Capacity did not free up within the caller's timeout. Nothing was
    /// reserved.
    #[error("timed out waiting for {weight} slots")]
    Timeout { weight: u32 },

    /// The underlying semaphore was closed (pool shut down).
    #[error("slot pool has been closed")]
    Closed,
}

/// Weighted counting semaphore.
///
/// Waiters queue fairly: a large request at the head of the queue is served
/// before smaller requests behind it, which is exactly the strict-FIFO start
/// order the dispatch loop relies on.
pub struct SlotPool {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

impl SlotPool {
    /// Create a pool with the given total weight budget.
    ///
    /// Values below 1 clamp to 1.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(1);
        debug!(capacity, "slot pool created");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Total weight budget.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Weight currently committed to live reservations.
    pub fn reserved(&self) -> u32 {
        let available = u32::try_from(self.semaphore.available_permits()).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(available)
    }

    /// Reserve `weight` slots, waiting up to `timeout` for capacity.
    ///
    /// On timeout nothing is reserved. Requests larger than the pool
    /// capacity are rejected immediately rather than blocking forever.
    pub async fn acquire(
        &self,
        weight: u32,
        timeout: Duration,
    ) -> Result<SlotPermit, AcquireError> {
        if weight > self.capacity {
            return Err(AcquireError::Oversized {
                weight,
                capacity: self.capacity,
            });
        }

        let acquire = Arc::clone(&self.semaphore).acquire_many_owned(weight);
        match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => Ok(SlotPermit {
                weight,
                _permit: permit,
            }),
            Ok(Err(_)) => Err(AcquireError::Closed),
            Err(_) => Err(AcquireError::Timeout { weight }),
        }
    }

    /// Reserve `weight` slots only if they are free right now.
    pub fn try_acquire(&self, weight: u32) -> Option<SlotPermit> {
        if weight > self.capacity {
            return None;
        }
        Arc::clone(&self.semaphore)
            .try_acquire_many_owned(weight)
            .ok()
            .map(|permit| SlotPermit {
                weight,
                _permit: permit,
            })
    }
}
