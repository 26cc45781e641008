//! Admission gate bounding concurrently active instance updates.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Counting gate shared by every instance update of a task. An update holds
/// an [`Admission`] from before it creates a VM until it reaches a terminal
/// state.
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    gauge: Arc<Gauge>,
}

impl AdmissionGate {
    /// Creates a gate admitting at most `limit` updates at once.
    #[must_use]
    pub fn new(limit: NonZeroUsize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.get())),
            gauge: Arc::default(),
        }
    }

    /// Waits for a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError`] if the underlying semaphore was closed.
    pub async fn admit(&self) -> Result<Admission, AcquireError> {
        let permit = Arc::clone(&self.permits).acquire_owned().await?;
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Admission {
            gauge: Arc::clone(&self.gauge),
            _permit: permit,
        })
    }

    /// Updates holding an admission right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.gauge.current.load(Ordering::SeqCst)
    }

    /// Largest number of simultaneous admissions observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }
}

/// A slot held by one active instance update.
#[derive(Debug)]
pub struct Admission {
    gauge: Arc<Gauge>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Admission {
    fn drop(&mut self) {
        // The gauge drops before the permit is returned.
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}
