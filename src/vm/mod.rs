//! VM lifecycle management on top of a [`Provisioner`].
//!
//! Creation retries transient provider failures a bounded number of times.
//! Deletion retries every failure until the budget is spent and then reports
//! the VM as leaked so it is surfaced to the operator rather than forgotten.

mod reservation;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::{ProviderError, Provisioner, VmSpec};
use crate::model::{ProcessState, Vm};
use crate::types::VmCid;

pub use reservation::ReservationLedger;

/// Attempt budget and pause between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Creates a policy; a zero attempt count is treated as one.
    #[must_use]
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: if attempts == 0 { 1 } else { attempts },
            backoff,
        }
    }
}

/// Errors raised by the lifecycle manager.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum VmError {
    /// Raised when the VM could not be created.
    #[error("failed to create vm for {instance} after {attempts} attempt(s): {source}")]
    Create {
        /// Instance the VM was for.
        instance: String,
        /// Attempts made.
        attempts: u32,
        /// Last provider failure.
        #[source]
        source: ProviderError,
    },
    /// Raised when deletion kept failing; the VM still exists.
    #[error("vm {cid} could not be deleted after {attempts} attempt(s) and needs manual cleanup: {source}")]
    Leaked {
        /// VM left behind.
        cid: VmCid,
        /// Attempts made.
        attempts: u32,
        /// Last provider failure.
        #[source]
        source: ProviderError,
    },
}

impl VmError {
    /// Provider failure behind the error.
    #[must_use]
    pub const fn provider_error(&self) -> &ProviderError {
        match self {
            Self::Create { source, .. } | Self::Leaked { source, .. } => source,
        }
    }
}

/// Creates and deletes VMs, tracking their network reservations.
#[derive(Debug)]
pub struct VmLifecycleManager<P> {
    provider: Arc<P>,
    ledger: ReservationLedger,
    create_retry: RetryPolicy,
    delete_retry: RetryPolicy,
}

impl<P> Clone for VmLifecycleManager<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            ledger: self.ledger.clone(),
            create_retry: self.create_retry,
            delete_retry: self.delete_retry,
        }
    }
}

impl<P: Provisioner> VmLifecycleManager<P> {
    /// Creates a manager with three create attempts and ten delete attempts.
    #[must_use]
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            ledger: ReservationLedger::new(),
            create_retry: RetryPolicy::new(3, Duration::from_secs(2)),
            delete_retry: RetryPolicy::new(10, Duration::from_secs(2)),
        }
    }

    /// Overrides the retry policies.
    #[must_use]
    pub const fn with_retry(mut self, create: RetryPolicy, delete: RetryPolicy) -> Self {
        self.create_retry = create;
        self.delete_retry = delete;
        self
    }

    /// Reservation ledger shared by every VM this manager created.
    #[must_use]
    pub const fn ledger(&self) -> &ReservationLedger {
        &self.ledger
    }

    /// Registers a VM that exists already (for example from a previous deploy)
    /// so its addresses are protected from double reservation.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::AddressInUse`] when another VM holds one of
    /// the addresses.
    pub fn adopt(&self, vm: &Vm) -> Result<(), ProviderError> {
        self.ledger.claim(&vm.cid, &vm.ip_addresses)
    }

    /// Creates a VM for `spec`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Create`] when the provider fails fatally, the retry
    /// budget is spent, or an address is still reserved by another VM.
    pub async fn create(&self, spec: &VmSpec) -> Result<Vm, VmError> {
        let fail = |attempts, source| VmError::Create {
            instance: spec.instance_name.clone(),
            attempts,
            source,
        };
        self.ledger
            .ensure_available(spec)
            .map_err(|source| fail(0, source))?;

        let mut attempt = 1;
        let created = loop {
            match self.provider.create_vm(spec).await {
                Ok(created) => break created,
                Err(err) if err.is_transient() && attempt < self.create_retry.attempts => {
                    warn!(instance = %spec.instance_name, attempt, error = %err, "retrying vm creation");
                    attempt += 1;
                    sleep(self.create_retry.backoff).await;
                }
                Err(err) => return Err(fail(attempt, err)),
            }
        };

        if let Err(conflict) = self.ledger.claim(&created.cid, &created.ip_addresses) {
            warn!(vm_cid = %created.cid, error = %conflict, "discarding vm with conflicting address");
            if let Err(cleanup) = self.delete_cid(&created.cid).await {
                warn!(error = %cleanup, "failed to discard conflicting vm");
            }
            return Err(fail(attempt, conflict));
        }

        info!(instance = %spec.instance_name, vm_cid = %created.cid, "created vm");
        Ok(Vm {
            cid: created.cid,
            agent_id: created.agent_id,
            ip_addresses: created.ip_addresses,
            process_state: ProcessState::Starting,
        })
    }

    /// Deletes `vm`, retrying until it is gone or the budget is spent. The
    /// VM's addresses are released only after deletion is confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::Leaked`] when the VM could not be deleted.
    pub async fn delete(&self, vm: &Vm) -> Result<(), VmError> {
        self.delete_cid(&vm.cid).await
    }

    async fn delete_cid(&self, cid: &VmCid) -> Result<(), VmError> {
        let mut attempt = 1;
        loop {
            match self.provider.delete_vm(cid).await {
                Ok(()) | Err(ProviderError::VmNotFound { .. }) => {
                    let released = self.ledger.release(cid);
                    info!(vm_cid = %cid, released = released.len(), "deleted vm");
                    return Ok(());
                }
                Err(err) if attempt < self.delete_retry.attempts => {
                    warn!(vm_cid = %cid, attempt, error = %err, "retrying vm deletion");
                    attempt += 1;
                    sleep(self.delete_retry.backoff).await;
                }
                Err(err) => {
                    return Err(VmError::Leaked {
                        cid: cid.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}
