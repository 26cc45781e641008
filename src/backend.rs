//! Provisioning API abstraction used to create and destroy VMs and disks.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

use crate::types::{AgentId, DiskCid, VmCid};

/// How a network hands out addresses to a VM.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NetworkKind {
    /// The provider assigns an address when the VM is created.
    Dynamic,
    /// The address is fixed by the manifest.
    Static(IpAddr),
}

/// A network the VM must join.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkRequest {
    /// Network name from the cloud config.
    pub name: String,
    /// Address assignment mode.
    pub kind: NetworkKind,
}

impl NetworkRequest {
    /// Requests a provider assigned address on `name`.
    #[must_use]
    pub fn dynamic(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            kind: NetworkKind::Dynamic,
        }
    }

    /// Requests the fixed address `ip` on `name`.
    #[must_use]
    pub fn fixed(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into().trim().to_owned(),
            kind: NetworkKind::Static(ip),
        }
    }
}

/// Parameters required to create a VM for an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmSpec {
    /// Instance the VM will serve, rendered as `<group>/<id>`.
    pub instance_name: String,
    /// Availability zone the VM must be placed in. May be empty when the
    /// deployment does not use zones.
    pub availability_zone: String,
    /// VM type (flavour) from the cloud config.
    pub vm_type: String,
    /// Stemcell (boot image) identifier.
    pub stemcell: String,
    /// Networks the VM joins.
    pub networks: Vec<NetworkRequest>,
}

impl VmSpec {
    /// Starts a builder for a [`VmSpec`].
    #[must_use]
    pub fn builder() -> VmSpecBuilder {
        VmSpecBuilder::new()
    }

    /// Validates the spec, returning a descriptive error when a required field
    /// is missing.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when a required field is empty or
    /// no network was requested.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if self.instance_name.is_empty() {
            return Err(ProviderError::Validation("instance_name".to_owned()));
        }
        if self.vm_type.is_empty() {
            return Err(ProviderError::Validation("vm_type".to_owned()));
        }
        if self.stemcell.is_empty() {
            return Err(ProviderError::Validation("stemcell".to_owned()));
        }
        if self.networks.is_empty() || self.networks.iter().any(|net| net.name.is_empty()) {
            return Err(ProviderError::Validation("networks".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`VmSpec`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmSpecBuilder {
    instance_name: String,
    availability_zone: String,
    vm_type: String,
    stemcell: String,
    networks: Vec<NetworkRequest>,
}

impl VmSpecBuilder {
    /// Creates an empty builder; fields must be populated before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instance name.
    #[must_use]
    pub fn instance_name(mut self, value: impl Into<String>) -> Self {
        self.instance_name = value.into();
        self
    }

    /// Sets the availability zone.
    #[must_use]
    pub fn availability_zone(mut self, value: impl Into<String>) -> Self {
        self.availability_zone = value.into();
        self
    }

    /// Sets the VM type.
    #[must_use]
    pub fn vm_type(mut self, value: impl Into<String>) -> Self {
        self.vm_type = value.into();
        self
    }

    /// Sets the stemcell.
    #[must_use]
    pub fn stemcell(mut self, value: impl Into<String>) -> Self {
        self.stemcell = value.into();
        self
    }

    /// Adds a network to join.
    #[must_use]
    pub fn network(mut self, value: NetworkRequest) -> Self {
        self.networks.push(value);
        self
    }

    /// Builds and validates the [`VmSpec`], trimming string inputs.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Validation`] when any required field is empty.
    pub fn build(self) -> Result<VmSpec, ProviderError> {
        let spec = VmSpec {
            instance_name: self.instance_name.trim().to_owned(),
            availability_zone: self.availability_zone.trim().to_owned(),
            vm_type: self.vm_type.trim().to_owned(),
            stemcell: self.stemcell.trim().to_owned(),
            networks: self.networks,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Handle returned by a provider once a VM has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedVm {
    /// Provider specific identifier for the VM.
    pub cid: VmCid,
    /// Address of the agent that boots on the VM.
    pub agent_id: AgentId,
    /// Addresses assigned to the VM, one per requested network.
    pub ip_addresses: Vec<IpAddr>,
}

/// Provider operations, used to label errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderOperation {
    /// `create_vm`
    CreateVm,
    /// `delete_vm`
    DeleteVm,
    /// `attach_disk`
    AttachDisk,
    /// `detach_disk`
    DetachDisk,
    /// `disk_attached?`
    DiskAttached,
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::CreateVm => "create_vm",
            Self::DeleteVm => "delete_vm",
            Self::AttachDisk => "attach_disk",
            Self::DetachDisk => "detach_disk",
            Self::DiskAttached => "disk_attached",
        })
    }
}

/// Errors raised by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when a VM spec is missing a required field.
    #[error("invalid vm spec: missing or empty field: {0}")]
    Validation(String),
    /// Raised for failures the provider reports as worth retrying.
    #[error("{operation} failed transiently: {message}")]
    Transient {
        /// Operation that failed.
        operation: ProviderOperation,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised for failures that retrying will not fix.
    #[error("{operation} failed: {message}")]
    Fatal {
        /// Operation that failed.
        operation: ProviderOperation,
        /// Message returned by the provider.
        message: String,
    },
    /// Raised when the addressed VM does not exist.
    #[error("vm {cid} not found")]
    VmNotFound {
        /// Identifier that was looked up.
        cid: VmCid,
    },
    /// Raised when the addressed disk does not exist.
    #[error("disk {cid} not found")]
    DiskNotFound {
        /// Identifier that was looked up.
        cid: DiskCid,
    },
    /// Raised when a disk is already attached elsewhere and the provider does
    /// not allow multi-attach.
    #[error("disk {disk_cid} is already attached to vm {vm_cid}")]
    DiskBusy {
        /// Disk that was requested.
        disk_cid: DiskCid,
        /// VM currently holding the disk.
        vm_cid: VmCid,
    },
    /// Raised when an address is still reserved by another VM.
    #[error("address {ip} is still reserved by vm {holder}")]
    AddressInUse {
        /// Address that was requested.
        ip: IpAddr,
        /// VM currently holding the reservation.
        holder: VmCid,
    },
}

impl ProviderError {
    /// Whether the failed call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Future returned by provider operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// VM operations implemented by providers.
pub trait Provisioner: Send + Sync {
    /// Creates a VM and returns its identity once the agent can be addressed.
    fn create_vm<'a>(&'a self, spec: &'a VmSpec) -> BackendFuture<'a, CreatedVm, ProviderError>;

    /// Deletes a VM. Deleting an unknown VM yields
    /// [`ProviderError::VmNotFound`].
    fn delete_vm<'a>(&'a self, cid: &'a VmCid) -> BackendFuture<'a, (), ProviderError>;
}

/// Disk operations implemented by providers.
pub trait DiskProvisioner: Provisioner {
    /// Attaches a persistent disk to a VM.
    fn attach_disk<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, (), ProviderError>;

    /// Detaches a persistent disk from a VM.
    fn detach_disk<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, (), ProviderError>;

    /// Reports whether `disk` is attached to `vm`.
    fn is_disk_attached<'a>(
        &'a self,
        vm: &'a VmCid,
        disk: &'a DiskCid,
    ) -> BackendFuture<'a, bool, ProviderError>;

    /// Lists every VM the provider reports `disk` attached to.
    fn disk_attachments<'a>(&'a self, disk: &'a DiskCid) -> BackendFuture<'a, Vec<VmCid>, ProviderError>;

    /// Whether a disk may be attached to two VMs at once.
    fn supports_multi_attach(&self) -> bool {
        false
    }
}
