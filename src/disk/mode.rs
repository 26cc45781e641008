//! Attach strategies for moving a disk.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a disk changes hands between two VMs.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskAttachMode {
    /// Unmount, detach from the old VM, then attach to the new one.
    Serialized,
    /// Attach to the new VM before detaching from the old one. Falls back to
    /// serialized moves when the provider cannot attach a disk twice.
    Concurrent,
    /// Concurrent when the provider supports multi-attach, serialized
    /// otherwise.
    #[default]
    Provider,
}

impl fmt::Display for DiskAttachMode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Serialized => "serialized",
            Self::Concurrent => "concurrent",
            Self::Provider => "provider",
        })
    }
}

/// Raised when parsing an unknown attach mode.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown disk attach mode '{0}' (expected serialized, concurrent, or provider)")]
pub struct UnknownAttachMode(pub String);

impl FromStr for DiskAttachMode {
    type Err = UnknownAttachMode;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "serialized" | "serial" => Ok(Self::Serialized),
            "concurrent" => Ok(Self::Concurrent),
            "provider" | "auto" => Ok(Self::Provider),
            other => Err(UnknownAttachMode(other.to_owned())),
        }
    }
}
