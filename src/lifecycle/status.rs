//! Environment states tracked across lifecycle transitions.

use std::fmt;

/// Where an environment is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnvironmentStatus {
    /// No remote resources exist.
    Unprovisioned,
    /// The machine was requested and is booting.
    Provisioning,
    /// The machine is initialised and its descriptor persisted.
    Ready,
    /// The descriptor is persisted but SSH never answered.
    Unreachable,
    /// The machine accepts SSH connections.
    Active,
    /// Remote and local state were removed.
    Destroyed,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::Ready => "ready",
            Self::Unreachable => "unreachable",
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        })
    }
}
