//! Error taxonomy.
//!
//! Configuration errors are found while binding kernels (before stepping) or,
//! for names an injected computation touches without declaring them, on the
//! first dispatch. Resource errors abort a run. Export errors leave the
//! in-memory simulation untouched and may be retried by the host.

use thiserror::Error;

use crate::registry::ElementType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown variable `{name}`")]
    UnknownVariable { name: String },

    #[error("`{name}` is already declared")]
    Duplicate { name: String },

    #[error("unknown entity set `{name}`")]
    UnknownEntitySet { name: String },

    #[error("`{name}` is not a synapse group")]
    NotSynapses { name: String },

    #[error("`{name}` has type {found}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: ElementType,
        found: ElementType,
    },

    #[error("`{name}` has length {found}, expected {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("`{name}` cannot be bound as {role}")]
    RoleNotAllowed { name: String, role: &'static str },

    #[error("`{synapses}` references neuron {index} outside 0..{count}")]
    ConnectivityOutOfRange {
        synapses: String,
        index: usize,
        count: usize,
    },

    #[error("index {index} is outside 0..{count} of `{name}`")]
    IndexOutOfRange {
        name: String,
        index: usize,
        count: usize,
    },

    #[error("scalar `{name}` is read-only inside kernels")]
    ScalarWrite { name: String },

    #[error("cannot shrink `{name}` from {current} to {requested}")]
    Shrink {
        name: String,
        current: usize,
        requested: usize,
    },

    #[error("kernel `{name}` cannot be scheduled per step")]
    NotSchedulable { name: String },

    #[error("kernel `{name}` cannot run during setup")]
    NotOneShot { name: String },

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("setup() must complete before stepping")]
    NotSetUp,

    #[error("run already completed; call setup() to start again")]
    AlreadyCompleted,

    #[error("kernel `{kernel}`: {source}")]
    Kernel {
        kernel: String,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    /// Attach the name of the kernel that hit this error.
    pub fn in_kernel(self, kernel: &str) -> Self {
        ConfigError::Kernel {
            kernel: kernel.to_string(),
            source: Box::new(self),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("failed to allocate {requested} elements for `{name}`")]
    Allocation { name: String, requested: usize },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("monitor export failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("monitor serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_context_is_prefixed() {
        let err = ConfigError::UnknownVariable {
            name: "v".to_string(),
        }
        .in_kernel("reset_exc");
        assert_eq!(err.to_string(), "kernel `reset_exc`: unknown variable `v`");
    }

    #[test]
    fn sim_error_wraps_config_transparently() {
        let err: SimError = ConfigError::NotSetUp.into();
        assert_eq!(err.to_string(), "setup() must complete before stepping");
    }
}
