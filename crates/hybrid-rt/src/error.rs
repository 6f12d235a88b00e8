//! Error types for the ray tracing core.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for acceleration structure, pipeline and SBT operations.
///
/// Every variant is fatal for the operation that produced it: nothing built
/// by a failed call is kept, and the caller rebuilds from scratch.
#[derive(Error, Debug)]
pub enum RtError {
    /// Primitive batch metadata cannot describe valid geometry
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Implicit primitive set has no elements
    #[error("Implicit primitive set is empty")]
    EmptyImplicitSet,

    /// Shader file missing from every search path
    #[error("Shader '{name}' not found in search paths {paths:?}")]
    ShaderNotFound { name: String, paths: Vec<PathBuf> },

    /// Shader file found but unreadable or not SPIR-V
    #[error("Failed to read shader {path}: {source}")]
    ShaderRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Shader group registration violates region ordering
    #[error("Shader group layout error: {0}")]
    GroupLayout(String),

    /// Shader set has no stages for a registered group
    #[error("No shader stages configured for group {0}")]
    MissingShaderStages(String),

    /// Device lacks the required ray tracing extensions or features
    #[error("Ray tracing not supported: {0}")]
    NotSupported(String),

    /// An operation was called before its inputs were built
    #[error("{0} has not been built")]
    NotReady(&'static str),

    /// An input was rebuilt after this output was derived from it
    #[error("{0} is stale and must be rebuilt")]
    Stale(&'static str),

    /// Device or driver call failed
    #[error("{context}: {result:?}")]
    Vulkan {
        context: &'static str,
        result: vk::Result,
    },

    /// Host access to a GPU buffer was invalid
    #[error("Buffer error: {0}")]
    Buffer(String),

    /// GPU memory allocation failed
    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),
}

impl RtError {
    /// Build a `map_err` adapter that tags a `vk::Result` with context.
    pub fn vk(context: &'static str) -> impl FnOnce(vk::Result) -> RtError {
        move |result| RtError::Vulkan { context, result }
    }

    /// Create an invalid geometry error.
    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    /// Whether the error comes from bad inputs rather than the device.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidGeometry(_)
                | Self::EmptyImplicitSet
                | Self::ShaderNotFound { .. }
                | Self::ShaderRead { .. }
                | Self::GroupLayout(_)
                | Self::MissingShaderStages(_)
        )
    }
}

/// Result type alias for ray tracing operations.
pub type Result<T> = std::result::Result<T, RtError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RtError::EmptyImplicitSet;
        assert!(e.to_string().contains("empty"));

        let e = RtError::ShaderNotFound {
            name: "shaders/raytrace.rgen.spv".into(),
            paths: vec![PathBuf::from("/opt/app")],
        };
        assert!(e.to_string().contains("raytrace.rgen.spv"));
        assert!(e.to_string().contains("/opt/app"));
    }

    #[test]
    fn test_vk_adapter_keeps_context() {
        let result: std::result::Result<(), vk::Result> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        let err = result.map_err(RtError::vk("Failed to create BLAS")).unwrap_err();
        match err {
            RtError::Vulkan { context, result } => {
                assert_eq!(context, "Failed to create BLAS");
                assert_eq!(result, vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_configuration_classification() {
        assert!(RtError::geometry("bad").is_configuration());
        assert!(RtError::EmptyImplicitSet.is_configuration());
        assert!(!RtError::NotReady("TLAS").is_configuration());
        assert!(!RtError::Vulkan {
            context: "x",
            result: vk::Result::ERROR_DEVICE_LOST,
        }
        .is_configuration());
    }
}
