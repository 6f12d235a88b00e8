//! Vulkan layers of the ray tracing core.
//!
//! The host application creates the instance and device; this module wraps
//! them with the allocator, command pool and descriptor helpers the ray
//! tracing components build on.

pub mod context;
pub mod memory;
pub mod commands;
pub mod descriptors;
pub mod shaders;
pub mod rt_config;
pub mod raytracing;

pub use context::{RtCapabilities, VulkanContext};
pub use memory::{Buffer, MemoryManager};
pub use commands::CommandManager;
pub use descriptors::{DescriptorBindings, RtDescriptorSet};
pub use shaders::ShaderLoader;
pub use rt_config::{GroupStages, RtConfig, ShaderSet};

use ash::vk;
use std::ffi::CStr;

/// Minimum Vulkan version the device must support.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Device extensions the host must enable before calling
/// [`VulkanContext::new`].
pub const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 3] = [
    ash::khr::acceleration_structure::NAME,
    ash::khr::ray_tracing_pipeline::NAME,
    ash::khr::deferred_host_operations::NAME,
];
