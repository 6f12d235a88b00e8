#![allow(clippy::too_many_arguments, clippy::missing_safety_doc, clippy::new_without_default)]
// Hybrid hardware ray tracing core (Vulkan KHR ray tracing)

pub mod error;
pub mod vulkan;

pub use error::{Result, RtError};
pub use vulkan::raytracing::{
    FrameConstants, ImplicitSet, LightType, MeshInstance, Raytracer, TriangleMesh,
};
pub use vulkan::{RtConfig, VulkanContext};
