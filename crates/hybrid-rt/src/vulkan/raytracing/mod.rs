//! Ray tracing support via Vulkan KHR extensions.
//!
//! Geometry descriptors and acceleration structures (BLAS/TLAS), pipeline
//! assembly, shader binding tables and trace dispatch, tied together by
//! [`Raytracer`].

pub mod geometry;
pub mod acceleration;
pub mod groups;
pub mod pipeline;
pub mod sbt;
pub mod dispatch;
pub mod state;
pub mod raytracer;

pub use geometry::{describe_implicit_set, describe_triangle_mesh, GeometryDescriptor, ImplicitSet, TriangleMesh};
pub use acceleration::{AccelerationStructureBuilder, Blas, InstanceRecord, MeshInstance, RtInstance, Tlas};
pub use groups::{GroupRole, LightType, SbtRegion, ShaderGroupRegistry};
pub use pipeline::RtPipeline;
pub use sbt::{BindingTableLayout, ShaderBindingTable};
pub use dispatch::{FrameConstants, RtPushConstants};
pub use state::BuildState;
pub use raytracer::Raytracer;
