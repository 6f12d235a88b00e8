//! Per-frame trace dispatch.

use ash::vk;
use bytemuck::{Pod, Zeroable};

use super::groups::LightType;
use super::pipeline::RtPipeline;
use super::sbt::ShaderBindingTable;
use crate::vulkan::VulkanContext;

/// Push constants read by the raygen, hit, miss and callable shaders.
///
/// Layout must match the `PushConstantRay` block in the shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtPushConstants {
    pub clear_color: [f32; 4],
    pub light_position: [f32; 3],
    pub light_intensity: f32,
    pub light_direction: [f32; 3],
    pub light_spot_cutoff: f32,
    pub light_spot_outer_cutoff: f32,
    pub light_type: i32,
    pub frame: i32,
}

impl RtPushConstants {
    /// Stages the push constant range is visible to.
    pub const STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
        vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
            | vk::ShaderStageFlags::MISS_KHR.as_raw()
            | vk::ShaderStageFlags::CALLABLE_KHR.as_raw(),
    );

    pub fn new(clear_color: [f32; 4], frame: &FrameConstants) -> Self {
        Self {
            clear_color,
            light_position: frame.light_position,
            light_intensity: frame.light_intensity,
            light_direction: frame.light_direction,
            light_spot_cutoff: frame.light_spot_cutoff,
            light_spot_outer_cutoff: frame.light_spot_outer_cutoff,
            light_type: frame.light_type as i32,
            frame: frame.frame,
        }
    }
}

/// Scene lighting and frame counter supplied by the caller every frame.
///
/// Spot cutoffs are cosines of the cone half-angles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameConstants {
    pub light_position: [f32; 3],
    pub light_intensity: f32,
    pub light_direction: [f32; 3],
    pub light_spot_cutoff: f32,
    pub light_spot_outer_cutoff: f32,
    pub light_type: LightType,
    pub frame: i32,
}

impl Default for FrameConstants {
    fn default() -> Self {
        Self {
            light_position: [10.0, 15.0, 8.0],
            light_intensity: 100.0,
            light_direction: [-1.0, -1.0, -1.0],
            light_spot_cutoff: 12.5f32.to_radians().cos(),
            light_spot_outer_cutoff: 17.5f32.to_radians().cos(),
            light_type: LightType::Point,
            frame: 0,
        }
    }
}

/// Record a full-extent trace into `cmd`.
///
/// Binds the pipeline and sets `[rt_set, scene_set]` at set 0, pushes the
/// frame constants and traces `extent.width x extent.height x 1` rays. Only
/// records; the caller submits.
#[allow(clippy::too_many_arguments)]
pub unsafe fn record_trace(
    ctx: &VulkanContext,
    cmd: vk::CommandBuffer,
    pipeline: &RtPipeline,
    sbt: &ShaderBindingTable,
    rt_set: vk::DescriptorSet,
    scene_set: vk::DescriptorSet,
    extent: vk::Extent2D,
    push_constants: &RtPushConstants,
) {
    ctx.begin_label(cmd, c"Ray trace");

    ctx.device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline.pipeline);
    ctx.device.cmd_bind_descriptor_sets(
        cmd,
        vk::PipelineBindPoint::RAY_TRACING_KHR,
        pipeline.layout,
        0,
        &[rt_set, scene_set],
        &[],
    );
    ctx.device.cmd_push_constants(
        cmd,
        pipeline.layout,
        RtPushConstants::STAGES,
        0,
        bytemuck::bytes_of(push_constants),
    );

    let [raygen, miss, hit, callable] = sbt.regions();
    ctx.rt_pipeline_loader.cmd_trace_rays(
        cmd,
        &raygen,
        &miss,
        &hit,
        &callable,
        extent.width,
        extent.height,
        1,
    );

    ctx.end_label(cmd);
}
