//! Hybrid ray tracer: owns the acceleration structures, descriptor set,
//! pipeline and shader binding table, and records the per-frame trace.
//!
//! Build order is BLAS, TLAS, descriptor set, pipeline, SBT; teardown runs
//! in reverse. All builds block until the GPU finishes them. The caller
//! guarantees no submitted trace still references an object being rebuilt.

use ash::vk;

use super::acceleration::{plan_bottom_level, plan_instances, AccelerationStructureBuilder, ImplicitInstance, MeshInstance};
use super::dispatch::{record_trace, FrameConstants, RtPushConstants};
use super::geometry::{ImplicitSet, TriangleMesh};
use super::groups::ShaderGroupRegistry;
use super::pipeline::{self, RtPipeline};
use super::sbt::ShaderBindingTable;
use super::state::BuildState;
use crate::error::{Result, RtError};
use crate::vulkan::descriptors::RtDescriptorSet;
use crate::vulkan::rt_config::RtConfig;
use crate::vulkan::shaders::ShaderLoader;
use crate::vulkan::{CommandManager, MemoryManager, VulkanContext};

/// The ray tracing core.
///
/// Must be destroyed with [`Raytracer::destroy`] and dropped before the
/// host destroys its device.
pub struct Raytracer {
    ctx: VulkanContext,
    config: RtConfig,
    memory: MemoryManager,
    commands: CommandManager,
    shaders: ShaderLoader,
    registry: ShaderGroupRegistry,
    accel: AccelerationStructureBuilder,
    descriptors: Option<RtDescriptorSet>,
    pipeline: Option<RtPipeline>,
    sbt: Option<ShaderBindingTable>,
    state: BuildState,
}

impl Raytracer {
    /// Set up the ray tracer on the host's device.
    ///
    /// `config.debug_labels` decides whether the context emits debug labels
    /// and object names from here on.
    pub unsafe fn setup(mut ctx: VulkanContext, config: RtConfig) -> Result<Self> {
        let config = config.validated(&ctx.rt_capabilities);
        ctx.set_debug_labels(config.debug_labels);
        tracing::debug!(debug_labels = ctx.debug_labels_enabled(), "ray tracer setup");
        let memory = MemoryManager::new(&ctx)?;
        let commands = CommandManager::new(&ctx)?;
        let shaders = ShaderLoader::new(config.search_paths.clone());
        let accel = AccelerationStructureBuilder::new(&ctx, config.compact_blas);

        Ok(Self {
            ctx,
            config,
            memory,
            commands,
            shaders,
            registry: ShaderGroupRegistry::standard(),
            accel,
            descriptors: None,
            pipeline: None,
            sbt: None,
            state: BuildState::new(),
        })
    }

    pub fn context(&self) -> &VulkanContext {
        &self.ctx
    }

    pub fn config(&self) -> &RtConfig {
        &self.config
    }

    pub fn registry(&self) -> &ShaderGroupRegistry {
        &self.registry
    }

    pub fn state(&self) -> &BuildState {
        &self.state
    }

    pub fn acceleration_structures(&self) -> &AccelerationStructureBuilder {
        &self.accel
    }

    pub fn pipeline(&self) -> Option<&RtPipeline> {
        self.pipeline.as_ref()
    }

    pub fn shader_binding_table(&self) -> Option<&ShaderBindingTable> {
        self.sbt.as_ref()
    }

    pub fn descriptor_set(&self) -> Option<&RtDescriptorSet> {
        self.descriptors.as_ref()
    }

    /// Build one BLAS per mesh, plus the implicit aggregate when `implicit`
    /// has elements. Returns the aggregate's BLAS index.
    pub unsafe fn create_bottom_level_as(
        &mut self,
        meshes: &[TriangleMesh],
        implicit: &ImplicitSet,
    ) -> Result<Option<u32>> {
        let plan = plan_bottom_level(meshes, implicit)?;

        if let Err(e) = self.accel.build_blas(&self.ctx, &self.memory, &self.commands, &plan) {
            self.state.blas_destroyed();
            return Err(e);
        }
        self.state.blas_built();
        Ok(plan.implicit_blas)
    }

    /// Build the TLAS over `instances`, plus one instance of the implicit
    /// aggregate when `implicit` has elements.
    ///
    /// An existing descriptor set is pointed at the new TLAS.
    pub unsafe fn create_top_level_as(&mut self, instances: &[MeshInstance], implicit: &ImplicitSet) -> Result<()> {
        if self.accel.blas().is_empty() {
            return Err(RtError::NotReady("bottom-level acceleration structures"));
        }

        let aggregate = if implicit.is_empty() {
            None
        } else {
            let blas_index = self.accel.implicit_blas()
                .ok_or(RtError::Stale("bottom-level acceleration structures"))?;
            Some(ImplicitInstance { blas_index, transform: implicit.transform })
        };

        let records = plan_instances(instances, aggregate, &self.registry)?;

        if let Err(e) = self.accel.build_tlas(&self.ctx, &self.memory, &self.commands, &records, &self.registry) {
            self.state.tlas_destroyed();
            return Err(e);
        }
        self.state.tlas_built()?;

        if self.state.tlas_binding_stale() {
            self.bind_tlas();
        }
        Ok(())
    }

    unsafe fn bind_tlas(&mut self) {
        if let (Some(set), Some(tlas)) = (&self.descriptors, self.accel.tlas()) {
            set.write_acceleration_structure(tlas.handle);
            self.state.tlas_bound();
            tracing::debug!("acceleration structure descriptor refreshed");
        }
    }

    /// Create the ray tracing descriptor set for `output_view`, replacing
    /// any previous one. The TLAS is bound if it exists.
    pub unsafe fn create_rt_descriptor_set(&mut self, output_view: vk::ImageView) -> Result<()> {
        if let Some(mut old) = self.descriptors.take() {
            old.destroy();
        }

        let set = RtDescriptorSet::new(&self.ctx)?;
        set.write_output_image(output_view);
        self.descriptors = Some(set);

        self.state.descriptor_set_created();
        self.state.output_bound();
        self.bind_tlas();
        Ok(())
    }

    /// Point the output binding at a new image, after a resize.
    pub unsafe fn update_rt_descriptor_set(&mut self, output_view: vk::ImageView) -> Result<()> {
        let set = self.descriptors.as_ref().ok_or(RtError::NotReady("ray tracing descriptor set"))?;
        set.write_output_image(output_view);
        self.state.output_bound();
        Ok(())
    }

    /// Assemble the pipeline against the caller's scene set layout.
    ///
    /// The previous pipeline is kept until the new one links. The SBT must be
    /// rebuilt afterwards.
    pub unsafe fn create_rt_pipeline(&mut self, scene_layout: vk::DescriptorSetLayout) -> Result<()> {
        let rt_layout = self.descriptors.as_ref()
            .ok_or(RtError::NotReady("ray tracing descriptor set"))?
            .layout;

        let pipeline = pipeline::assemble(
            &self.ctx,
            &self.shaders,
            &self.config.shaders,
            &self.registry,
            rt_layout,
            scene_layout,
            self.config.recursion_depth,
        )?;

        if let Some(old) = self.pipeline.replace(pipeline) {
            old.destroy(&self.ctx.device);
        }
        self.state.pipeline_built();
        Ok(())
    }

    /// Pack the current pipeline's group handles into a new SBT.
    pub unsafe fn create_rt_shader_binding_table(&mut self) -> Result<()> {
        let pipeline = self.pipeline.as_ref().ok_or(RtError::NotReady("ray tracing pipeline"))?;
        let sbt = ShaderBindingTable::build(&self.ctx, &self.memory, &self.commands, pipeline)?;

        if let Some(old) = self.sbt.replace(sbt) {
            old.destroy(&self.memory);
        }
        self.state.sbt_built()
    }

    /// Record the trace of one frame into `cmd`.
    ///
    /// Fails without recording anything if an input is missing or stale.
    pub unsafe fn raytrace(
        &self,
        cmd: vk::CommandBuffer,
        clear_color: [f32; 4],
        scene_set: vk::DescriptorSet,
        extent: vk::Extent2D,
        frame: &FrameConstants,
    ) -> Result<()> {
        self.state.check_dispatch()?;

        let pipeline = self.pipeline.as_ref().ok_or(RtError::NotReady("ray tracing pipeline"))?;
        let sbt = self.sbt.as_ref().ok_or(RtError::NotReady("shader binding table"))?;
        let set = self.descriptors.as_ref().ok_or(RtError::NotReady("ray tracing descriptor set"))?;

        let push_constants = RtPushConstants::new(clear_color, frame);
        record_trace(&self.ctx, cmd, pipeline, sbt, set.set, scene_set, extent, &push_constants);
        Ok(())
    }

    /// Release every GPU object, in reverse build order.
    pub unsafe fn destroy(&mut self) {
        self.ctx.wait_idle();

        if let Some(sbt) = self.sbt.take() {
            sbt.destroy(&self.memory);
        }
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(&self.ctx.device);
        }
        if let Some(mut set) = self.descriptors.take() {
            set.destroy();
        }
        self.accel.destroy(&self.memory);
        self.commands.destroy();

        self.state.reset();
        tracing::info!("ray tracer destroyed");
    }
}
