//! Ray tracing pipeline assembly.
//!
//! Stages and groups are laid out from the shader group registry, so the
//! group indices baked into the pipeline are the ones the SBT packer and the
//! trace dispatcher later resolve by role.

use ash::vk;
use std::path::PathBuf;

use super::dispatch::RtPushConstants;
use super::groups::{GroupRole, ShaderGroupRegistry};
use crate::error::{Result, RtError};
use crate::vulkan::rt_config::ShaderSet;
use crate::vulkan::shaders::ShaderLoader;
use crate::vulkan::VulkanContext;

/// One shader stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: vk::ShaderStageFlags,
    pub path: PathBuf,
}

/// One shader group, referring to stages by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPlan {
    pub role: GroupRole,
    pub ty: vk::RayTracingShaderGroupTypeKHR,
    pub general: u32,
    pub closest_hit: u32,
    pub any_hit: u32,
    pub intersection: u32,
}

impl GroupPlan {
    fn unused(role: GroupRole) -> Self {
        Self {
            role,
            ty: role.group_type(),
            general: vk::SHADER_UNUSED_KHR,
            closest_hit: vk::SHADER_UNUSED_KHR,
            any_hit: vk::SHADER_UNUSED_KHR,
            intersection: vk::SHADER_UNUSED_KHR,
        }
    }

    pub fn to_vk(&self) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
        vk::RayTracingShaderGroupCreateInfoKHR::default()
            .ty(self.ty)
            .general_shader(self.general)
            .closest_hit_shader(self.closest_hit)
            .any_hit_shader(self.any_hit)
            .intersection_shader(self.intersection)
    }
}

/// Stage list and group list, in registry order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelinePlan {
    pub stages: Vec<StagePlan>,
    pub groups: Vec<GroupPlan>,
}

impl PipelinePlan {
    fn push_stage(&mut self, stage: vk::ShaderStageFlags, path: &std::path::Path) -> u32 {
        self.stages.push(StagePlan { stage, path: path.to_path_buf() });
        self.stages.len() as u32 - 1
    }
}

fn general_stage(role: GroupRole) -> vk::ShaderStageFlags {
    match role {
        GroupRole::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
        GroupRole::Miss | GroupRole::ShadowMiss => vk::ShaderStageFlags::MISS_KHR,
        _ => vk::ShaderStageFlags::CALLABLE_KHR,
    }
}

/// Lay out stages and groups for every registered role.
///
/// General groups need a general shader, hit groups a closest-hit shader,
/// and procedural groups an intersection shader. Any-hit is optional.
pub fn plan_stages(registry: &ShaderGroupRegistry, shaders: &ShaderSet) -> Result<PipelinePlan> {
    let mut plan = PipelinePlan::default();

    for &role in registry.roles() {
        let missing = |what: &str| RtError::MissingShaderStages(format!("{} ({} shader)", role, what));
        let stages = shaders.stages(role).ok_or_else(|| missing("any"))?;
        let mut group = GroupPlan::unused(role);

        if role.group_type() == vk::RayTracingShaderGroupTypeKHR::GENERAL {
            let path = stages.general.as_ref().ok_or_else(|| missing("general"))?;
            group.general = plan.push_stage(general_stage(role), path);
        } else {
            let closest_hit = stages.closest_hit.as_ref().ok_or_else(|| missing("closest-hit"))?;
            group.closest_hit = plan.push_stage(vk::ShaderStageFlags::CLOSEST_HIT_KHR, closest_hit);
            if let Some(any_hit) = &stages.any_hit {
                group.any_hit = plan.push_stage(vk::ShaderStageFlags::ANY_HIT_KHR, any_hit);
            }
            if role.has_intersection() {
                let intersection = stages.intersection.as_ref().ok_or_else(|| missing("intersection"))?;
                group.intersection = plan.push_stage(vk::ShaderStageFlags::INTERSECTION_KHR, intersection);
            }
        }

        plan.groups.push(group);
    }

    Ok(plan)
}

/// Push constant range shared by every stage that reads frame constants.
pub fn push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange::default()
        .stage_flags(RtPushConstants::STAGES)
        .offset(0)
        .size(std::mem::size_of::<RtPushConstants>() as u32)
}

/// A linked ray tracing pipeline with its layout and group registry.
pub struct RtPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub registry: ShaderGroupRegistry,
}

impl RtPipeline {
    pub fn group_count(&self) -> u32 {
        self.registry.len()
    }

    /// Destroy the pipeline and its layout.
    pub unsafe fn destroy(self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

/// Load shaders and link the ray tracing pipeline.
///
/// Set 0 is the ray tracing set, set 1 the caller's scene set. Shader
/// modules are released once the pipeline is linked, whether or not linking
/// succeeded.
#[tracing::instrument(skip_all, fields(groups = registry.len()))]
pub unsafe fn assemble(
    ctx: &VulkanContext,
    loader: &ShaderLoader,
    shaders: &ShaderSet,
    registry: &ShaderGroupRegistry,
    rt_layout: vk::DescriptorSetLayout,
    scene_layout: vk::DescriptorSetLayout,
    recursion_depth: u32,
) -> Result<RtPipeline> {
    registry.validate_for_dispatch()?;
    let plan = plan_stages(registry, shaders)?;

    let mut modules = Vec::with_capacity(plan.stages.len());
    for stage in &plan.stages {
        match loader.create_module(&ctx.device, &stage.path) {
            Ok(module) => modules.push(module),
            Err(e) => {
                destroy_modules(&ctx.device, &modules);
                return Err(e);
            }
        }
    }

    let result = link(ctx, &plan, &modules, rt_layout, scene_layout, recursion_depth);
    destroy_modules(&ctx.device, &modules);

    let (pipeline, layout) = result?;
    tracing::info!(
        stages = plan.stages.len(),
        groups = plan.groups.len(),
        recursion_depth,
        "ray tracing pipeline created"
    );

    Ok(RtPipeline {
        pipeline,
        layout,
        registry: registry.clone(),
    })
}

unsafe fn link(
    ctx: &VulkanContext,
    plan: &PipelinePlan,
    modules: &[vk::ShaderModule],
    rt_layout: vk::DescriptorSetLayout,
    scene_layout: vk::DescriptorSetLayout,
    recursion_depth: u32,
) -> Result<(vk::Pipeline, vk::PipelineLayout)> {
    let stage_infos: Vec<_> = plan.stages.iter().zip(modules)
        .map(|(stage, module)| {
            vk::PipelineShaderStageCreateInfo::default()
                .stage(stage.stage)
                .module(*module)
                .name(c"main")
        })
        .collect();
    let group_infos: Vec<_> = plan.groups.iter().map(GroupPlan::to_vk).collect();

    let push_constant_range = push_constant_range();
    let set_layouts = [rt_layout, scene_layout];
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(std::slice::from_ref(&push_constant_range));

    let layout = ctx.device.create_pipeline_layout(&layout_info, None)
        .map_err(RtError::vk("Failed to create RT pipeline layout"))?;

    let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
        .stages(&stage_infos)
        .groups(&group_infos)
        .max_pipeline_ray_recursion_depth(recursion_depth)
        .layout(layout);

    match ctx.rt_pipeline_loader.create_ray_tracing_pipelines(
        vk::DeferredOperationKHR::null(),
        vk::PipelineCache::null(),
        &[pipeline_info],
        None,
    ) {
        Ok(pipelines) => Ok((pipelines[0], layout)),
        Err((pipelines, e)) => {
            for pipeline in pipelines.into_iter().filter(|p| *p != vk::Pipeline::null()) {
                ctx.device.destroy_pipeline(pipeline, None);
            }
            ctx.device.destroy_pipeline_layout(layout, None);
            Err(RtError::vk("Failed to create RT pipeline")(e))
        }
    }
}

unsafe fn destroy_modules(device: &ash::Device, modules: &[vk::ShaderModule]) {
    for module in modules {
        device.destroy_shader_module(*module, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::raytracing::groups::LightType;
    use crate::vulkan::rt_config::GroupStages;

    // ============================================================
    // Stage planning
    // ============================================================

    #[test]
    fn test_standard_plan() {
        let plan = plan_stages(&ShaderGroupRegistry::standard(), &ShaderSet::standard()).unwrap();
        assert_eq!(plan.groups.len(), 8);
        assert_eq!(plan.stages.len(), 11);

        let raygen = &plan.groups[0];
        assert_eq!(raygen.ty, vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(plan.stages[raygen.general as usize].stage, vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(raygen.closest_hit, vk::SHADER_UNUSED_KHR);

        let shadow_miss = &plan.groups[2];
        assert_eq!(shadow_miss.role, GroupRole::ShadowMiss);
        assert_eq!(
            plan.stages[shadow_miss.general as usize].path,
            PathBuf::from("shaders/raytraceShadow.rmiss.spv")
        );
    }

    #[test]
    fn test_hit_groups() {
        let plan = plan_stages(&ShaderGroupRegistry::standard(), &ShaderSet::standard()).unwrap();

        let triangle = &plan.groups[3];
        assert_eq!(triangle.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(triangle.general, vk::SHADER_UNUSED_KHR);
        assert_eq!(triangle.intersection, vk::SHADER_UNUSED_KHR);
        assert_eq!(plan.stages[triangle.closest_hit as usize].stage, vk::ShaderStageFlags::CLOSEST_HIT_KHR);
        assert_eq!(plan.stages[triangle.any_hit as usize].stage, vk::ShaderStageFlags::ANY_HIT_KHR);

        let procedural = &plan.groups[4];
        assert_eq!(procedural.ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(
            plan.stages[procedural.intersection as usize].stage,
            vk::ShaderStageFlags::INTERSECTION_KHR
        );
        assert_eq!(
            plan.stages[procedural.closest_hit as usize].path,
            PathBuf::from("shaders/raytrace2.rchit.spv")
        );
    }

    #[test]
    fn test_callables_in_light_order() {
        let plan = plan_stages(&ShaderGroupRegistry::standard(), &ShaderSet::standard()).unwrap();
        for light in LightType::ALL {
            let group = &plan.groups[5 + light as usize];
            assert_eq!(group.role, GroupRole::Callable(light));
            assert_eq!(plan.stages[group.general as usize].stage, vk::ShaderStageFlags::CALLABLE_KHR);
        }
    }

    #[test]
    fn test_missing_role_fails() {
        let registry = ShaderGroupRegistry::standard();
        let mut shaders = ShaderSet::default();
        shaders.insert(GroupRole::RayGen, GroupStages::general("a.spv"));
        let err = plan_stages(&registry, &shaders).unwrap_err();
        assert!(matches!(err, RtError::MissingShaderStages(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn test_procedural_without_intersection_fails() {
        let registry = ShaderGroupRegistry::standard();
        let mut shaders = ShaderSet::standard();
        shaders.insert(GroupRole::ProceduralHit, GroupStages::hit("a.rchit.spv", "a.rahit.spv"));
        let err = plan_stages(&registry, &shaders).unwrap_err();
        assert!(err.to_string().contains("intersection"));
    }

    #[test]
    fn test_any_hit_optional() {
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        registry.register(GroupRole::Miss).unwrap();
        registry.register(GroupRole::TriangleHit).unwrap();

        let mut shaders = ShaderSet::default();
        shaders.insert(GroupRole::RayGen, GroupStages::general("r.spv"));
        shaders.insert(GroupRole::Miss, GroupStages::general("m.spv"));
        shaders.insert(
            GroupRole::TriangleHit,
            GroupStages { closest_hit: Some("c.spv".into()), ..Default::default() },
        );

        let plan = plan_stages(&registry, &shaders).unwrap();
        assert_eq!(plan.stages.len(), 3);
        assert_eq!(plan.groups[2].any_hit, vk::SHADER_UNUSED_KHR);
    }

    #[test]
    fn test_group_create_info() {
        let plan = plan_stages(&ShaderGroupRegistry::standard(), &ShaderSet::standard()).unwrap();
        let info = plan.groups[4].to_vk();
        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP);
        assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.intersection_shader, plan.groups[4].intersection);
    }

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_push_constant_range() {
        let range = push_constant_range();
        assert_eq!(range.offset, 0);
        assert_eq!(range.size, 60);
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::CLOSEST_HIT_KHR));
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::MISS_KHR));
        assert!(range.stage_flags.contains(vk::ShaderStageFlags::CALLABLE_KHR));
        assert!(!range.stage_flags.contains(vk::ShaderStageFlags::ANY_HIT_KHR));
    }
}
