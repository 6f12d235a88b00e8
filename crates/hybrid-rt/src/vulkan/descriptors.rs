//! Descriptor set helpers and the ray tracing descriptor set.

use ash::vk;

use super::VulkanContext;
use crate::error::{Result, RtError};

/// Binding slot of the top-level acceleration structure in the RT set.
pub const RT_BINDING_TLAS: u32 = 0;
/// Binding slot of the storage image written by raygen in the RT set.
pub const RT_BINDING_OUTPUT: u32 = 1;

/// Ordered list of descriptor bindings, from which layouts, pools and
/// writes are derived.
#[derive(Debug, Clone, Default)]
pub struct DescriptorBindings {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a binding. Re-declaring a slot replaces it.
    pub fn add_binding(
        &mut self,
        binding: u32,
        ty: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> &mut Self {
        self.bindings.retain(|b| b.binding != binding);
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(ty)
                .descriptor_count(count)
                .stage_flags(stages),
        );
        self
    }

    /// All declared bindings, in declaration order.
    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    /// Pool sizes able to hold `max_sets` sets of this layout.
    ///
    /// Bindings of the same type are merged into one entry.
    pub fn pool_sizes(&self, max_sets: u32) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in &self.bindings {
            let count = b.descriptor_count * max_sets;
            match sizes.iter_mut().find(|s| s.ty == b.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize { ty: b.descriptor_type, descriptor_count: count }),
            }
        }
        sizes
    }

    /// Create a descriptor set layout from the declared bindings.
    pub unsafe fn create_layout(&self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default()
            .bindings(&self.bindings);

        device.create_descriptor_set_layout(&layout_info, None)
            .map_err(RtError::vk("Failed to create descriptor set layout"))
    }

    /// Create a pool sized for `max_sets` sets of this layout.
    pub unsafe fn create_pool(&self, device: &ash::Device, max_sets: u32) -> Result<vk::DescriptorPool> {
        let pool_sizes = self.pool_sizes(max_sets);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .pool_sizes(&pool_sizes)
            .max_sets(max_sets);

        device.create_descriptor_pool(&pool_info, None)
            .map_err(RtError::vk("Failed to create descriptor pool"))
    }
}

/// Descriptor set 0 of the ray tracing pipeline: TLAS and output image.
pub struct RtDescriptorSet {
    pub layout: vk::DescriptorSetLayout,
    pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    device: ash::Device,
}

impl RtDescriptorSet {
    /// Bindings used by the ray tracing set.
    pub fn rt_bindings() -> DescriptorBindings {
        let mut bindings = DescriptorBindings::new();
        bindings
            .add_binding(
                RT_BINDING_TLAS,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                1,
                vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR,
            )
            .add_binding(
                RT_BINDING_OUTPUT,
                vk::DescriptorType::STORAGE_IMAGE,
                1,
                vk::ShaderStageFlags::RAYGEN_KHR,
            );
        bindings
    }

    /// Create the layout, pool and the single set. Nothing is written yet.
    pub unsafe fn new(ctx: &VulkanContext) -> Result<Self> {
        let bindings = Self::rt_bindings();
        let layout = bindings.create_layout(&ctx.device)?;
        let pool = match bindings.create_pool(&ctx.device, 1) {
            Ok(pool) => pool,
            Err(e) => {
                ctx.device.destroy_descriptor_set_layout(layout, None);
                return Err(e);
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let set = match ctx.device.allocate_descriptor_sets(&alloc_info) {
            Ok(sets) => sets[0],
            Err(e) => {
                ctx.device.destroy_descriptor_pool(pool, None);
                ctx.device.destroy_descriptor_set_layout(layout, None);
                return Err(RtError::vk("Failed to allocate RT descriptor set")(e));
            }
        };

        Ok(Self {
            layout,
            pool,
            set,
            device: ctx.device.clone(),
        })
    }

    /// Point binding 0 at a top-level acceleration structure.
    pub unsafe fn write_acceleration_structure(&self, tlas: vk::AccelerationStructureKHR) {
        let structures = [tlas];
        let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
            .acceleration_structures(&structures);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(RT_BINDING_TLAS)
            .dst_array_element(0)
            .descriptor_count(1)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut as_info);

        self.device.update_descriptor_sets(&[write], &[]);
    }

    /// Point binding 1 at the output storage image (expected in `GENERAL`).
    pub unsafe fn write_output_image(&self, output_view: vk::ImageView) {
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: output_view,
            image_layout: vk::ImageLayout::GENERAL,
        };

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(RT_BINDING_OUTPUT)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info));

        self.device.update_descriptor_sets(&[write], &[]);
    }

    /// Destroy the pool (freeing the set) and the layout.
    pub unsafe fn destroy(&mut self) {
        self.device.destroy_descriptor_pool(self.pool, None);
        self.device.destroy_descriptor_set_layout(self.layout, None);
        self.pool = vk::DescriptorPool::null();
        self.layout = vk::DescriptorSetLayout::null();
        self.set = vk::DescriptorSet::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // DescriptorBindings
    // ============================================================

    #[test]
    fn test_rt_bindings_layout() {
        let bindings = RtDescriptorSet::rt_bindings();
        assert_eq!(bindings.bindings().len(), 2);

        let tlas = &bindings.bindings()[0];
        assert_eq!(tlas.binding, RT_BINDING_TLAS);
        assert_eq!(tlas.descriptor_type, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR);
        assert_eq!(
            tlas.stage_flags,
            vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR
        );

        let output = &bindings.bindings()[1];
        assert_eq!(output.binding, RT_BINDING_OUTPUT);
        assert_eq!(output.descriptor_type, vk::DescriptorType::STORAGE_IMAGE);
        assert_eq!(output.stage_flags, vk::ShaderStageFlags::RAYGEN_KHR);
    }

    #[test]
    fn test_pool_sizes_per_type() {
        let sizes = RtDescriptorSet::rt_bindings().pool_sizes(1);
        assert_eq!(sizes.len(), 2);
        assert!(sizes.iter().all(|s| s.descriptor_count == 1));
    }

    #[test]
    fn test_pool_sizes_merge_same_type() {
        let mut bindings = DescriptorBindings::new();
        bindings
            .add_binding(0, vk::DescriptorType::STORAGE_BUFFER, 2, vk::ShaderStageFlags::RAYGEN_KHR)
            .add_binding(1, vk::DescriptorType::STORAGE_BUFFER, 3, vk::ShaderStageFlags::RAYGEN_KHR);
        let sizes = bindings.pool_sizes(4);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].descriptor_count, 20);
    }

    #[test]
    fn test_redeclared_binding_replaces() {
        let mut bindings = DescriptorBindings::new();
        bindings
            .add_binding(0, vk::DescriptorType::STORAGE_IMAGE, 1, vk::ShaderStageFlags::RAYGEN_KHR)
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::RAYGEN_KHR);
        assert_eq!(bindings.bindings().len(), 1);
        assert_eq!(bindings.bindings()[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }
}
