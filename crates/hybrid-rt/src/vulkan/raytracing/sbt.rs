//! Shader Binding Table (SBT) management for ray tracing pipelines.

use ash::vk;

use super::groups::{RegionSpan, SbtRegion, ShaderGroupRegistry};
use super::pipeline::RtPipeline;
use crate::error::{Result, RtError};
use crate::vulkan::context::RtCapabilities;
use crate::vulkan::{Buffer, CommandManager, MemoryManager, VulkanContext};

/// Placement of one region inside the SBT buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionLayout {
    pub offset: vk::DeviceSize,
    pub stride: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

/// Byte layout of the SBT, derived from the group registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingTableLayout {
    pub handle_size: u32,
    pub group_count: u32,
    pub total_size: vk::DeviceSize,
    spans: [RegionSpan; 4],
    regions: [RegionLayout; 4],
}

fn region_slot(region: SbtRegion) -> usize {
    match region {
        SbtRegion::RayGen => 0,
        SbtRegion::Miss => 1,
        SbtRegion::Hit => 2,
        SbtRegion::Callable => 3,
    }
}

/// Align a value up to the given alignment.
fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

impl BindingTableLayout {
    /// Handles back to back: group `i` at `i * handle_size`, stride equal to
    /// the handle size, `group_count * handle_size` bytes in total.
    pub fn packed(handle_size: u32, registry: &ShaderGroupRegistry) -> Self {
        let h = handle_size as vk::DeviceSize;
        let spans = SbtRegion::ALL.map(|region| registry.span(region));
        let regions = spans.map(|span| RegionLayout {
            offset: span.first as vk::DeviceSize * h,
            stride: h,
            size: span.count as vk::DeviceSize * h,
        });

        Self {
            handle_size,
            group_count: registry.len(),
            total_size: registry.len() as vk::DeviceSize * h,
            spans,
            regions,
        }
    }

    /// Records padded to `handle_alignment` and each region started on a
    /// `base_alignment` boundary.
    pub fn aligned(handle_size: u32, handle_alignment: u32, base_alignment: u32, registry: &ShaderGroupRegistry) -> Self {
        let stride = align_up(handle_size as vk::DeviceSize, handle_alignment as vk::DeviceSize);
        let spans = SbtRegion::ALL.map(|region| registry.span(region));

        let mut cursor = 0;
        let regions = spans.map(|span| {
            let offset = align_up(cursor, base_alignment as vk::DeviceSize);
            let size = span.count as vk::DeviceSize * stride;
            cursor = offset + size;
            RegionLayout { offset, stride, size }
        });

        Self {
            handle_size,
            group_count: registry.len(),
            total_size: cursor,
            spans,
            regions,
        }
    }

    /// The packed layout when the device's alignment rules allow it,
    /// otherwise the aligned one.
    pub fn for_device(caps: &RtCapabilities, registry: &ShaderGroupRegistry) -> Self {
        let packed = Self::packed(caps.shader_group_handle_size, registry);
        if packed.satisfies(caps.shader_group_handle_alignment, caps.shader_group_base_alignment) {
            return packed;
        }

        tracing::warn!(
            handle_size = caps.shader_group_handle_size,
            handle_alignment = caps.shader_group_handle_alignment,
            base_alignment = caps.shader_group_base_alignment,
            "device alignment forbids a packed SBT, padding regions"
        );
        Self::aligned(
            caps.shader_group_handle_size,
            caps.shader_group_handle_alignment,
            caps.shader_group_base_alignment,
            registry,
        )
    }

    /// Whether strides and non-empty region offsets meet the given alignments.
    pub fn satisfies(&self, handle_alignment: u32, base_alignment: u32) -> bool {
        let handle_alignment = handle_alignment.max(1) as vk::DeviceSize;
        let base_alignment = base_alignment.max(1) as vk::DeviceSize;
        self.regions.iter().filter(|r| r.size > 0).all(|r| {
            r.stride % handle_alignment == 0 && r.offset % base_alignment == 0
        })
    }

    pub fn region(&self, region: SbtRegion) -> RegionLayout {
        self.regions[region_slot(region)]
    }

    /// Byte offset of a group's record.
    pub fn record_offset(&self, group_index: u32) -> Option<vk::DeviceSize> {
        SbtRegion::ALL.iter().find_map(|&region| {
            let span = self.spans[region_slot(region)];
            let layout = self.regions[region_slot(region)];
            (group_index >= span.first && group_index < span.first + span.count)
                .then(|| layout.offset + (group_index - span.first) as vk::DeviceSize * layout.stride)
        })
    }

    /// Lay out `handles` (as returned by the driver, `group_count *
    /// handle_size` bytes) into table bytes.
    pub fn pack(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let h = self.handle_size as usize;
        if handles.len() != self.group_count as usize * h {
            return Err(RtError::Buffer(format!(
                "expected {} bytes of shader group handles, got {}",
                self.group_count as usize * h,
                handles.len()
            )));
        }

        let mut table = vec![0u8; self.total_size as usize];
        for (index, handle) in handles.chunks_exact(h).enumerate() {
            let offset = self.record_offset(index as u32)
                .ok_or_else(|| RtError::GroupLayout(format!("group {} belongs to no region", index)))?
                as usize;
            table[offset..offset + h].copy_from_slice(handle);
        }
        Ok(table)
    }

    /// Read a group's handle back out of table bytes.
    pub fn handle<'a>(&self, table: &'a [u8], group_index: u32) -> Option<&'a [u8]> {
        let offset = self.record_offset(group_index)? as usize;
        table.get(offset..offset + self.handle_size as usize)
    }

    /// Device address regions for `cmd_trace_rays`. Empty regions are zeroed.
    pub fn regions(&self, base_address: vk::DeviceAddress) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        self.regions.map(|r| {
            if r.size == 0 {
                vk::StridedDeviceAddressRegionKHR::default()
            } else {
                vk::StridedDeviceAddressRegionKHR {
                    device_address: base_address + r.offset,
                    stride: r.stride,
                    size: r.size,
                }
            }
        })
    }
}

/// Shader Binding Table for ray tracing.
pub struct ShaderBindingTable {
    pub buffer: Buffer,
    pub layout: BindingTableLayout,
    pub device_address: vk::DeviceAddress,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and upload them to a GPU-only
    /// buffer. Blocks until the upload finishes.
    #[tracing::instrument(skip_all, fields(groups = pipeline.group_count()))]
    pub unsafe fn build(
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        pipeline: &RtPipeline,
    ) -> Result<Self> {
        let caps = &ctx.rt_capabilities;
        let layout = BindingTableLayout::for_device(caps, &pipeline.registry);

        let group_count = pipeline.group_count();
        let handles = ctx.rt_pipeline_loader.get_ray_tracing_shader_group_handles(
            pipeline.pipeline,
            0,
            group_count,
            (group_count * caps.shader_group_handle_size) as usize,
        ).map_err(RtError::vk("Failed to get shader group handles"))?;

        let table = layout.pack(&handles)?;

        let buffer = memory.upload_to_device(
            ctx,
            commands,
            &table,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "shader_binding_table",
        )?;
        let device_address = match buffer.address() {
            Ok(address) => address,
            Err(e) => {
                memory.destroy_buffer(buffer);
                return Err(e);
            }
        };
        ctx.set_object_name(buffer.handle, c"SBT");

        let base_alignment = caps.shader_group_base_alignment.max(1) as vk::DeviceAddress;
        if device_address % base_alignment != 0 {
            tracing::warn!(device_address, base_alignment, "SBT buffer address is not base aligned");
        }

        tracing::info!(size = layout.total_size, handle_size = layout.handle_size, "shader binding table created");

        Ok(Self {
            buffer,
            layout,
            device_address,
        })
    }

    /// Raygen, miss, hit and callable regions.
    pub fn regions(&self) -> [vk::StridedDeviceAddressRegionKHR; 4] {
        self.layout.regions(self.device_address)
    }

    /// Destroy the shader binding table.
    pub unsafe fn destroy(self, memory: &MemoryManager) {
        memory.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vulkan::raytracing::groups::GroupRole;

    fn fake_handles(count: u32, handle_size: u32) -> Vec<u8> {
        (0..count)
            .flat_map(|g| (0..handle_size).map(move |b| (g * 16 + b % 16) as u8))
            .collect()
    }

    // ============================================================
    // Packed layout
    // ============================================================

    #[test]
    fn test_packed_offsets_follow_group_index() {
        let registry = ShaderGroupRegistry::standard();
        for h in [16u32, 32, 64] {
            let layout = BindingTableLayout::packed(h, &registry);
            let h = h as vk::DeviceSize;
            assert_eq!(layout.region(SbtRegion::RayGen).offset, 0);
            assert_eq!(layout.region(SbtRegion::Miss).offset, h);
            assert_eq!(layout.region(SbtRegion::Hit).offset, 3 * h);
            assert_eq!(layout.region(SbtRegion::Callable).offset, 5 * h);
            for region in SbtRegion::ALL {
                assert_eq!(layout.region(region).stride, h);
            }
        }
    }

    #[test]
    fn test_eight_groups_of_32_bytes() {
        let layout = BindingTableLayout::packed(32, &ShaderGroupRegistry::standard());
        assert_eq!(layout.total_size, 256);
        let callable = layout.region(SbtRegion::Callable);
        assert_eq!(callable.offset, 160);
        assert_eq!(callable.size, 96);
        assert_eq!(layout.region(SbtRegion::RayGen).size, 32);
        assert_eq!(layout.region(SbtRegion::Miss).size, 64);
        assert_eq!(layout.region(SbtRegion::Hit).size, 64);
    }

    #[test]
    fn test_pack_round_trip() {
        let registry = ShaderGroupRegistry::standard();
        let layout = BindingTableLayout::packed(32, &registry);
        let handles = fake_handles(8, 32);
        let table = layout.pack(&handles).unwrap();
        assert_eq!(table, handles);
        for g in 0..8u32 {
            let expected = &handles[g as usize * 32..(g as usize + 1) * 32];
            assert_eq!(layout.handle(&table, g), Some(expected));
        }
        assert_eq!(layout.handle(&table, 8), None);
    }

    #[test]
    fn test_pack_rejects_wrong_length() {
        let layout = BindingTableLayout::packed(32, &ShaderGroupRegistry::standard());
        let err = layout.pack(&fake_handles(7, 32)).unwrap_err();
        assert!(matches!(err, RtError::Buffer(_)));
    }

    #[test]
    fn test_regions_from_base_address() {
        let layout = BindingTableLayout::packed(32, &ShaderGroupRegistry::standard());
        let [raygen, miss, hit, callable] = layout.regions(0x10000);
        assert_eq!(raygen.device_address, 0x10000);
        assert_eq!(raygen.size, raygen.stride);
        assert_eq!(miss.device_address, 0x10000 + 32);
        assert_eq!(hit.device_address, 0x10000 + 96);
        assert_eq!(callable.device_address, 0x10000 + 160);
        assert_eq!(callable.size, 96);
    }

    #[test]
    fn test_empty_region_is_zeroed() {
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        registry.register(GroupRole::Miss).unwrap();
        registry.register(GroupRole::TriangleHit).unwrap();
        let layout = BindingTableLayout::packed(32, &registry);
        let callable = layout.regions(0x1000)[3];
        assert_eq!(callable.device_address, 0);
        assert_eq!(callable.size, 0);
        assert_eq!(layout.total_size, 96);
    }

    // ============================================================
    // Device alignment
    // ============================================================

    #[test]
    fn test_aligned_layout() {
        let registry = ShaderGroupRegistry::standard();
        let layout = BindingTableLayout::aligned(32, 32, 64, &registry);
        assert_eq!(layout.region(SbtRegion::RayGen).offset, 0);
        assert_eq!(layout.region(SbtRegion::Miss).offset, 64);
        assert_eq!(layout.region(SbtRegion::Hit).offset, 128);
        assert_eq!(layout.region(SbtRegion::Callable).offset, 192);
        assert_eq!(layout.total_size, 288);
        assert!(layout.satisfies(32, 64));

        let handles = fake_handles(8, 32);
        let table = layout.pack(&handles).unwrap();
        for g in 0..8u32 {
            let expected = &handles[g as usize * 32..(g as usize + 1) * 32];
            assert_eq!(layout.handle(&table, g), Some(expected));
        }
    }

    #[test]
    fn test_for_device_prefers_packed() {
        let registry = ShaderGroupRegistry::standard();
        let caps = RtCapabilities {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 32,
            ..Default::default()
        };
        let layout = BindingTableLayout::for_device(&caps, &registry);
        assert_eq!(layout, BindingTableLayout::packed(32, &registry));
    }

    #[test]
    fn test_for_device_falls_back_to_aligned() {
        let registry = ShaderGroupRegistry::standard();
        let caps = RtCapabilities {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            ..Default::default()
        };
        let layout = BindingTableLayout::for_device(&caps, &registry);
        assert!(layout.satisfies(32, 64));
        assert_eq!(layout, BindingTableLayout::aligned(32, 32, 64, &registry));
    }

    #[test]
    fn test_record_offsets() {
        let layout = BindingTableLayout::packed(32, &ShaderGroupRegistry::standard());
        assert_eq!(layout.record_offset(0), Some(0));
        assert_eq!(layout.record_offset(4), Some(128));
        assert_eq!(layout.record_offset(7), Some(224));
        assert_eq!(layout.record_offset(8), None);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(33, 32), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(5, 0), 5);
    }
}
