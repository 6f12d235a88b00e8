//! Acceleration structure management for ray tracing.
//!
//! Bottom-level structures are built once per scene load: one per triangle
//! mesh, plus one aggregate over every implicit primitive. The single
//! top-level structure is rebuilt whenever instances change.

use ash::vk;
use ash::khr::acceleration_structure;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;

use super::geometry::{
    describe_implicit_set, describe_triangle_mesh, transform_from_cols, GeometryDescriptor, ImplicitSet, Transform,
    TriangleMesh, IDENTITY_TRANSFORM,
};
use super::groups::{GroupRole, ShaderGroupRegistry};
use crate::error::{Result, RtError};
use crate::vulkan::{Buffer, CommandManager, MemoryManager, RtCapabilities, VulkanContext};

/// Geometry stored in a BLAS. A BLAS never mixes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlasKind {
    Triangles,
    Aabbs,
}

impl From<&GeometryDescriptor> for BlasKind {
    fn from(desc: &GeometryDescriptor) -> Self {
        if desc.is_triangles() {
            BlasKind::Triangles
        } else {
            BlasKind::Aabbs
        }
    }
}

/// Bottom-level acceleration structure (BLAS).
pub struct Blas {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub kind: BlasKind,
    pub primitive_count: u32,
}

/// Top-level acceleration structure (TLAS).
pub struct Tlas {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: Buffer,
    pub device_address: vk::DeviceAddress,
    pub instance_count: u32,
}

/// Instance data for TLAS building, laid out as
/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RtInstance {
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl Default for RtInstance {
    fn default() -> Self {
        Self {
            transform: IDENTITY_TRANSFORM,
            instance_custom_index_and_mask: 0xFF << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: 0,
        }
    }
}

impl RtInstance {
    /// Create a new instance with the given transform and BLAS reference.
    pub fn new(transform: Transform, custom_index: u32, blas_address: vk::DeviceAddress) -> Self {
        Self {
            transform,
            instance_custom_index_and_mask: (0xFF << 24) | (custom_index & 0xFFFFFF),
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: blas_address,
        }
    }

    /// Set the visibility mask.
    pub fn with_mask(mut self, mask: u8) -> Self {
        self.instance_custom_index_and_mask =
            ((mask as u32) << 24) | (self.instance_custom_index_and_mask & 0xFFFFFF);
        self
    }

    /// Set the SBT offset and flags.
    pub fn with_sbt_offset(mut self, offset: u32, flags: vk::GeometryInstanceFlagsKHR) -> Self {
        self.instance_shader_binding_table_record_offset_and_flags =
            ((flags.as_raw() as u32) << 24) | (offset & 0xFFFFFF);
        self
    }

    pub fn custom_index(&self) -> u32 {
        self.instance_custom_index_and_mask & 0xFFFFFF
    }

    pub fn sbt_offset(&self) -> u32 {
        self.instance_shader_binding_table_record_offset_and_flags & 0xFFFFFF
    }
}

/// One placement of a mesh BLAS in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub transform: Transform,
    /// Index of the mesh BLAS (same as the mesh's position in the batch list)
    pub object_index: u32,
}

impl MeshInstance {
    /// Place mesh `object_index` with a column-major 4x4 model matrix.
    pub fn from_matrix(object_index: u32, model: [[f32; 4]; 4]) -> Self {
        Self { transform: transform_from_cols(model), object_index }
    }
}

/// The aggregate BLAS of implicit primitives, placed once in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImplicitInstance {
    pub blas_index: u32,
    pub transform: Transform,
}

/// One TLAS instance before BLAS addresses are resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceRecord {
    pub transform: Transform,
    pub blas_index: u32,
    /// `gl_InstanceCustomIndexEXT` in shaders
    pub instance_id: u32,
    /// Record offset in the hit region of the SBT
    pub hit_group: u32,
    pub mask: u8,
    pub flags: vk::GeometryInstanceFlagsKHR,
}

impl InstanceRecord {
    /// Wire-format instance referencing the BLAS at `blas_address`.
    pub fn to_rt_instance(&self, blas_address: vk::DeviceAddress) -> RtInstance {
        RtInstance::new(self.transform, self.instance_id, blas_address)
            .with_mask(self.mask)
            .with_sbt_offset(self.hit_group, self.flags)
    }
}

/// Geometry descriptors for a BLAS build, in build order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BottomLevelPlan {
    pub descriptors: Vec<GeometryDescriptor>,
    /// Index of the aggregate implicit BLAS, if one is built
    pub implicit_blas: Option<u32>,
}

impl BottomLevelPlan {
    pub fn kinds(&self) -> Vec<BlasKind> {
        self.descriptors.iter().map(BlasKind::from).collect()
    }
}

/// Describe every mesh in order, then the implicit aggregate when the set
/// has any elements.
pub fn plan_bottom_level(meshes: &[TriangleMesh], implicit: &ImplicitSet) -> Result<BottomLevelPlan> {
    let mut descriptors = meshes.iter()
        .map(describe_triangle_mesh)
        .collect::<Result<Vec<_>>>()?;

    let implicit_blas = if implicit.is_empty() {
        None
    } else {
        descriptors.push(describe_implicit_set(implicit)?);
        Some(descriptors.len() as u32 - 1)
    };

    Ok(BottomLevelPlan { descriptors, implicit_blas })
}

/// Instance records for the TLAS.
///
/// Mesh instances come first, numbered by position and bound to the
/// triangle hit group. The implicit aggregate, when present, is appended
/// last with its BLAS index as id and the procedural hit group.
pub fn plan_instances(
    meshes: &[MeshInstance],
    implicit: Option<ImplicitInstance>,
    registry: &ShaderGroupRegistry,
) -> Result<Vec<InstanceRecord>> {
    let hit_record = |role: GroupRole| {
        registry.hit_record(role)
            .ok_or_else(|| RtError::GroupLayout(format!("no {} group registered", role)))
    };

    let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
    let mut records = Vec::with_capacity(meshes.len() + 1);

    if !meshes.is_empty() {
        let triangle_hit = hit_record(GroupRole::TriangleHit)?;
        records.extend(meshes.iter().enumerate().map(|(i, mesh)| InstanceRecord {
            transform: mesh.transform,
            blas_index: mesh.object_index,
            instance_id: i as u32,
            hit_group: triangle_hit,
            mask: 0xFF,
            flags,
        }));
    }

    if let Some(aggregate) = implicit {
        records.push(InstanceRecord {
            transform: aggregate.transform,
            blas_index: aggregate.blas_index,
            instance_id: aggregate.blas_index,
            hit_group: hit_record(GroupRole::ProceduralHit)?,
            mask: 0xFF,
            flags,
        });
    }

    Ok(records)
}

/// Check that every record references an existing BLAS through a hit group
/// able to handle its geometry.
pub fn validate_instances(
    records: &[InstanceRecord],
    blas_kinds: &[BlasKind],
    registry: &ShaderGroupRegistry,
) -> Result<()> {
    for (i, record) in records.iter().enumerate() {
        let kind = blas_kinds.get(record.blas_index as usize).ok_or_else(|| {
            RtError::geometry(format!(
                "instance {} references BLAS {} but only {} exist",
                i,
                record.blas_index,
                blas_kinds.len()
            ))
        })?;
        let role = registry.hit_role(record.hit_group).ok_or_else(|| {
            RtError::GroupLayout(format!("instance {} uses unknown hit group {}", i, record.hit_group))
        })?;

        match (kind, role.has_intersection()) {
            (BlasKind::Aabbs, false) => {
                return Err(RtError::GroupLayout(format!(
                    "instance {} references AABB geometry through {} which has no intersection shader",
                    i, role
                )));
            }
            (BlasKind::Triangles, true) => {
                return Err(RtError::GroupLayout(format!(
                    "instance {} references triangle geometry through procedural group {}",
                    i, role
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Check every planned BLAS against the device's per-geometry limits.
///
/// Each BLAS holds a single geometry, so only the primitive count can
/// exceed a limit. A zero limit means the device did not report one.
pub fn check_limits(plan: &BottomLevelPlan, caps: &RtCapabilities) -> Result<()> {
    if caps.max_primitive_count == 0 {
        return Ok(());
    }
    for (i, desc) in plan.descriptors.iter().enumerate() {
        if u64::from(desc.primitive_count) > caps.max_primitive_count {
            return Err(RtError::geometry(format!(
                "BLAS {} has {} primitives, device limit is {}",
                i, desc.primitive_count, caps.max_primitive_count
            )));
        }
    }
    Ok(())
}

fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Builds and owns the scene's acceleration structures.
pub struct AccelerationStructureBuilder {
    loader: acceleration_structure::Device,
    device: ash::Device,
    blas: Vec<Blas>,
    tlas: Option<Tlas>,
    implicit_blas: Option<u32>,
    compact: bool,
    scratch_alignment: vk::DeviceSize,
}

impl AccelerationStructureBuilder {
    /// Create a builder on the context's device.
    pub fn new(ctx: &VulkanContext, compact: bool) -> Self {
        Self {
            loader: ctx.accel_struct_loader.clone(),
            device: ctx.device.clone(),
            blas: Vec::new(),
            tlas: None,
            implicit_blas: None,
            compact,
            scratch_alignment: ctx.rt_capabilities.min_scratch_offset_alignment.max(1) as vk::DeviceSize,
        }
    }

    pub fn blas(&self) -> &[Blas] {
        &self.blas
    }

    pub fn tlas(&self) -> Option<&Tlas> {
        self.tlas.as_ref()
    }

    /// Index of the aggregate implicit BLAS from the last BLAS build.
    pub fn implicit_blas(&self) -> Option<u32> {
        self.implicit_blas
    }

    pub fn blas_kinds(&self) -> Vec<BlasKind> {
        self.blas.iter().map(|b| b.kind).collect()
    }

    /// Build one BLAS per planned descriptor, replacing any previous set.
    ///
    /// All builds are recorded into one command buffer sharing a scratch
    /// buffer, and this call blocks until they finish. On failure nothing
    /// from this call survives.
    #[tracing::instrument(skip_all, fields(count = plan.descriptors.len()))]
    pub unsafe fn build_blas(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        plan: &BottomLevelPlan,
    ) -> Result<()> {
        self.destroy_blas(memory);

        if plan.descriptors.is_empty() {
            tracing::warn!("no geometry to build bottom-level structures from");
            return Ok(());
        }

        check_limits(plan, &ctx.rt_capabilities)?;

        let mut built = Vec::with_capacity(plan.descriptors.len());
        match self.build_blas_inner(ctx, memory, commands, plan, &mut built) {
            Ok(()) => {
                self.blas = built;
                self.implicit_blas = plan.implicit_blas;
                tracing::info!(
                    blas = self.blas.len(),
                    implicit = ?self.implicit_blas,
                    "bottom-level acceleration structures built"
                );
                Ok(())
            }
            Err(e) => {
                for blas in built {
                    self.destroy_structure(memory, blas.handle, blas.buffer);
                }
                Err(e)
            }
        }
    }

    unsafe fn build_blas_inner(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        plan: &BottomLevelPlan,
        built: &mut Vec<Blas>,
    ) -> Result<()> {
        let mut flags = vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
        if self.compact {
            flags |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
        }

        let geometries: Vec<[vk::AccelerationStructureGeometryKHR<'static>; 1]> =
            plan.descriptors.iter().map(|d| [d.to_vk()]).collect();
        let ranges: Vec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]> =
            plan.descriptors.iter().map(|d| [d.build_range()]).collect();

        let mut scratch_size = 0;
        for (desc, geometry) in plan.descriptors.iter().zip(&geometries) {
            let size_query = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(flags)
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .geometries(geometry);

            let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
            self.loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &size_query,
                &[desc.primitive_count],
                &mut size_info,
            );

            let (handle, buffer) = self.create_structure(
                memory,
                size_info.acceleration_structure_size,
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                "blas_buffer",
            )?;
            built.push(Blas {
                handle,
                buffer,
                device_address: 0,
                kind: BlasKind::from(desc),
                primitive_count: desc.primitive_count,
            });

            scratch_size = scratch_size.max(size_info.build_scratch_size);
        }

        tracing::debug!(scratch_size, "shared BLAS scratch buffer");

        // Every build reuses one scratch buffer, so they run back to back
        // with a barrier in between.
        let scratch = memory.create_buffer(
            scratch_size + self.scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch",
        )?;
        let scratch_address = match scratch.address() {
            Ok(address) => align_up(address, self.scratch_alignment),
            Err(e) => {
                memory.destroy_buffer(scratch);
                return Err(e);
            }
        };

        let query_pool = if self.compact {
            let pool_info = vk::QueryPoolCreateInfo::default()
                .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
                .query_count(built.len() as u32);
            match self.device.create_query_pool(&pool_info, None) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    memory.destroy_buffer(scratch);
                    return Err(RtError::vk("Failed to create compaction query pool")(e));
                }
            }
        } else {
            None
        };

        let build_infos: Vec<_> = built.iter().zip(&geometries)
            .map(|(blas, geometry)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(flags)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas.handle)
                    .geometries(geometry)
                    .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address })
            })
            .collect();
        let handles: Vec<_> = built.iter().map(|b| b.handle).collect();

        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            );

        let recorded = commands.run_single_time(ctx, |cmd| {
            if let Some(pool) = query_pool {
                self.device.cmd_reset_query_pool(cmd, pool, 0, handles.len() as u32);
            }
            for (info, range) in build_infos.iter().zip(&ranges) {
                self.loader.cmd_build_acceleration_structures(cmd, std::slice::from_ref(info), &[range.as_slice()]);
                self.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::DependencyFlags::empty(),
                    &[barrier],
                    &[],
                    &[],
                );
            }
            if let Some(pool) = query_pool {
                self.loader.cmd_write_acceleration_structures_properties(
                    cmd,
                    &handles,
                    vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                    pool,
                    0,
                );
            }
        });

        memory.destroy_buffer(scratch);

        let result = recorded.and_then(|()| match query_pool {
            Some(pool) => self.compact_blas(ctx, memory, commands, pool, built),
            None => Ok(()),
        });
        if let Some(pool) = query_pool {
            self.device.destroy_query_pool(pool, None);
        }
        result?;

        for blas in built.iter_mut() {
            blas.device_address = self.device_address(blas.handle);
        }
        Ok(())
    }

    /// Replace each built BLAS with a compacted copy.
    unsafe fn compact_blas(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        query_pool: vk::QueryPool,
        built: &mut [Blas],
    ) -> Result<()> {
        let mut sizes = vec![0u64; built.len()];
        self.device.get_query_pool_results(
            query_pool,
            0,
            &mut sizes,
            vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
        ).map_err(RtError::vk("Failed to read compacted BLAS sizes"))?;

        let mut compacted: Vec<(vk::AccelerationStructureKHR, Buffer)> = Vec::with_capacity(built.len());
        for &size in &sizes {
            match self.create_structure(memory, size, vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, "blas_compacted") {
                Ok(pair) => compacted.push(pair),
                Err(e) => {
                    for (handle, buffer) in compacted {
                        self.destroy_structure(memory, handle, buffer);
                    }
                    return Err(e);
                }
            }
        }

        let copied = commands.run_single_time(ctx, |cmd| {
            for (blas, (dst, _)) in built.iter().zip(&compacted) {
                let copy_info = vk::CopyAccelerationStructureInfoKHR::default()
                    .src(blas.handle)
                    .dst(*dst)
                    .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
                self.loader.cmd_copy_acceleration_structure(cmd, &copy_info);
            }
        });
        if let Err(e) = copied {
            for (handle, buffer) in compacted {
                self.destroy_structure(memory, handle, buffer);
            }
            return Err(e);
        }

        let before: u64 = built.iter().map(|b| b.buffer.size).sum();
        for (blas, (handle, buffer)) in built.iter_mut().zip(compacted) {
            let old_handle = std::mem::replace(&mut blas.handle, handle);
            let old_buffer = std::mem::replace(&mut blas.buffer, buffer);
            self.destroy_structure(memory, old_handle, old_buffer);
        }
        tracing::debug!(before, after = sizes.iter().sum::<u64>(), "compacted BLAS");
        Ok(())
    }

    /// Build the TLAS over `records`, destroying the previous one first.
    #[tracing::instrument(skip_all, fields(instances = records.len()))]
    pub unsafe fn build_tlas(
        &mut self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        records: &[InstanceRecord],
        registry: &ShaderGroupRegistry,
    ) -> Result<()> {
        if let Some(old) = self.tlas.take() {
            self.destroy_structure(memory, old.handle, old.buffer);
        }

        if records.is_empty() {
            return Err(RtError::geometry("top-level structure needs at least one instance"));
        }
        let caps = &ctx.rt_capabilities;
        if caps.max_instance_count > 0 && records.len() as u64 > caps.max_instance_count {
            return Err(RtError::geometry(format!(
                "{} instances exceed device limit {}",
                records.len(),
                caps.max_instance_count
            )));
        }
        validate_instances(records, &self.blas_kinds(), registry)?;

        let instances: Vec<RtInstance> = records.iter()
            .map(|r| r.to_rt_instance(self.blas[r.blas_index as usize].device_address))
            .collect();
        let instance_count = instances.len() as u32;

        let instance_buffer = memory.create_host_buffer(
            bytemuck::cast_slice(&instances),
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            "tlas_instances",
        )?;

        let result = instance_buffer.address()
            .and_then(|address| self.build_tlas_inner(ctx, memory, commands, address, instance_count));

        // Instance data is only read during the build.
        memory.destroy_buffer(instance_buffer);

        self.tlas = Some(result?);
        tracing::info!(instance_count, "top-level acceleration structure built");
        Ok(())
    }

    unsafe fn build_tlas_inner(
        &self,
        ctx: &VulkanContext,
        memory: &MemoryManager,
        commands: &CommandManager,
        instance_address: vk::DeviceAddress,
        instance_count: u32,
    ) -> Result<Tlas> {
        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        self.loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[instance_count],
            &mut size_info,
        );

        let (handle, buffer) = self.create_structure(
            memory,
            size_info.acceleration_structure_size,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            "tlas_buffer",
        )?;

        let scratch = match memory.create_buffer(
            size_info.build_scratch_size + self.scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            "as_scratch",
        ) {
            Ok(scratch) => scratch,
            Err(e) => {
                self.destroy_structure(memory, handle, buffer);
                return Err(e);
            }
        };

        let built = scratch.address().and_then(|address| {
            let build_info = build_info
                .dst_acceleration_structure(handle)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: align_up(address, self.scratch_alignment),
                });

            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(instance_count);
            let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

            commands.run_single_time(ctx, |cmd| {
                self.loader.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
            })
        });

        memory.destroy_buffer(scratch);

        match built {
            Ok(()) => Ok(Tlas {
                handle,
                device_address: self.device_address(handle),
                buffer,
                instance_count,
            }),
            Err(e) => {
                self.destroy_structure(memory, handle, buffer);
                Err(e)
            }
        }
    }

    /// Create an acceleration structure and its backing buffer.
    unsafe fn create_structure(
        &self,
        memory: &MemoryManager,
        size: vk::DeviceSize,
        ty: vk::AccelerationStructureTypeKHR,
        name: &str,
    ) -> Result<(vk::AccelerationStructureKHR, Buffer)> {
        let buffer = memory.create_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR |
            vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            MemoryLocation::GpuOnly,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(size)
            .ty(ty);

        match self.loader.create_acceleration_structure(&create_info, None) {
            Ok(handle) => Ok((handle, buffer)),
            Err(e) => {
                memory.destroy_buffer(buffer);
                Err(RtError::vk("Failed to create acceleration structure")(e))
            }
        }
    }

    unsafe fn device_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        self.loader.get_acceleration_structure_device_address(&addr_info)
    }

    unsafe fn destroy_structure(&self, memory: &MemoryManager, handle: vk::AccelerationStructureKHR, buffer: Buffer) {
        self.loader.destroy_acceleration_structure(handle, None);
        memory.destroy_buffer(buffer);
    }

    unsafe fn destroy_blas(&mut self, memory: &MemoryManager) {
        for blas in std::mem::take(&mut self.blas) {
            self.destroy_structure(memory, blas.handle, blas.buffer);
        }
        self.implicit_blas = None;
    }

    /// Destroy all acceleration structures, TLAS first.
    pub unsafe fn destroy(&mut self, memory: &MemoryManager) {
        if let Some(tlas) = self.tlas.take() {
            self.destroy_structure(memory, tlas.handle, tlas.buffer);
        }
        self.destroy_blas(memory);
    }
}
