//! Geometry descriptors for bottom-level acceleration structure builds.
//!
//! Primitive batches live in GPU buffers owned by the scene; this module
//! only turns their metadata into the geometry and build-range records the
//! acceleration structure builder submits.

use ash::vk;

use crate::error::{Result, RtError};

/// Row-major 3x4 affine transform, as stored in a TLAS instance.
pub type Transform = [[f32; 4]; 3];

/// Identity transform.
pub const IDENTITY_TRANSFORM: Transform = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
];

/// Convert a column-major 4x4 matrix to the row-major 3x4 instance layout.
pub fn transform_from_cols(cols: [[f32; 4]; 4]) -> Transform {
    let mut t = [[0.0; 4]; 3];
    for (row, out) in t.iter_mut().enumerate() {
        for (col, value) in out.iter_mut().enumerate() {
            *value = cols[col][row];
        }
    }
    t
}

/// Indexed triangle mesh resident on the GPU (u32 indices).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleMesh {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub vertex_count: u32,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
}

impl TriangleMesh {
    /// Mesh with `R32G32B32_SFLOAT` positions at the start of each vertex.
    pub fn new(
        vertex_address: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_count: u32,
        index_address: vk::DeviceAddress,
        index_count: u32,
    ) -> Self {
        Self {
            vertex_address,
            vertex_stride,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            vertex_count,
            index_address,
            index_count,
        }
    }
}

/// Set of implicit primitives: one AABB per element, resolved by an
/// intersection shader. All elements go into a single aggregate BLAS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImplicitSet {
    pub aabb_address: vk::DeviceAddress,
    pub aabb_stride: vk::DeviceSize,
    pub count: u32,
    pub transform: Transform,
}

impl ImplicitSet {
    /// An empty set: no aggregate BLAS and no synthetic instance.
    pub fn empty() -> Self {
        Self {
            aabb_address: 0,
            aabb_stride: 0,
            count: 0,
            transform: IDENTITY_TRANSFORM,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Kind-specific part of a geometry descriptor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeometryKind {
    Triangles {
        vertex_address: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        vertex_format: vk::Format,
        max_vertex: u32,
        index_address: vk::DeviceAddress,
    },
    Aabbs {
        data_address: vk::DeviceAddress,
        stride: vk::DeviceSize,
    },
}

/// Geometry of one BLAS, derived fresh from a primitive batch for each build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometryDescriptor {
    pub kind: GeometryKind,
    pub primitive_count: u32,
    pub flags: vk::GeometryFlagsKHR,
}

impl GeometryDescriptor {
    pub fn is_triangles(&self) -> bool {
        matches!(self.kind, GeometryKind::Triangles { .. })
    }

    /// Vulkan geometry record for the build.
    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match self.kind {
            GeometryKind::Triangles { vertex_address, vertex_stride, vertex_format, max_vertex, index_address } => {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vertex_format)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: vertex_address })
                    .vertex_stride(vertex_stride)
                    .max_vertex(max_vertex)
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR { device_address: index_address });

                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(self.flags)
            }
            GeometryKind::Aabbs { data_address, stride } => {
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR::default()
                    .data(vk::DeviceOrHostAddressConstKHR { device_address: data_address })
                    .stride(stride);

                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::AABBS)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { aabbs })
                    .flags(self.flags)
            }
        }
    }

    /// Build range covering every primitive.
    pub fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}

/// Describe an indexed triangle mesh.
///
/// Any-hit shaders run on this geometry, so duplicate any-hit invocations
/// are suppressed.
pub fn describe_triangle_mesh(mesh: &TriangleMesh) -> Result<GeometryDescriptor> {
    if mesh.index_count == 0 {
        return Err(RtError::geometry("triangle mesh has no indices"));
    }
    if mesh.index_count % 3 != 0 {
        return Err(RtError::geometry(format!(
            "index count {} is not a multiple of 3",
            mesh.index_count
        )));
    }
    if mesh.vertex_count == 0 {
        return Err(RtError::geometry("triangle mesh has no vertices"));
    }
    if mesh.vertex_stride == 0 {
        return Err(RtError::geometry("vertex stride is zero"));
    }
    if mesh.vertex_address == 0 || mesh.index_address == 0 {
        return Err(RtError::geometry("mesh buffers have no device address"));
    }

    Ok(GeometryDescriptor {
        kind: GeometryKind::Triangles {
            vertex_address: mesh.vertex_address,
            vertex_stride: mesh.vertex_stride,
            vertex_format: mesh.vertex_format,
            max_vertex: mesh.vertex_count - 1,
            index_address: mesh.index_address,
        },
        primitive_count: mesh.index_count / 3,
        flags: vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION,
    })
}

/// Describe all implicit primitives as one AABB geometry.
///
/// Callers skip empty sets; describing one is an error.
pub fn describe_implicit_set(set: &ImplicitSet) -> Result<GeometryDescriptor> {
    if set.is_empty() {
        return Err(RtError::EmptyImplicitSet);
    }
    // AABB data is six floats, and Vulkan requires 8-byte aligned strides.
    if set.aabb_stride < 24 || set.aabb_stride % 8 != 0 {
        return Err(RtError::geometry(format!(
            "AABB stride {} must be at least 24 and a multiple of 8",
            set.aabb_stride
        )));
    }
    if set.aabb_address == 0 {
        return Err(RtError::geometry("AABB buffer has no device address"));
    }

    Ok(GeometryDescriptor {
        kind: GeometryKind::Aabbs {
            data_address: set.aabb_address,
            stride: set.aabb_stride,
        },
        primitive_count: set.count,
        flags: vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION,
    })
}
