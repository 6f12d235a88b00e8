//! Named shader group registry.
//!
//! Group indices decide where each group's handle lands in the shader
//! binding table. The pipeline assembler, the SBT packer, the TLAS instance
//! planner and the trace dispatcher all resolve groups through one registry
//! by role, so adding or reordering groups cannot desynchronise them.

use ash::vk;
use std::fmt;

use crate::error::{Result, RtError};

/// Light model evaluated by a callable shader.
///
/// The discriminant is the value pushed as `light_type` and the callable
/// index shaders pass to `executeCallableEXT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum LightType {
    #[default]
    Point = 0,
    Spot = 1,
    Directional = 2,
}

impl LightType {
    pub const ALL: [LightType; 3] = [LightType::Point, LightType::Spot, LightType::Directional];
}

/// Region of the shader binding table a group belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SbtRegion {
    RayGen,
    Miss,
    Hit,
    Callable,
}

impl SbtRegion {
    pub const ALL: [SbtRegion; 4] = [SbtRegion::RayGen, SbtRegion::Miss, SbtRegion::Hit, SbtRegion::Callable];
}

/// Symbolic role of a shader group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupRole {
    RayGen,
    Miss,
    ShadowMiss,
    TriangleHit,
    ProceduralHit,
    Callable(LightType),
}

impl GroupRole {
    /// Region the role's record is placed in.
    pub fn region(self) -> SbtRegion {
        match self {
            GroupRole::RayGen => SbtRegion::RayGen,
            GroupRole::Miss | GroupRole::ShadowMiss => SbtRegion::Miss,
            GroupRole::TriangleHit | GroupRole::ProceduralHit => SbtRegion::Hit,
            GroupRole::Callable(_) => SbtRegion::Callable,
        }
    }

    /// Vulkan group type for the role.
    pub fn group_type(self) -> vk::RayTracingShaderGroupTypeKHR {
        match self {
            GroupRole::TriangleHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            GroupRole::ProceduralHit => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            _ => vk::RayTracingShaderGroupTypeKHR::GENERAL,
        }
    }

    /// Whether hits on this group run an intersection shader, which makes it
    /// the only kind of hit group that can serve AABB geometry.
    pub fn has_intersection(self) -> bool {
        self == GroupRole::ProceduralHit
    }
}

impl fmt::Display for GroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupRole::RayGen => write!(f, "raygen"),
            GroupRole::Miss => write!(f, "miss"),
            GroupRole::ShadowMiss => write!(f, "shadow-miss"),
            GroupRole::TriangleHit => write!(f, "triangle-hit"),
            GroupRole::ProceduralHit => write!(f, "procedural-hit"),
            GroupRole::Callable(light) => write!(f, "callable-{:?}", light),
        }
    }
}

/// First group index and group count of one SBT region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionSpan {
    pub first: u32,
    pub count: u32,
}

/// Ordered set of shader group roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderGroupRegistry {
    roles: Vec<GroupRole>,
}

impl ShaderGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The eight groups of the hybrid ray tracer:
    /// raygen, miss, shadow miss, triangle hit, procedural hit, and one
    /// callable per light type.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        let roles = [
            GroupRole::RayGen,
            GroupRole::Miss,
            GroupRole::ShadowMiss,
            GroupRole::TriangleHit,
            GroupRole::ProceduralHit,
            GroupRole::Callable(LightType::Point),
            GroupRole::Callable(LightType::Spot),
            GroupRole::Callable(LightType::Directional),
        ];
        for role in roles {
            // The canonical order always satisfies the region rules.
            let _ = registry.register(role);
        }
        registry
    }

    /// Append a group and return its index.
    ///
    /// Regions must be contiguous and appear in raygen, miss, hit, callable
    /// order, and each role may appear once. Only one raygen group is
    /// allowed since a trace dispatch selects exactly one.
    pub fn register(&mut self, role: GroupRole) -> Result<u32> {
        if self.roles.contains(&role) {
            return Err(RtError::GroupLayout(format!("group {} registered twice", role)));
        }
        if let Some(last) = self.roles.last() {
            if role.region() < last.region() {
                return Err(RtError::GroupLayout(format!(
                    "group {} ({:?} region) registered after {} ({:?} region)",
                    role,
                    role.region(),
                    last,
                    last.region()
                )));
            }
        }
        self.roles.push(role);
        Ok(self.roles.len() as u32 - 1)
    }

    /// Number of registered groups.
    pub fn len(&self) -> u32 {
        self.roles.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Registered roles in index order.
    pub fn roles(&self) -> &[GroupRole] {
        &self.roles
    }

    /// Group index of a role.
    pub fn index_of(&self, role: GroupRole) -> Option<u32> {
        self.roles.iter().position(|r| *r == role).map(|i| i as u32)
    }

    /// First index and count of the groups in a region.
    ///
    /// An empty region starts where the next region would start.
    pub fn span(&self, region: SbtRegion) -> RegionSpan {
        let first = self.roles.iter().take_while(|r| r.region() < region).count() as u32;
        let count = self.roles.iter().filter(|r| r.region() == region).count() as u32;
        RegionSpan { first, count }
    }

    /// Record offset of a hit group inside the hit region; this is the value
    /// an instance stores as its shader binding table offset.
    pub fn hit_record(&self, role: GroupRole) -> Option<u32> {
        if role.region() != SbtRegion::Hit {
            return None;
        }
        let span = self.span(SbtRegion::Hit);
        self.index_of(role).map(|index| index - span.first)
    }

    /// Role of the hit group at a record offset inside the hit region.
    pub fn hit_role(&self, record: u32) -> Option<GroupRole> {
        let span = self.span(SbtRegion::Hit);
        if record >= span.count {
            return None;
        }
        self.roles.get((span.first + record) as usize).copied()
    }

    /// Check that a dispatch has the groups it needs: one raygen, at least
    /// one miss group.
    pub fn validate_for_dispatch(&self) -> Result<()> {
        if self.span(SbtRegion::RayGen).count != 1 {
            return Err(RtError::GroupLayout("exactly one raygen group is required".into()));
        }
        if self.span(SbtRegion::Miss).count == 0 {
            return Err(RtError::GroupLayout("at least one miss group is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Standard registry
    // ============================================================

    #[test]
    fn test_standard_indices() {
        let registry = ShaderGroupRegistry::standard();
        assert_eq!(registry.len(), 8);
        assert_eq!(registry.index_of(GroupRole::RayGen), Some(0));
        assert_eq!(registry.index_of(GroupRole::Miss), Some(1));
        assert_eq!(registry.index_of(GroupRole::ShadowMiss), Some(2));
        assert_eq!(registry.index_of(GroupRole::TriangleHit), Some(3));
        assert_eq!(registry.index_of(GroupRole::ProceduralHit), Some(4));
        assert_eq!(registry.index_of(GroupRole::Callable(LightType::Point)), Some(5));
        assert_eq!(registry.index_of(GroupRole::Callable(LightType::Spot)), Some(6));
        assert_eq!(registry.index_of(GroupRole::Callable(LightType::Directional)), Some(7));
    }

    #[test]
    fn test_standard_spans() {
        let registry = ShaderGroupRegistry::standard();
        assert_eq!(registry.span(SbtRegion::RayGen), RegionSpan { first: 0, count: 1 });
        assert_eq!(registry.span(SbtRegion::Miss), RegionSpan { first: 1, count: 2 });
        assert_eq!(registry.span(SbtRegion::Hit), RegionSpan { first: 3, count: 2 });
        assert_eq!(registry.span(SbtRegion::Callable), RegionSpan { first: 5, count: 3 });
        assert!(registry.validate_for_dispatch().is_ok());
    }

    #[test]
    fn test_callable_order_matches_light_type() {
        let registry = ShaderGroupRegistry::standard();
        let callables = registry.span(SbtRegion::Callable);
        for light in LightType::ALL {
            let index = registry.index_of(GroupRole::Callable(light)).unwrap();
            assert_eq!(index - callables.first, light as u32);
        }
    }

    #[test]
    fn test_hit_records() {
        let registry = ShaderGroupRegistry::standard();
        assert_eq!(registry.hit_record(GroupRole::TriangleHit), Some(0));
        assert_eq!(registry.hit_record(GroupRole::ProceduralHit), Some(1));
        assert_eq!(registry.hit_record(GroupRole::Miss), None);
        assert_eq!(registry.hit_role(0), Some(GroupRole::TriangleHit));
        assert_eq!(registry.hit_role(1), Some(GroupRole::ProceduralHit));
        assert_eq!(registry.hit_role(2), None);
    }

    // ============================================================
    // Registration rules
    // ============================================================

    #[test]
    fn test_out_of_order_region_rejected() {
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        registry.register(GroupRole::TriangleHit).unwrap();
        let err = registry.register(GroupRole::Miss).unwrap_err();
        assert!(matches!(err, RtError::GroupLayout(_)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_role_rejected() {
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        registry.register(GroupRole::Miss).unwrap();
        assert!(registry.register(GroupRole::Miss).is_err());
    }

    #[test]
    fn test_hit_records_follow_registration() {
        // Procedural first: instance offsets must follow
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        registry.register(GroupRole::Miss).unwrap();
        registry.register(GroupRole::ProceduralHit).unwrap();
        registry.register(GroupRole::TriangleHit).unwrap();
        assert_eq!(registry.hit_record(GroupRole::ProceduralHit), Some(0));
        assert_eq!(registry.hit_record(GroupRole::TriangleHit), Some(1));
        assert_eq!(registry.span(SbtRegion::Callable), RegionSpan { first: 4, count: 0 });
    }

    #[test]
    fn test_dispatch_requires_raygen_and_miss() {
        let mut registry = ShaderGroupRegistry::new();
        registry.register(GroupRole::RayGen).unwrap();
        assert!(registry.validate_for_dispatch().is_err());
        registry.register(GroupRole::Miss).unwrap();
        assert!(registry.validate_for_dispatch().is_ok());
        assert!(ShaderGroupRegistry::new().validate_for_dispatch().is_err());
    }

    #[test]
    fn test_group_types() {
        assert_eq!(GroupRole::RayGen.group_type(), vk::RayTracingShaderGroupTypeKHR::GENERAL);
        assert_eq!(
            GroupRole::Callable(LightType::Spot).group_type(),
            vk::RayTracingShaderGroupTypeKHR::GENERAL
        );
        assert_eq!(
            GroupRole::TriangleHit.group_type(),
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
        );
        assert_eq!(
            GroupRole::ProceduralHit.group_type(),
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
        );
        assert!(GroupRole::ProceduralHit.has_intersection());
        assert!(!GroupRole::TriangleHit.has_intersection());
    }
}
