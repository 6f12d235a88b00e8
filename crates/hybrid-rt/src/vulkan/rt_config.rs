//! Ray tracing configuration.
//!
//! Holds the shader search paths and per-group shader files, replacing any
//! process-wide search path list, and validates the requested recursion
//! depth against device capabilities.

use std::path::PathBuf;

use super::context::RtCapabilities;
use super::raytracing::groups::{GroupRole, LightType};

/// SPIR-V files making up one shader group. Paths are relative to the
/// configured search paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStages {
    /// Raygen, miss or callable shader
    pub general: Option<PathBuf>,
    pub closest_hit: Option<PathBuf>,
    pub any_hit: Option<PathBuf>,
    pub intersection: Option<PathBuf>,
}

impl GroupStages {
    pub fn general(path: &str) -> Self {
        Self { general: Some(path.into()), ..Default::default() }
    }

    pub fn hit(closest_hit: &str, any_hit: &str) -> Self {
        Self {
            closest_hit: Some(closest_hit.into()),
            any_hit: Some(any_hit.into()),
            ..Default::default()
        }
    }

    pub fn procedural(closest_hit: &str, any_hit: &str, intersection: &str) -> Self {
        Self {
            intersection: Some(intersection.into()),
            ..Self::hit(closest_hit, any_hit)
        }
    }
}

/// Shader files per group role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderSet {
    groups: Vec<(GroupRole, GroupStages)>,
}

impl ShaderSet {
    /// Shaders of the hybrid ray tracer, compiled to `shaders/*.spv`.
    pub fn standard() -> Self {
        let mut set = Self::default();
        set.insert(GroupRole::RayGen, GroupStages::general("shaders/raytrace.rgen.spv"));
        set.insert(GroupRole::Miss, GroupStages::general("shaders/raytrace.rmiss.spv"));
        set.insert(GroupRole::ShadowMiss, GroupStages::general("shaders/raytraceShadow.rmiss.spv"));
        set.insert(
            GroupRole::TriangleHit,
            GroupStages::hit("shaders/raytrace.rchit.spv", "shaders/raytrace.rahit.spv"),
        );
        set.insert(
            GroupRole::ProceduralHit,
            GroupStages::procedural(
                "shaders/raytrace2.rchit.spv",
                "shaders/raytrace2.rahit.spv",
                "shaders/raytrace.rint.spv",
            ),
        );
        set.insert(GroupRole::Callable(LightType::Point), GroupStages::general("shaders/light_point.rcall.spv"));
        set.insert(GroupRole::Callable(LightType::Spot), GroupStages::general("shaders/light_spot.rcall.spv"));
        set.insert(GroupRole::Callable(LightType::Directional), GroupStages::general("shaders/light_inf.rcall.spv"));
        set
    }

    /// Set the stages of a role, replacing any previous entry.
    pub fn insert(&mut self, role: GroupRole, stages: GroupStages) {
        match self.groups.iter_mut().find(|(r, _)| *r == role) {
            Some(entry) => entry.1 = stages,
            None => self.groups.push((role, stages)),
        }
    }

    /// Stages configured for a role.
    pub fn stages(&self, role: GroupRole) -> Option<&GroupStages> {
        self.groups.iter().find(|(r, _)| *r == role).map(|(_, s)| s)
    }
}

/// Ray tracing configuration settings.
#[derive(Debug, Clone)]
pub struct RtConfig {
    /// Directories searched, in order, for shader files
    pub search_paths: Vec<PathBuf>,
    /// Shader files per group
    pub shaders: ShaderSet,
    /// Maximum ray recursion depth (primary ray + shadow ray = 2)
    pub recursion_depth: u32,
    /// Whether bottom-level structures are compacted after building
    pub compact_blas: bool,
    /// Whether to emit VK_EXT_debug_utils labels and object names. The
    /// instance must have the extension enabled.
    pub debug_labels: bool,
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            search_paths: vec![PathBuf::from(".")],
            shaders: ShaderSet::standard(),
            recursion_depth: 2,
            compact_blas: true,
            debug_labels: false,
        }
    }
}

impl RtConfig {
    /// Configuration searching the given directories for shaders.
    pub fn with_search_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Clamp settings to what the device supports.
    pub fn validated(mut self, caps: &RtCapabilities) -> Self {
        self.recursion_depth = Self::select_recursion_depth(self.recursion_depth, caps.max_ray_recursion_depth);

        tracing::info!(
            recursion_depth = self.recursion_depth,
            compact_blas = self.compact_blas,
            debug_labels = self.debug_labels,
            search_paths = ?self.search_paths,
            "ray tracing config"
        );

        self
    }

    /// Requested depth, limited to the device maximum and at least 1.
    fn select_recursion_depth(requested: u32, device_max: u32) -> u32 {
        let depth = requested.max(1);
        if device_max > 0 && depth > device_max {
            tracing::warn!(
                "requested ray recursion depth {} exceeds device limit {}, clamping",
                requested,
                device_max
            );
            device_max
        } else {
            depth
        }
    }
}
