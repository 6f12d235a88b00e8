//! Build generation tracking.
//!
//! Each build bumps a generation counter, and every derived object records
//! the generation of the input it was built from. A trace may only be
//! recorded when nothing it depends on was rebuilt since.

use crate::error::{Result, RtError};

/// Generations of the objects owned by the raytracer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    next_generation: u64,
    blas: Option<u64>,
    /// (TLAS generation, BLAS generation it references)
    tlas: Option<(u64, u64)>,
    descriptor_set: bool,
    /// TLAS generation written to the descriptor set
    bound_tlas: Option<u64>,
    output_bound: bool,
    pipeline: Option<u64>,
    /// Pipeline generation the SBT handles came from
    sbt: Option<u64>,
}

impl BuildState {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Bottom-level structures were (re)built. The TLAS now references
    /// destroyed structures.
    pub fn blas_built(&mut self) {
        let generation = self.bump();
        self.blas = Some(generation);
    }

    /// A failed BLAS build leaves no structures behind.
    pub fn blas_destroyed(&mut self) {
        self.blas = None;
    }

    /// The TLAS was (re)built from the current BLAS set.
    pub fn tlas_built(&mut self) -> Result<()> {
        let blas = self.blas.ok_or(RtError::NotReady("bottom-level acceleration structures"))?;
        let generation = self.bump();
        self.tlas = Some((generation, blas));
        Ok(())
    }

    /// A failed build leaves no TLAS behind.
    pub fn tlas_destroyed(&mut self) {
        self.tlas = None;
    }

    pub fn descriptor_set_created(&mut self) {
        self.descriptor_set = true;
        self.bound_tlas = None;
        self.output_bound = false;
    }

    /// The current TLAS was written to binding 0.
    pub fn tlas_bound(&mut self) {
        self.bound_tlas = self.tlas.map(|(generation, _)| generation);
    }

    /// An output image was written to binding 1.
    pub fn output_bound(&mut self) {
        self.output_bound = true;
    }

    /// Whether binding 0 points at something other than the current TLAS.
    pub fn tlas_binding_stale(&self) -> bool {
        self.descriptor_set && self.tlas.is_some() && self.bound_tlas != self.tlas.map(|(g, _)| g)
    }

    pub fn pipeline_built(&mut self) {
        let generation = self.bump();
        self.pipeline = Some(generation);
    }

    /// The SBT was packed from the current pipeline.
    pub fn sbt_built(&mut self) -> Result<()> {
        let pipeline = self.pipeline.ok_or(RtError::NotReady("ray tracing pipeline"))?;
        self.sbt = Some(pipeline);
        Ok(())
    }

    /// Check that every object a trace depends on exists and is current.
    pub fn check_dispatch(&self) -> Result<()> {
        let blas = self.blas.ok_or(RtError::NotReady("bottom-level acceleration structures"))?;
        let (tlas, tlas_blas) = self.tlas.ok_or(RtError::NotReady("top-level acceleration structure"))?;
        if tlas_blas != blas {
            return Err(RtError::Stale("top-level acceleration structure"));
        }

        if !self.descriptor_set {
            return Err(RtError::NotReady("ray tracing descriptor set"));
        }
        if self.bound_tlas != Some(tlas) {
            return Err(RtError::Stale("acceleration structure descriptor"));
        }
        if !self.output_bound {
            return Err(RtError::NotReady("output image descriptor"));
        }

        let pipeline = self.pipeline.ok_or(RtError::NotReady("ray tracing pipeline"))?;
        let sbt = self.sbt.ok_or(RtError::NotReady("shader binding table"))?;
        if sbt != pipeline {
            return Err(RtError::Stale("shader binding table"));
        }
        Ok(())
    }

    /// Forget everything, after teardown.
    pub fn reset(&mut self) {
        *self = Self {
            next_generation: self.next_generation,
            ..Self::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> BuildState {
        let mut state = BuildState::new();
        state.blas_built();
        state.tlas_built().unwrap();
        state.descriptor_set_created();
        state.tlas_bound();
        state.output_bound();
        state.pipeline_built();
        state.sbt_built().unwrap();
        state
    }

    // ============================================================
    // Readiness
    // ============================================================

    #[test]
    fn test_nothing_built() {
        let err = BuildState::new().check_dispatch().unwrap_err();
        assert!(matches!(err, RtError::NotReady(_)));
    }

    #[test]
    fn test_fully_built_is_ready() {
        assert!(ready().check_dispatch().is_ok());
    }

    #[test]
    fn test_tlas_requires_blas() {
        let mut state = BuildState::new();
        assert!(matches!(state.tlas_built(), Err(RtError::NotReady(_))));
    }

    #[test]
    fn test_sbt_requires_pipeline() {
        let mut state = BuildState::new();
        assert!(state.sbt_built().is_err());
    }

    #[test]
    fn test_missing_output_image() {
        let mut state = BuildState::new();
        state.blas_built();
        state.tlas_built().unwrap();
        state.descriptor_set_created();
        state.tlas_bound();
        state.pipeline_built();
        state.sbt_built().unwrap();
        assert_eq!(
            state.check_dispatch().unwrap_err().to_string(),
            RtError::NotReady("output image descriptor").to_string()
        );
    }

    // ============================================================
    // Staleness
    // ============================================================

    #[test]
    fn test_blas_rebuild_stales_tlas() {
        let mut state = ready();
        state.blas_built();
        assert!(matches!(state.check_dispatch(), Err(RtError::Stale("top-level acceleration structure"))));

        state.tlas_built().unwrap();
        assert!(state.tlas_binding_stale());
        state.tlas_bound();
        assert!(state.check_dispatch().is_ok());
    }

    #[test]
    fn test_tlas_rebuild_stales_descriptor_only() {
        let mut state = ready();
        state.tlas_built().unwrap();
        assert!(matches!(state.check_dispatch(), Err(RtError::Stale("acceleration structure descriptor"))));
        state.tlas_bound();
        // SBT survives a TLAS rebuild
        assert!(state.check_dispatch().is_ok());
    }

    #[test]
    fn test_pipeline_rebuild_stales_sbt_only() {
        let mut state = ready();
        state.pipeline_built();
        assert!(matches!(state.check_dispatch(), Err(RtError::Stale("shader binding table"))));
        state.sbt_built().unwrap();
        assert!(state.check_dispatch().is_ok());
        assert!(!state.tlas_binding_stale());
    }

    #[test]
    fn test_new_descriptor_set_needs_rebinding() {
        let mut state = ready();
        state.descriptor_set_created();
        assert!(state.tlas_binding_stale());
        assert!(state.check_dispatch().is_err());
    }

    #[test]
    fn test_reset_keeps_generations_increasing() {
        let mut state = ready();
        let before = state.next_generation;
        state.reset();
        assert!(state.check_dispatch().is_err());
        state.blas_built();
        assert!(state.blas.unwrap() > before);
    }
}
