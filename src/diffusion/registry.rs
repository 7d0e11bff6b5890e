//! Named noise schedules

use super::ddim::DdimScheduler;
use super::ddpm::DdpmScheduler;
use super::dpm_solver::DpmSolverMultistepScheduler;
use super::euler::{EulerAncestralDiscreteScheduler, EulerDiscreteScheduler};
use super::heun::HeunDiscreteScheduler;
use super::pndm::PndmScheduler;
use super::schedule::{NoiseSchedule, ScheduleParams};
use super::DiffusionError;
use std::collections::BTreeMap;

pub type ScheduleFactory = fn(ScheduleParams) -> Box<dyn NoiseSchedule>;

/// String id -> schedule constructor
#[derive(Debug, Clone)]
pub struct ScheduleRegistry {
    factories: BTreeMap<String, ScheduleFactory>,
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("DDPM", |p| Box::new(DdpmScheduler::new(p)));
        registry.register("DDIM", |p| Box::new(DdimScheduler::new(p)));
        registry.register("PNDM", |p| Box::new(PndmScheduler::new(p)));
        registry.register("EulerDiscrete", |p| Box::new(EulerDiscreteScheduler::new(p)));
        registry.register("EulerAncestralDiscrete", |p| {
            Box::new(EulerAncestralDiscreteScheduler::new(p))
        });
        registry.register("HeunDiscrete", |p| Box::new(HeunDiscreteScheduler::new(p)));
        registry.register("DPMSolverMultistep", |p| {
            Box::new(DpmSolverMultistepScheduler::new(p))
        });
        registry
    }
}

impl ScheduleRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Add or replace the factory for `id`
    pub fn register(&mut self, id: impl Into<String>, factory: ScheduleFactory) {
        self.factories.insert(id.into(), factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        id: &str,
        params: ScheduleParams,
    ) -> Result<Box<dyn NoiseSchedule>, DiffusionError> {
        let factory = self
            .factories
            .get(id)
            .ok_or_else(|| DiffusionError::UnknownScheduleId(id.to_string()))?;
        Ok(factory(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ids() {
        let registry = ScheduleRegistry::default();
        for id in [
            "DDPM",
            "DDIM",
            "PNDM",
            "EulerDiscrete",
            "EulerAncestralDiscrete",
            "HeunDiscrete",
            "DPMSolverMultistep",
        ] {
            let schedule = registry.build(id, ScheduleParams::default()).unwrap();
            assert_eq!(schedule.name(), id);
        }
    }

    #[test]
    fn test_unknown_id() {
        let registry = ScheduleRegistry::default();
        assert!(matches!(
            registry.build("LCM", ScheduleParams::default()),
            Err(DiffusionError::UnknownScheduleId(id)) if id == "LCM"
        ));
    }
}
