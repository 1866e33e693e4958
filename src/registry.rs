//! Ordered registry of provisioning steps.

use crate::error::ProvisionError;
use crate::step::ProvisioningStep;

/// Steps of one plan, kept sorted by ordinal.
///
/// Registration order does not matter: iteration is always by ordinal.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: Vec<ProvisioningStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a step, rejecting duplicate names and ordinals.
    pub fn register(&mut self, step: ProvisioningStep) -> Result<(), ProvisionError> {
        if let Some(existing) = self.steps.iter().find(|s| s.name() == step.name()) {
            return Err(ProvisionError::Validation(format!(
                "step '{}' is already registered at ordinal {}",
                step.name(),
                existing.ordinal()
            )));
        }
        if let Some(existing) = self.steps.iter().find(|s| s.ordinal() == step.ordinal()) {
            return Err(ProvisionError::Validation(format!(
                "ordinal {} of step '{}' is already used by step '{}'",
                step.ordinal(),
                step.name(),
                existing.name()
            )));
        }
        let index = self
            .steps
            .partition_point(|s| s.ordinal() < step.ordinal());
        self.steps.insert(index, step);
        Ok(())
    }

    /// Checks that every dependency names an earlier step.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        for step in &self.steps {
            for dependency in step.dependencies() {
                match self.get(dependency) {
                    None => {
                        return Err(ProvisionError::Validation(format!(
                            "step '{}' depends on unknown step '{}'",
                            step.name(),
                            dependency
                        )));
                    }
                    Some(dep) if dep.ordinal() >= step.ordinal() => {
                        return Err(ProvisionError::Validation(format!(
                            "step '{}' depends on '{}', which does not run before it",
                            step.name(),
                            dependency
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProvisioningStep> {
        self.steps.iter().find(|s| s.name() == name)
    }

    /// Steps in ordinal order.
    pub fn steps(&self) -> impl Iterator<Item = &ProvisioningStep> {
        self.steps.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
