//! Per-skill contract registry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::schema::{Schema, Violation};
use crate::error::{ForemanError, ForemanResult};

/// Immutable input/output schema pair for one skill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContract {
    pub skill_id: String,
    pub input_schema: Schema,
    pub output_schema: Schema,
}

/// Holds the contract of every skill known to a run.
///
/// Registration is append-only: a skill can be registered again only with
/// an identical schema pair.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<String, WorkerContract>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the schemas for `skill_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ForemanError::ContractConflict`] if the skill is already
    /// registered with a different schema pair.
    pub fn register(
        &mut self,
        skill_id: impl Into<String>,
        input_schema: Schema,
        output_schema: Schema,
    ) -> ForemanResult<()> {
        self.register_contract(WorkerContract {
            skill_id: skill_id.into(),
            input_schema,
            output_schema,
        })
    }

    pub fn register_contract(&mut self, contract: WorkerContract) -> ForemanResult<()> {
        if let Some(existing) = self.contracts.get(&contract.skill_id) {
            if existing == &contract {
                return Ok(());
            }
            return Err(ForemanError::ContractConflict(contract.skill_id));
        }
        debug!(skill_id = %contract.skill_id, "contract registered");
        self.contracts.insert(contract.skill_id.clone(), contract);
        Ok(())
    }

    pub fn get(&self, skill_id: &str) -> Option<&WorkerContract> {
        self.contracts.get(skill_id)
    }

    pub fn contains(&self, skill_id: &str) -> bool {
        self.contracts.contains_key(skill_id)
    }

    /// Registered skill ids, sorted.
    pub fn skills(&self) -> Vec<String> {
        let mut skills: Vec<String> = self.contracts.keys().cloned().collect();
        skills.sort();
        skills
    }

    pub fn validate_input(&self, skill_id: &str, payload: &Value) -> Result<(), Vec<Violation>> {
        self.lookup(skill_id)?.input_schema.validate(payload)
    }

    pub fn validate_output(&self, skill_id: &str, payload: &Value) -> Result<(), Vec<Violation>> {
        self.lookup(skill_id)?.output_schema.validate(payload)
    }

    fn lookup(&self, skill_id: &str) -> Result<&WorkerContract, Vec<Violation>> {
        self.contracts.get(skill_id).ok_or_else(|| {
            vec![Violation::new(
                "skill_id",
                format!("no contract registered for skill {skill_id}"),
            )]
        })
    }
}
