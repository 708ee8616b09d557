//! Persisted enclave history
//!
//! The history is the ordered list of instructions already applied to an
//! enclave. Reconciliation reads it; applying a reconciled plan keeps the
//! preserved prefix and replaces everything after it with the plan body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{InterpretationResult, StorageError, StorageResult};
use super::instruction::Instruction;
use super::plan::{InstructionUuid, InstructionsPlan};
use super::storage::Storage;

/// One historical instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclavePlanInstruction {
    uuid: InstructionUuid,
    instruction: Instruction,
    returned_value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    applied_at: Option<DateTime<Utc>>,
}

impl EnclavePlanInstruction {
    /// Historical entry that has not been stamped yet.
    pub fn new(uuid: InstructionUuid, instruction: Instruction, returned_value: serde_json::Value) -> Self {
        Self {
            uuid,
            instruction,
            returned_value,
            applied_at: None,
        }
    }

    /// Instruction id.
    pub fn uuid(&self) -> &InstructionUuid {
        &self.uuid
    }

    /// The instruction.
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    /// Value the instruction returned to the script.
    pub fn returned_value(&self) -> &serde_json::Value {
        &self.returned_value
    }

    /// When the instruction was applied.
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        self.applied_at
    }
}

/// Ordered instruction history of an enclave.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnclavePlan {
    instructions: Vec<EnclavePlanInstruction>,
}

impl EnclavePlan {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// History made of the given entries, oldest first.
    pub fn from_instructions(instructions: Vec<EnclavePlanInstruction>) -> Self {
        Self { instructions }
    }

    /// Number of historical instructions.
    pub fn size(&self) -> usize {
        self.instructions.len()
    }

    /// Ordered historical instructions.
    pub fn generate_plan(&self) -> &[EnclavePlanInstruction] {
        &self.instructions
    }

    /// Absorb a reconciled plan: keep the preserved prefix, then append the
    /// plan body. Instructions flagged executed keep their original timestamp
    /// when history still holds them.
    pub fn apply(&mut self, plan: &InstructionsPlan) -> InterpretationResult<()> {
        let keep = plan.index_of_first_instruction().min(self.instructions.len());
        let mut previous = self.instructions.split_off(keep).into_iter();
        let now = Utc::now();
        for scheduled in plan.generate_plan()? {
            let carried = if scheduled.is_executed() {
                previous
                    .by_ref()
                    .find(|old| old.uuid == *scheduled.uuid())
                    .and_then(|old| old.applied_at)
            } else {
                None
            };
            self.instructions.push(EnclavePlanInstruction {
                uuid: scheduled.uuid().clone(),
                instruction: scheduled.instruction().clone(),
                returned_value: scheduled.returned_value().clone(),
                applied_at: Some(carried.unwrap_or(now)),
            });
        }
        tracing::debug!(size = self.instructions.len(), kept = keep, "Applied plan to enclave history");
        Ok(())
    }

    /// Load a history file; a missing file is an empty history.
    pub fn load(storage: &Storage, path: &Path) -> StorageResult<Self> {
        match storage.read_json(path) {
            Ok(plan) => Ok(plan),
            Err(StorageError::PathNotFound(_)) => Ok(Self::new()),
            Err(err) => Err(err),
        }
    }

    /// Save the history atomically.
    pub fn save(&self, storage: &Storage, path: &Path) -> StorageResult<()> {
        storage.write_json(path, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::instruction::InstructionOptions;
    use crate::engine::plan::ScheduledInstruction;
    use tempfile::TempDir;

    fn print(message: &str) -> Instruction {
        Instruction::Print {
            message: message.into(),
        }
    }

    fn scheduled(message: &str, position: usize) -> ScheduledInstruction {
        let instruction = print(message);
        ScheduledInstruction::new(
            InstructionUuid::derive(&instruction, position, 0),
            instruction,
            serde_json::Value::Null,
            InstructionOptions::default(),
        )
    }

    #[test]
    fn apply_keeps_prefix_and_replaces_tail() {
        let mut history = EnclavePlan::new();
        let mut first = InstructionsPlan::new();
        first.add_scheduled_instruction(scheduled("a", 0));
        first.add_scheduled_instruction(scheduled("b", 1));
        history.apply(&first).unwrap();
        assert_eq!(history.size(), 2);

        let mut second = InstructionsPlan::new();
        second.set_index_of_first_instruction(1);
        second.add_scheduled_instruction(scheduled("c", 0));
        history.apply(&second).unwrap();

        let messages: Vec<String> = history
            .generate_plan()
            .iter()
            .map(|i| i.instruction().to_string())
            .collect();
        assert_eq!(messages, vec!["print(msg=\"a\")", "print(msg=\"c\")"]);
        assert!(history.generate_plan().iter().all(|i| i.applied_at().is_some()));
    }

    #[test]
    fn executed_instructions_keep_their_timestamp() {
        let mut history = EnclavePlan::new();
        let mut first = InstructionsPlan::new();
        first.add_scheduled_instruction(scheduled("a", 0));
        history.apply(&first).unwrap();
        let stamped = history.generate_plan()[0].applied_at();

        let mut again = InstructionsPlan::new();
        again.add_scheduled_instruction(scheduled("a", 0).executed(true));
        history.apply(&again).unwrap();
        assert_eq!(history.generate_plan()[0].applied_at(), stamped);
    }

    #[test]
    fn load_and_save_round_trip() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let path = storage.history_path();

        assert_eq!(EnclavePlan::load(&storage, &path).unwrap().size(), 0);

        let mut history = EnclavePlan::new();
        let mut plan = InstructionsPlan::new();
        plan.add_scheduled_instruction(scheduled("a", 0));
        history.apply(&plan).unwrap();
        history.save(&storage, &path).unwrap();

        assert_eq!(EnclavePlan::load(&storage, &path).unwrap(), history);
    }
}
