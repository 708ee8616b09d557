//! Instruction plan accumulated during one interpretation pass

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

use super::error::{InterpretationError, InterpretationResult};
use super::instruction::{Instruction, InstructionOptions};

/// Content-derived identifier of a scheduled instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstructionUuid(pub String);

impl InstructionUuid {
    /// Derive an id from the instruction content, its position in the plan
    /// and a collision counter.
    ///
    /// Identical interpretations therefore produce identical ids.
    pub fn derive(instruction: &Instruction, position: usize, attempt: u32) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&(position as u64).to_le_bytes());
        hasher.update(&attempt.to_le_bytes());
        match serde_json::to_vec(instruction) {
            Ok(bytes) => hasher.update(&bytes),
            Err(_) => hasher.update(instruction.to_string().as_bytes()),
        };
        let hex = hasher.finalize().to_hex();
        Self(hex[..32].to_string())
    }
}

impl fmt::Display for InstructionUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One resolved action of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledInstruction {
    uuid: InstructionUuid,
    instruction: Instruction,
    returned_value: serde_json::Value,
    options: InstructionOptions,
    executed: bool,
}

impl ScheduledInstruction {
    /// Schedule an instruction.
    pub fn new(
        uuid: InstructionUuid,
        instruction: Instruction,
        returned_value: serde_json::Value,
        options: InstructionOptions,
    ) -> Self {
        Self {
            uuid,
            instruction,
            returned_value,
            options,
            executed: false,
        }
    }

    /// Flag the instruction as already applied to the enclave.
    pub fn executed(mut self, executed: bool) -> Self {
        self.executed = executed;
        self
    }

    /// Instruction id.
    pub fn uuid(&self) -> &InstructionUuid {
        &self.uuid
    }

    /// The instruction itself.
    pub fn instruction(&self) -> &Instruction {
        &self.instruction
    }

    /// Value surfaced to the script when the instruction was issued.
    pub fn returned_value(&self) -> &serde_json::Value {
        &self.returned_value
    }

    /// Execution settings.
    pub fn options(&self) -> InstructionOptions {
        self.options
    }

    /// Whether history already holds this exact instruction.
    pub fn is_executed(&self) -> bool {
        self.executed
    }
}

/// Ordered instructions plus the count of historical instructions kept ahead
/// of them.
#[derive(Debug, Clone, Default)]
pub struct InstructionsPlan {
    index_of_first_instruction: usize,
    scheduled: HashMap<InstructionUuid, ScheduledInstruction>,
    sequence: Vec<InstructionUuid>,
    package_dependencies: BTreeSet<String>,
}

impl InstructionsPlan {
    /// Empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an instruction with this id is already scheduled.
    pub fn contains(&self, uuid: &InstructionUuid) -> bool {
        self.scheduled.contains_key(uuid)
    }

    /// Id for an instruction about to be appended at the end of the plan.
    pub fn next_uuid(&self, instruction: &Instruction) -> InstructionUuid {
        let position = self.size();
        let mut attempt = 0;
        loop {
            let uuid = InstructionUuid::derive(instruction, position, attempt);
            if !self.contains(&uuid) {
                return uuid;
            }
            attempt += 1;
        }
    }

    /// Append an instruction.
    pub fn add_scheduled_instruction(&mut self, instruction: ScheduledInstruction) {
        let uuid = instruction.uuid.clone();
        self.sequence.push(uuid.clone());
        self.scheduled.insert(uuid, instruction);
    }

    /// Number of historical instructions preserved, unexecuted, ahead of
    /// this plan.
    pub fn index_of_first_instruction(&self) -> usize {
        self.index_of_first_instruction
    }

    /// Record how many historical instructions precede this plan.
    pub fn set_index_of_first_instruction(&mut self, index: usize) {
        self.index_of_first_instruction = index;
    }

    /// Record a dependency on another package.
    pub fn add_package_dependency(&mut self, package: impl Into<String>) {
        self.package_dependencies.insert(package.into());
    }

    /// Packages this plan depends on, sorted.
    pub fn package_dependencies(&self) -> impl Iterator<Item = &str> {
        self.package_dependencies.iter().map(String::as_str)
    }

    /// Number of scheduled instructions.
    pub fn size(&self) -> usize {
        self.sequence.len()
    }

    /// Freeze the plan into its ordered instruction sequence.
    pub fn generate_plan(&self) -> InterpretationResult<Vec<ScheduledInstruction>> {
        self.sequence
            .iter()
            .map(|uuid| {
                self.scheduled.get(uuid).cloned().ok_or_else(|| {
                    InterpretationError::new(format!(
                        "Instruction '{}' is scheduled in the plan sequence but was never stored",
                        uuid
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn print(message: &str, position: usize) -> ScheduledInstruction {
        let instruction = Instruction::Print {
            message: message.to_string(),
        };
        ScheduledInstruction::new(
            InstructionUuid::derive(&instruction, position, 0),
            instruction,
            serde_json::Value::Null,
            InstructionOptions::default(),
        )
    }

    #[test]
    fn keeps_insertion_order() {
        let mut plan = InstructionsPlan::new();
        plan.add_scheduled_instruction(print("b", 0));
        plan.add_scheduled_instruction(print("a", 1));
        let messages: Vec<String> = plan
            .generate_plan()
            .unwrap()
            .iter()
            .map(|s| s.instruction().to_string())
            .collect();
        assert_eq!(messages, vec!["print(msg=\"b\")", "print(msg=\"a\")"]);
        assert_eq!(plan.size(), 2);
    }

    #[test]
    fn dependencies_are_deduplicated_and_sorted() {
        let mut plan = InstructionsPlan::new();
        plan.add_package_dependency("github.com/z/pkg");
        plan.add_package_dependency("github.com/a/pkg");
        plan.add_package_dependency("github.com/z/pkg");
        let deps: Vec<&str> = plan.package_dependencies().collect();
        assert_eq!(deps, vec!["github.com/a/pkg", "github.com/z/pkg"]);
    }

    #[test]
    fn uuid_depends_on_content_and_position() {
        let instruction = Instruction::Print {
            message: "hi".into(),
        };
        assert_eq!(
            InstructionUuid::derive(&instruction, 0, 0),
            InstructionUuid::derive(&instruction, 0, 0)
        );
        assert_ne!(
            InstructionUuid::derive(&instruction, 0, 0),
            InstructionUuid::derive(&instruction, 1, 0)
        );
    }

    #[test]
    fn next_uuid_skips_ids_already_in_the_plan() {
        let instruction = Instruction::Print {
            message: "hi".into(),
        };
        let mut plan = InstructionsPlan::new();
        let taken = InstructionUuid::derive(&instruction, 1, 0);
        plan.add_scheduled_instruction(ScheduledInstruction::new(
            taken.clone(),
            instruction.clone(),
            serde_json::Value::Null,
            InstructionOptions::default(),
        ));
        assert_eq!(plan.size(), 1);
        let next = plan.next_uuid(&instruction);
        assert_ne!(next, taken);
        assert_eq!(next, InstructionUuid::derive(&instruction, 1, 1));
    }

    #[test]
    fn missing_instruction_surfaces_on_freeze() {
        let mut plan = InstructionsPlan::new();
        plan.add_scheduled_instruction(print("a", 0));
        plan.sequence.push(InstructionUuid("dangling".into()));
        let err = plan.generate_plan().unwrap_err();
        assert!(err.to_string().contains("dangling"));
    }
}
