//! Positional overrides used to test an alignment against history

use std::cell::Cell;
use std::rc::Rc;

use super::history::EnclavePlanInstruction;

/// Fixed-size slot vector of historical instructions.
///
/// Clones share the validity flag, so the plan handle can invalidate the mask
/// the caller inspects after the pass.
#[derive(Debug, Clone)]
pub struct InstructionsPlanMask {
    slots: Vec<Option<EnclavePlanInstruction>>,
    valid: Rc<Cell<bool>>,
}

impl InstructionsPlanMask {
    /// Mask with `size` empty slots.
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![None; size],
            valid: Rc::new(Cell::new(true)),
        }
    }

    /// Install the override for slot `index`. Out-of-range slots are ignored.
    pub fn insert_at(&mut self, index: usize, instruction: EnclavePlanInstruction) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(instruction);
        }
    }

    /// Override for slot `index`, if any.
    pub fn get(&self, index: usize) -> Option<&EnclavePlanInstruction> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Whether every resolution so far matched.
    pub fn is_valid(&self) -> bool {
        self.valid.get()
    }

    /// Clear the validity flag for the rest of the pass.
    pub fn mark_invalid(&self) {
        self.valid.set(false);
    }
}

impl Default for InstructionsPlanMask {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::instruction::Instruction;
    use crate::engine::plan::InstructionUuid;

    fn historical(name: &str) -> EnclavePlanInstruction {
        let instruction = Instruction::RemoveService { name: name.into() };
        EnclavePlanInstruction::new(
            InstructionUuid::derive(&instruction, 0, 0),
            instruction,
            serde_json::Value::Null,
        )
    }

    #[test]
    fn slots_are_bounded_by_size() {
        let mut mask = InstructionsPlanMask::new(2);
        mask.insert_at(0, historical("a"));
        mask.insert_at(5, historical("b"));
        assert!(mask.get(0).is_some());
        assert!(mask.get(1).is_none());
        assert!(mask.get(5).is_none());
        assert_eq!(mask.size(), 2);
    }

    #[test]
    fn clones_share_validity() {
        let mask = InstructionsPlanMask::new(1);
        let handle = mask.clone();
        assert!(mask.is_valid());
        handle.mark_invalid();
        assert!(!mask.is_valid());
    }
}
