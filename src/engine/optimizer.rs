//! Reconciliation of a freshly generated plan against enclave history
//!
//! The script is first interpreted with no mask. The reconciler then looks
//! for the earliest historical instruction matching the first new
//! instruction, installs history from that point as a mask and interprets
//! the script again. A masked pass that fails or invalidates its mask
//! rejects the alignment and the search resumes one position further. When
//! nothing matches, the new instructions simply run after all of history.

use tracing::{debug, info, warn};

use super::error::InterpretationResult;
use super::history::{EnclavePlan, EnclavePlanInstruction};
use super::instruction::EnclaveComponents;
use super::mask::InstructionsPlanMask;
use super::plan::{InstructionsPlan, ScheduledInstruction};
use super::{InterpretRequest, Interpretation, Interpreter};

impl Interpreter {
    /// Interpret a script and return the smallest plan that, replayed after
    /// a preserved prefix of `current_enclave_plan`, reproduces the history
    /// the script describes.
    ///
    /// Only a failure of the first, unmasked interpretation reaches the
    /// caller; failing alignment attempts are skipped.
    pub fn interpret_and_optimize_plan(
        &self,
        request: &InterpretRequest,
        current_enclave_plan: &EnclavePlan,
    ) -> InterpretationResult<Interpretation> {
        let _lease = self.lease.lock();

        self.provider
            .clone_replaced_packages_if_needed(&request.package_replace_options)?;

        let mut components = EnclaveComponents::new();
        let naive = self.interpret_locked(request, &mut components, &InstructionsPlanMask::new(0))?;
        let naive_sequence = naive.plan.generate_plan()?;
        debug!(instructions = naive_sequence.len(), "First interpretation of package generated instructions");

        let history = current_enclave_plan.generate_plan();
        debug!(instructions = history.len(), "Current enclave state loaded");

        let mut start = history.len().saturating_sub(naive_sequence.len());
        loop {
            let Some(matching_idx) = find_first_matching_instruction(history, &naive_sequence, start) else {
                let mut optimized = InstructionsPlan::new();
                optimized.set_index_of_first_instruction(history.len());
                for scheduled in naive_sequence {
                    optimized.add_scheduled_instruction(scheduled);
                }
                copy_dependencies(&naive.plan, &mut optimized);
                debug!(
                    instructions = optimized.size(),
                    "Exhausted all alignments; new plan runs after the whole enclave history"
                );
                return Ok(Interpretation {
                    serialized_output: naive.serialized_output,
                    plan: optimized,
                });
            };
            debug!(index = matching_idx, "Found a historical instruction matching the first new instruction");

            let mut mask = InstructionsPlanMask::new(naive_sequence.len());
            let copied = history[matching_idx..].iter().take(mask.size()).cloned().collect::<Vec<_>>();
            let copied_len = copied.len();
            for (slot, historical) in copied.into_iter().enumerate() {
                mask.insert_at(slot, historical);
            }
            debug!(copied = copied_len, empty = mask.size() - copied_len, "Built plan mask");

            let mut masked_components = EnclaveComponents::new();
            let attempt = match self.interpret_locked(request, &mut masked_components, &mask) {
                Ok(attempt) => attempt,
                Err(err) => {
                    warn!(index = matching_idx, error = %err, "Interpreting the package again with the plan mask failed; ignoring this mask");
                    start = matching_idx + 1;
                    continue;
                }
            };
            if !mask.is_valid() {
                info!(index = matching_idx, "Plan mask was marked as invalid; trying the next alignment");
                start = matching_idx + 1;
                continue;
            }

            let attempt_sequence = attempt.plan.generate_plan()?;
            let preserved = attempt_sequence.iter().take_while(|s| s.is_executed()).count();
            let mut optimized = InstructionsPlan::new();
            optimized.set_index_of_first_instruction(matching_idx + preserved);
            for scheduled in attempt_sequence.into_iter().skip(preserved) {
                optimized.add_scheduled_instruction(scheduled);
            }
            copy_dependencies(&attempt.plan, &mut optimized);
            debug!(
                index = optimized.index_of_first_instruction(),
                instructions = optimized.size(),
                "Masked interpretation succeeded"
            );
            return Ok(Interpretation {
                serialized_output: attempt.serialized_output,
                plan: optimized,
            });
        }
    }
}

/// Index of the first historical instruction at or after `min_index` that
/// resolves Equal or Update against the first new instruction.
fn find_first_matching_instruction(
    history: &[EnclavePlanInstruction],
    new_sequence: &[ScheduledInstruction],
    min_index: usize,
) -> Option<usize> {
    let first = new_sequence.first()?;
    (min_index..history.len()).find(|&idx| {
        // comparison only, no enclave context needed
        let mut scratch = EnclaveComponents::new();
        first
            .instruction()
            .try_resolve_with(history[idx].instruction(), &mut scratch)
            .is_match()
    })
}

fn copy_dependencies(from: &InstructionsPlan, to: &mut InstructionsPlan) {
    for package in from.package_dependencies() {
        to.add_package_dependency(package);
    }
}
