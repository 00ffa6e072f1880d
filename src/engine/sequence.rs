//! Ordered step collections and their structural validation
//!
//! A [`Sequence`] owns a flat list of steps whose control-flow types must
//! mirror block-structured nesting: every `if`, `while`, and `try` needs a
//! matching `end`, every `try` exactly one `catch`, and `elseif`/`else`/`catch`
//! may only appear inside the block they belong to. The indenter walks the
//! list after every mutation, assigns display indentation levels, and records
//! the first structural violation it finds.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::step::{Step, StepType, MAX_INDENTATION_LEVEL};
use crate::error::{TaskError, TaskResult};

/// Index type for steps within a sequence.
pub type StepIndex = u16;

/// Longest allowed sequence label, in bytes.
pub const MAX_LABEL_LENGTH: usize = 128;

/// Kind of block currently open while walking the step list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    ElseIf,
    Else,
    While,
    Try,
    Catch,
}

impl BlockKind {
    fn name(self) -> &'static str {
        match self {
            BlockKind::If => "IF",
            BlockKind::ElseIf => "ELSEIF",
            BlockKind::Else => "ELSE",
            BlockKind::While => "WHILE",
            BlockKind::Try => "TRY",
            BlockKind::Catch => "CATCH",
        }
    }
}

/// An ordered list of steps with a block-structured nesting grammar.
///
/// Indentation levels are recomputed eagerly on every mutation, so the
/// sequence's indentation state is always current and
/// [`get_indentation_error()`](Sequence::get_indentation_error) reflects the
/// latest step list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    label: String,
    steps: Vec<Step>,
    indentation_error: Option<String>,
}

impl Sequence {
    /// Create an empty sequence with a descriptive label.
    ///
    /// Fails if the label is empty or longer than [`MAX_LABEL_LENGTH`] bytes.
    pub fn new(label: impl Into<String>) -> TaskResult<Self> {
        let label = label.into();
        check_label(&label)?;

        Ok(Self {
            label,
            steps: Vec::new(),
            indentation_error: None,
        })
    }

    /// Sequence label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Read access to the steps.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Mutable access to the steps, for drivers that execute them.
    ///
    /// Changing step types through this accessor leaves the stored
    /// indentation stale until the next mutation;
    /// [`check_correctness_of_steps()`](Sequence::check_correctness_of_steps)
    /// always re-runs the analysis, so validity is never judged from stale
    /// state.
    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    /// The step at the given index, if any.
    pub fn get(&self, index: StepIndex) -> Option<&Step> {
        self.steps.get(usize::from(index))
    }

    /// Number of steps in this sequence.
    pub fn size(&self) -> StepIndex {
        self.steps.len() as StepIndex
    }

    /// Whether the sequence contains no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The current structural error, or `None` if the steps are well nested.
    pub fn get_indentation_error(&self) -> Option<&str> {
        self.indentation_error.as_deref()
    }

    /// Append a step and recompute indentation.
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
        self.indent();
    }

    /// Insert a step before `index` and recompute indentation.
    pub fn insert_step(&mut self, index: StepIndex, step: Step) -> TaskResult<()> {
        if usize::from(index) > self.steps.len() {
            return Err(TaskError::Config(format!(
                "Cannot insert at index {index}: sequence has {} steps",
                self.steps.len()
            )));
        }
        self.steps.insert(usize::from(index), step);
        self.indent();
        Ok(())
    }

    /// Remove and return the step at `index`, recomputing indentation.
    pub fn remove_step(&mut self, index: StepIndex) -> TaskResult<Step> {
        if usize::from(index) >= self.steps.len() {
            return Err(TaskError::Config(format!(
                "Cannot remove step {index}: sequence has {} steps",
                self.steps.len()
            )));
        }
        let step = self.steps.remove(usize::from(index));
        self.indent();
        Ok(step)
    }

    /// Re-run the structural analysis and fail if the steps are not properly
    /// nested. The analysis is never cached.
    pub fn check_correctness_of_steps(&mut self) -> TaskResult<()> {
        self.indent();
        match &self.indentation_error {
            Some(error) => Err(TaskError::Structural(error.clone())),
            None => Ok(()),
        }
    }

    /// Assign indentation levels to all steps according to their logical
    /// nesting.
    ///
    /// On a structural violation the offending step still receives an
    /// approximate level (clamped into bounds) so a display stays usable, and
    /// the first violation is recorded. A clean walk clears the error.
    fn indent(&mut self) {
        let mut stack: Vec<(BlockKind, usize)> = Vec::new();
        let mut error: Option<String> = None;

        for (idx, step) in self.steps.iter_mut().enumerate() {
            let depth = stack.len() as i32;
            let mut level = depth;

            match step.step_type() {
                StepType::Action => {}
                StepType::If => stack.push((BlockKind::If, idx)),
                StepType::While => stack.push((BlockKind::While, idx)),
                StepType::Try => stack.push((BlockKind::Try, idx)),
                StepType::ElseIf => {
                    level = depth - 1;
                    match stack.last_mut() {
                        Some(top) if matches!(top.0, BlockKind::If | BlockKind::ElseIf) => {
                            top.0 = BlockKind::ElseIf;
                        }
                        _ => note(&mut error, idx, "ELSEIF without a matching IF"),
                    }
                }
                StepType::Else => {
                    level = depth - 1;
                    match stack.last_mut() {
                        Some(top) if matches!(top.0, BlockKind::If | BlockKind::ElseIf) => {
                            top.0 = BlockKind::Else;
                        }
                        _ => note(&mut error, idx, "ELSE without a matching IF"),
                    }
                }
                StepType::Catch => {
                    level = depth - 1;
                    match stack.last_mut() {
                        Some(top) if top.0 == BlockKind::Try => top.0 = BlockKind::Catch,
                        _ => note(&mut error, idx, "CATCH without a matching TRY"),
                    }
                }
                StepType::End => {
                    level = depth - 1;
                    match stack.pop() {
                        Some((BlockKind::Try, open_idx)) => note(
                            &mut error,
                            idx,
                            format!("END closes the TRY opened at step {open_idx} without a CATCH"),
                        ),
                        Some(_) => {}
                        None => note(&mut error, idx, "END without a matching IF, WHILE, or TRY"),
                    }
                }
            }

            if level > i32::from(MAX_INDENTATION_LEVEL) {
                note(
                    &mut error,
                    idx,
                    format!("nesting is deeper than {MAX_INDENTATION_LEVEL} levels"),
                );
            }
            let clamped = level.clamp(0, i32::from(MAX_INDENTATION_LEVEL)) as u16;
            step.assign_indentation_level(clamped);
        }

        if error.is_none() {
            if let Some((kind, open_idx)) = stack.last() {
                error = Some(format!(
                    "Unterminated {} block at step {open_idx}",
                    kind.name()
                ));
            }
        }

        if let Some(error) = &error {
            debug!(%error, "sequence steps are not well nested");
        }
        self.indentation_error = error;
    }
}

fn check_label(label: &str) -> TaskResult<()> {
    if label.is_empty() {
        return Err(TaskError::Config(
            "Sequence label may not be empty".to_string(),
        ));
    }
    if label.len() > MAX_LABEL_LENGTH {
        return Err(TaskError::Config(format!(
            "Sequence label is too long ({} bytes; maximum is {MAX_LABEL_LENGTH} bytes)",
            label.len()
        )));
    }
    Ok(())
}

fn note(error: &mut Option<String>, idx: usize, what: impl std::fmt::Display) {
    if error.is_none() {
        *error = Some(format!("Step {idx}: {what}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence_of(types: &[StepType]) -> Sequence {
        let mut sequence = Sequence::new("test").unwrap();
        for step_type in types {
            sequence.add_step(Step::new(*step_type));
        }
        sequence
    }

    fn levels(sequence: &Sequence) -> Vec<u16> {
        sequence
            .steps()
            .iter()
            .map(|s| s.indentation_level())
            .collect()
    }

    #[test]
    fn test_label_constraints() {
        assert!(Sequence::new("").is_err());
        assert!(Sequence::new("a".repeat(129)).is_err());
        assert!(Sequence::new("a").is_ok());
        assert!(Sequence::new("a".repeat(128)).is_ok());
    }

    #[test]
    fn test_empty_sequence_is_well_nested() {
        let mut sequence = Sequence::new("empty").unwrap();
        assert!(sequence.is_empty());
        assert!(sequence.get_indentation_error().is_none());
        assert!(sequence.check_correctness_of_steps().is_ok());
    }

    #[test]
    fn test_flat_actions() {
        let sequence = sequence_of(&[StepType::Action, StepType::Action]);
        assert_eq!(levels(&sequence), vec![0, 0]);
        assert!(sequence.get_indentation_error().is_none());
    }

    #[test]
    fn test_if_block_indentation() {
        use StepType::*;
        let sequence = sequence_of(&[If, Action, End]);
        assert_eq!(levels(&sequence), vec![0, 1, 0]);
        assert!(sequence.get_indentation_error().is_none());
    }

    #[test]
    fn test_if_elseif_else_indentation() {
        use StepType::*;
        let sequence = sequence_of(&[If, Action, ElseIf, Action, Else, Action, End]);
        assert_eq!(levels(&sequence), vec![0, 1, 0, 1, 0, 1, 0]);
        assert!(sequence.get_indentation_error().is_none());
    }

    #[test]
    fn test_nested_blocks_indentation() {
        use StepType::*;
        let sequence = sequence_of(&[
            While, // 0
            Try,   // 1
            Action, // 2
            Catch, // 1
            Action, // 2
            End,   // 1
            End,   // 0
        ]);
        assert_eq!(levels(&sequence), vec![0, 1, 2, 1, 2, 1, 0]);
        assert!(sequence.get_indentation_error().is_none());
    }

    #[test]
    fn test_extra_end_is_reported() {
        use StepType::*;
        let mut sequence = sequence_of(&[If, Action, End, End]);

        let error = sequence.get_indentation_error().unwrap().to_string();
        assert!(error.contains('3'), "error should name step 3: {error}");
        assert!(sequence.check_correctness_of_steps().is_err());
    }

    #[test]
    fn test_unterminated_block_is_reported() {
        use StepType::*;
        let sequence = sequence_of(&[While, Action]);

        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("WHILE"), "unexpected error: {error}");
        assert!(error.contains('0'), "unexpected error: {error}");
    }

    #[test]
    fn test_stray_else_is_reported() {
        let sequence = sequence_of(&[StepType::Else, StepType::End]);
        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("ELSE"), "unexpected error: {error}");
    }

    #[test]
    fn test_else_then_elseif_is_reported() {
        use StepType::*;
        let sequence = sequence_of(&[If, Else, ElseIf, End]);
        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("ELSEIF"), "unexpected error: {error}");
    }

    #[test]
    fn test_catch_outside_try_is_reported() {
        use StepType::*;
        let sequence = sequence_of(&[If, Catch, End]);
        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("CATCH"), "unexpected error: {error}");
    }

    #[test]
    fn test_try_without_catch_is_reported() {
        use StepType::*;
        let sequence = sequence_of(&[Try, Action, End]);
        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("TRY"), "unexpected error: {error}");
    }

    #[test]
    fn test_double_catch_is_reported() {
        use StepType::*;
        let sequence = sequence_of(&[Try, Action, Catch, Action, Catch, End]);
        assert!(sequence.get_indentation_error().is_some());
    }

    #[test]
    fn test_error_clears_after_fixup() {
        use StepType::*;
        let mut sequence = sequence_of(&[If, Action]);
        assert!(sequence.get_indentation_error().is_some());

        sequence.add_step(Step::new(End));
        assert!(sequence.get_indentation_error().is_none());
        assert!(sequence.check_correctness_of_steps().is_ok());
    }

    #[test]
    fn test_insert_step_reindents() {
        use StepType::*;
        let mut sequence = sequence_of(&[If, End]);
        assert_eq!(levels(&sequence), vec![0, 0]);

        sequence.insert_step(1, Step::new(Action)).unwrap();
        assert_eq!(levels(&sequence), vec![0, 1, 0]);

        assert!(sequence.insert_step(99, Step::new(Action)).is_err());
    }

    #[test]
    fn test_remove_step_reindents() {
        use StepType::*;
        let mut sequence = sequence_of(&[If, Action, End]);

        let removed = sequence.remove_step(0).unwrap();
        assert_eq!(removed.step_type(), If);
        assert_eq!(levels(&sequence), vec![0, 0]);
        assert!(sequence.get_indentation_error().is_some());

        assert!(sequence.remove_step(99).is_err());
    }

    #[test]
    fn test_stray_steps_keep_usable_indentation() {
        use StepType::*;
        let sequence = sequence_of(&[End, Action]);
        // Approximate levels are clamped to >= 0
        assert_eq!(levels(&sequence), vec![0, 0]);
        assert!(sequence.get_indentation_error().is_some());
    }

    #[test]
    fn test_deep_nesting_is_reported() {
        use StepType::*;
        let mut sequence = Sequence::new("deep").unwrap();
        for _ in 0..MAX_INDENTATION_LEVEL + 2 {
            sequence.add_step(Step::new(While));
        }

        let error = sequence.get_indentation_error().unwrap();
        assert!(error.contains("deeper"), "unexpected error: {error}");

        // Levels stay within bounds nonetheless
        assert!(sequence
            .steps()
            .iter()
            .all(|s| s.indentation_level() <= MAX_INDENTATION_LEVEL));
    }
}
