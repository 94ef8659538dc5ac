//! Prompts for the collaboration protocols
//!
//! System prompts are constants; per-call prompts are built from the
//! protocol state by the functions in each submodule.

pub mod critique;
pub mod discussion;

pub use critique::{EVALUATOR_SYSTEM_PROMPT, IMPROVEMENT_TEMPLATE};
pub use discussion::{FACILITATOR_SYSTEM_PROMPT, PARTICIPANT_SYSTEM_PROMPT};
