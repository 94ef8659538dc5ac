//! Multi-agent collaboration protocols
//!
//! - [`discussion`]: participants argue in rounds until consensus converges
//! - [`critique`]: generate, evaluate against weighted criteria, improve

pub mod consensus;
pub mod critique;
pub mod discussion;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use consensus::{check_convergence, evaluate_consensus, ConsensusStrategy};
pub use critique::{
    calculate_overall_score, Critique, CritiqueIteration, QualityCriterion, SelfCritique,
    SelfCritiqueConfig, SelfCritiqueResult,
};
pub use discussion::{
    Contribution, Discussion, DiscussionConfig, DiscussionResult, DiscussionRound, Participant,
    ParticipantSummary,
};

/// Terminal status of a collaboration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollaborationStatus {
    Completed,
    Failed,
}

/// Parse the JSON object embedded in an agent reply: the text between the
/// first `{` and the last `}`, which tolerates prose or code fences around it.
pub(crate) fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}
