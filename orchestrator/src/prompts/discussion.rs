//! Discussion participant and facilitator prompts

use crate::collaboration::discussion::{Contribution, Participant};

pub const PARTICIPANT_SYSTEM_PROMPT: &str = r#"You are a participant in a structured multi-agent discussion.

## Your Role
- Argue from the role and perspective you are given
- Engage with what the other participants said in earlier rounds
- Move the group towards a shared position where the arguments allow it

## Output Format
Write your contribution as plain text, then end with a single line:

Agreement: <number between 0 and 1>

where 0 means you fundamentally disagree with the emerging position and 1
means you fully agree with it.
"#;

pub const FACILITATOR_SYSTEM_PROMPT: &str = r#"You are the facilitator of a structured multi-agent discussion.

## Your Role
- Read every contribution of the current round
- Summarise the shared position and the open points
- Judge how close the group is to consensus

## Output Format
Respond with a single JSON object and nothing else:

{"synthesis": "...", "consensusScore": 0.0, "agreements": ["..."], "disagreements": ["..."]}

consensusScore is between 0 (no common ground) and 1 (full consensus).
"#;

/// What a participant sees of the previous round
#[derive(Debug, Clone, Copy)]
pub enum PriorRound<'a> {
    None,
    Synthesis(&'a str),
    Contributions(&'a [Contribution]),
}

/// Prompt for one participant in one round
pub fn participant_prompt(
    topic: &str,
    round: u32,
    max_rounds: u32,
    participant: &Participant,
    prior: PriorRound<'_>,
) -> String {
    let mut prompt = format!(
        "## Discussion Topic\n{}\n\n## Round\n{} of {}\n\n## Your Role\n{}\n",
        topic, round, max_rounds, participant.role
    );
    if let Some(perspective) = &participant.perspective {
        prompt.push_str(&format!("\n## Your Perspective\n{}\n", perspective));
    }

    match prior {
        PriorRound::None => {
            prompt.push_str("\nThis is the opening round. State your initial position.\n");
        }
        PriorRound::Synthesis(synthesis) => {
            prompt.push_str(&format!(
                "\n## Synthesis of the Previous Round\n{}\n\nRespond to this synthesis.\n",
                synthesis
            ));
        }
        PriorRound::Contributions(contributions) => {
            prompt.push_str("\n## Previous Round\n");
            for contribution in contributions {
                prompt.push_str(&format!(
                    "\n### {} ({})\n{}\n",
                    contribution.participant_id, contribution.role, contribution.content
                ));
            }
            prompt.push_str("\nRespond to the points above.\n");
        }
    }

    prompt.push_str("\nEnd with a line `Agreement: <0-1>`.");
    prompt
}

/// Prompt asking the facilitator to synthesise one round
pub fn facilitator_prompt(topic: &str, round: u32, contributions: &[Contribution]) -> String {
    let mut prompt = format!(
        "## Discussion Topic\n{}\n\n## Contributions in Round {}\n",
        topic, round
    );
    for contribution in contributions {
        prompt.push_str(&format!(
            "\n### {} ({})\n{}\n",
            contribution.participant_id, contribution.role, contribution.content
        ));
    }
    prompt.push_str("\nRespond with the JSON object described in your instructions.");
    prompt
}
