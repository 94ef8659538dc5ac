//! Self-critique evaluator and improvement prompts

use crate::collaboration::critique::QualityCriterion;

pub const EVALUATOR_SYSTEM_PROMPT: &str = r#"You are a strict quality evaluator.

## Your Role
- Score the output against every criterion you are given
- Explain the most important weaknesses
- Suggest concrete improvements

## Output Format
Respond with a single JSON object and nothing else:

{"criteriaScores": {"<criterion>": 0.0}, "feedback": "...", "suggestions": ["..."]}

Every score is between 0 (fails the criterion) and 1 (fully meets it).
"#;

/// Default improvement prompt, rendered through the template resolver.
///
/// Variables: `task`, `previous_output`, `feedback`, `criteria_scores`,
/// `suggestions`, `iteration`.
pub const IMPROVEMENT_TEMPLATE: &str = r#"## Task
{{task}}

## Your Previous Output
{{previous_output}}

## Evaluator Feedback
{{feedback}}

## Criterion Scores
{{criteria_scores}}

## Suggestions
{{suggestions?}}

Produce an improved version of the output (attempt {{iteration}}). Address the
feedback directly and keep what already scored well. Return only the new
output."#;

/// Prompt asking the evaluator to score `output` for `task`
pub fn evaluation_prompt(task: &str, output: &str, criteria: &[QualityCriterion]) -> String {
    let mut prompt = format!("## Task\n{}\n\n## Output to Evaluate\n{}\n\n## Criteria\n", task, output);
    for criterion in criteria {
        prompt.push_str(&format!(
            "\n### {} (weight {}, threshold {})\n{}\n",
            criterion.name, criterion.weight, criterion.threshold, criterion.description
        ));
        if !criterion.evaluation_prompt.is_empty() {
            prompt.push_str(&format!("How to judge: {}\n", criterion.evaluation_prompt));
        }
    }
    prompt.push_str("\nRespond with the JSON object described in your instructions.");
    prompt
}
