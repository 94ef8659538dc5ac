//! Discussion and self-critique protocol scenarios

use orchestrator::collaboration::{
    CollaborationStatus, ConsensusStrategy, Discussion, DiscussionConfig, Participant,
    QualityCriterion, SelfCritique, SelfCritiqueConfig,
};
use orchestrator::events::{CritiqueEvent, DiscussionEvent};

use super::common::{Reply, ScriptedInvoker};

fn agreeing(score: f64) -> Reply {
    Reply::ok(format!("I support this direction.\nAgreement: {}", score))
}

fn evaluation(score: f64, feedback: &str) -> Reply {
    Reply::ok(format!(
        r#"{{"criteriaScores": {{"quality": {}}}, "feedback": "{}", "suggestions": ["add detail"]}}"#,
        score, feedback
    ))
}

// ============================================================================
// Discussion
// ============================================================================

#[tokio::test]
async fn test_single_participant_converges_in_first_round() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("optimist", agreeing(0.9));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![Participant::new("optimist", "Advocate")])
        .with_threshold(0.8)
        .with_max_rounds(3);

    let mut events = discussion.subscribe("adopt-rust");
    let result = discussion
        .run_with_id("adopt-rust", "Should we adopt Rust?", &config)
        .await
        .unwrap();

    assert_eq!(result.status, CollaborationStatus::Completed);
    assert!(result.converged);
    assert_eq!(result.rounds.len(), 1);
    assert!((result.consensus_score - 0.9).abs() < 1e-9);
    assert_eq!(invoker.call_count("optimist"), 1);
    assert!(result.final_consensus.unwrap().contains("I support this direction"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            DiscussionEvent::RoundStarted { .. } => "round_started",
            DiscussionEvent::Contribution { .. } => "contribution",
            DiscussionEvent::RoundCompleted { .. } => "round_completed",
            DiscussionEvent::Converged { .. } => "converged",
            DiscussionEvent::Completed { .. } => "completed",
            DiscussionEvent::Error { .. } => "error",
        });
    }
    assert_eq!(
        kinds,
        vec!["round_started", "contribution", "round_completed", "converged", "completed"]
    );
    assert_eq!(discussion.metrics().converged, 1);
}

#[tokio::test]
async fn test_later_rounds_see_previous_contributions() {
    let invoker = ScriptedInvoker::new();
    invoker.script("a", vec![agreeing(0.5), agreeing(0.9)]);
    invoker.script("b", vec![Reply::ok("Too risky.\nAgreement: 0.5"), agreeing(0.9)]);
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![
        Participant::new("a", "Advocate"),
        Participant::new("b", "Skeptic").with_perspective("operations cost"),
    ])
    .with_threshold(0.85)
    .with_max_rounds(4);

    let result = discussion.run("Rewrite the ingest service?", &config).await.unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.rounds[0].round, 1);
    assert_eq!(result.rounds[1].round, 2);
    assert!((result.rounds[0].consensus_score - 0.5).abs() < 1e-9);

    let second_round_prompt = &invoker.calls_to("a")[1].input;
    assert!(second_round_prompt.contains("Too risky."));
    assert!(invoker.calls_to("b")[0].input.contains("operations cost"));

    // Contributions keep participant order
    let ids: Vec<&str> = result.rounds[1]
        .contributions
        .iter()
        .map(|c| c.participant_id.as_str())
        .collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(result.task_results.len(), 4);
}

#[tokio::test]
async fn test_declining_agreement_runs_all_rounds() {
    let invoker = ScriptedInvoker::new();
    invoker.script("a", vec![agreeing(0.7), agreeing(0.6), agreeing(0.5)]);
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![Participant::new("a", "Member")])
        .with_threshold(0.8)
        .with_max_rounds(3);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert_eq!(result.status, CollaborationStatus::Completed);
    assert!(!result.converged);
    assert_eq!(result.rounds.len(), 3);
    assert!((result.consensus_score - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn test_weighted_strategy() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("lead", agreeing(0.9));
    invoker.set_default("junior", agreeing(0.6));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![
        Participant::new("lead", "Lead").with_weight(0.7),
        Participant::new("junior", "Junior").with_weight(0.3),
    ])
    .with_strategy(ConsensusStrategy::Weighted)
    .with_threshold(0.8)
    .with_max_rounds(1);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert!((result.rounds[0].consensus_score - 0.81).abs() < 1e-9);
    assert!(result.converged);
}

#[tokio::test]
async fn test_facilitator_synthesis_drives_rounds() {
    let invoker = ScriptedInvoker::new();
    invoker.script(
        "moderator",
        vec![
            Reply::ok(r#"{"synthesis": "Split on timeline", "consensusScore": 0.5, "disagreements": ["timeline"]}"#),
            Reply::ok(r#"{"synthesis": "Ship in Q3", "consensusScore": 0.95, "agreements": ["Q3"]}"#),
        ],
    );
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![
        Participant::new("pm", "Product"),
        Participant::new("eng", "Engineering"),
    ])
    .with_strategy(ConsensusStrategy::Facilitator)
    .with_facilitator("moderator")
    .with_threshold(0.9)
    .with_max_rounds(3);

    let result = discussion.run("Release date", &config).await.unwrap();

    assert!(result.converged);
    assert_eq!(result.rounds.len(), 2);
    assert_eq!(result.rounds[0].disagreements, vec!["timeline".to_string()]);
    assert!((result.consensus_score - 0.95).abs() < 1e-9);
    assert_eq!(result.final_consensus.as_deref(), Some("Ship in Q3"));
    assert_eq!(invoker.call_count("moderator"), 2);
    assert!(invoker.calls_to("pm")[1].input.contains("Split on timeline"));
    assert!(invoker.calls_to("moderator")[0].system_prompt.is_some());
}

#[tokio::test]
async fn test_unusable_facilitator_falls_back_to_mean() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("moderator", Reply::ok("I could not decide."));
    invoker.set_default("a", agreeing(0.6));
    invoker.set_default("b", agreeing(0.8));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![Participant::new("a", "A"), Participant::new("b", "B")])
        .with_strategy(ConsensusStrategy::Facilitator)
        .with_facilitator("moderator")
        .with_max_rounds(1);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert!((result.rounds[0].consensus_score - 0.7).abs() < 1e-9);
    assert!(result.rounds[0].synthesis.is_none());
}

#[tokio::test]
async fn test_out_of_range_facilitator_score_falls_back_to_mean() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default(
        "moderator",
        Reply::ok(r#"{"synthesis": "Overjoyed", "consensusScore": 1.4}"#),
    );
    invoker.set_default("a", agreeing(0.6));
    invoker.set_default("b", agreeing(0.8));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![Participant::new("a", "A"), Participant::new("b", "B")])
        .with_strategy(ConsensusStrategy::Facilitator)
        .with_facilitator("moderator")
        .with_max_rounds(1);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert!((result.rounds[0].consensus_score - 0.7).abs() < 1e-9);
    assert!(result.rounds[0].synthesis.is_none());
}

#[tokio::test]
async fn test_facilitator_failures_not_charged_to_namesake_participant() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("moderator", Reply::fail("moderator offline"));
    invoker.set_default("facilitator", agreeing(0.6));
    invoker.set_default("b", agreeing(0.8));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![
        Participant::new("facilitator", "Process coach"),
        Participant::new("b", "B"),
    ])
    .with_strategy(ConsensusStrategy::Facilitator)
    .with_facilitator("moderator")
    .with_max_rounds(2)
    .with_threshold(0.95);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert_eq!(result.rounds.len(), 2);
    let namesake = result
        .participant_summaries
        .iter()
        .find(|s| s.participant_id == "facilitator")
        .unwrap();
    assert_eq!(namesake.contributions, 2);
    assert_eq!(namesake.failures, 0);
    assert_eq!(invoker.call_count("moderator"), 2);
}

#[tokio::test]
async fn test_failed_participant_is_excluded() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("steady", agreeing(0.9));
    invoker.set_default("flaky", Reply::fail("connection reset"));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![
        Participant::new("steady", "Steady"),
        Participant::new("flaky", "Flaky"),
    ])
    .with_max_rounds(1);

    let result = discussion.run("Topic", &config).await.unwrap();
    assert_eq!(result.status, CollaborationStatus::Completed);
    assert_eq!(result.rounds[0].contributions.len(), 1);
    assert_eq!(result.task_results.len(), 2);
    assert!(!result.task_results[1].success);

    let flaky = result
        .participant_summaries
        .iter()
        .find(|s| s.participant_id == "flaky")
        .unwrap();
    assert_eq!(flaky.contributions, 0);
    assert_eq!(flaky.failures, 1);
}

#[tokio::test]
async fn test_round_without_contributions_fails() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("a", Reply::fail("down"));
    let discussion = Discussion::new(invoker.clone());
    let config = DiscussionConfig::new(vec![Participant::new("a", "A")]);

    let mut events = discussion.subscribe("outage");
    let result = discussion.run_with_id("outage", "Topic", &config).await.unwrap();

    assert_eq!(result.status, CollaborationStatus::Failed);
    assert!(result.rounds.is_empty());
    assert!(result.error.unwrap().contains("round 1"));
    assert_eq!(invoker.call_count("a"), 1);

    let mut last = None;
    while let Ok(event) = events.try_recv() {
        last = Some(event);
    }
    assert!(matches!(last, Some(DiscussionEvent::Error { .. })));
    assert_eq!(discussion.metrics().failed, 1);
}

#[tokio::test]
async fn test_invalid_discussion_config_is_rejected() {
    let discussion = Discussion::new(ScriptedInvoker::new());
    let no_facilitator = DiscussionConfig::new(vec![Participant::new("a", "A")])
        .with_strategy(ConsensusStrategy::Facilitator);
    assert!(discussion.run("Topic", &no_facilitator).await.is_err());
    assert!(discussion.run("Topic", &DiscussionConfig::new(vec![])).await.is_err());
}

// ============================================================================
// Self-critique
// ============================================================================

fn quality_config() -> SelfCritiqueConfig {
    SelfCritiqueConfig::new(vec![QualityCriterion::new("quality", 1.0, 0.8)
        .with_description("Complete and correct")])
    .with_evaluator("judge")
}

#[tokio::test]
async fn test_critique_converges_on_second_iteration() {
    let invoker = ScriptedInvoker::new();
    invoker.script("writer", vec![Reply::ok("v1"), Reply::ok("v2")]);
    invoker.script("judge", vec![evaluation(0.5, "too vague"), evaluation(0.95, "great")]);
    let critique = SelfCritique::new(invoker.clone());
    let config = quality_config().with_max_iterations(2).with_stop_threshold(0.9);

    let mut events = critique.subscribe("essay");
    let result = critique
        .run_with_id("essay", "writer", "Explain ownership", &config)
        .await
        .unwrap();

    assert_eq!(result.status, CollaborationStatus::Completed);
    assert!(result.converged);
    assert_eq!(result.iterations.len(), 2);
    assert_eq!(result.final_output.as_deref(), Some("v2"));
    assert!((result.final_score - 0.95).abs() < 1e-9);
    assert_eq!(result.task_results.len(), 4);

    let improvement = &invoker.calls_to("writer")[1].input;
    assert!(improvement.contains("Explain ownership"));
    assert!(improvement.contains("v1"));
    assert!(improvement.contains("too vague"));
    assert!(improvement.contains("add detail"));

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            CritiqueEvent::Iteration { .. } => "iteration",
            CritiqueEvent::Converged { .. } => "converged",
            CritiqueEvent::Completed { .. } => "completed",
            CritiqueEvent::Error { .. } => "error",
        });
    }
    assert_eq!(kinds, vec!["iteration", "iteration", "converged", "completed"]);
}

#[tokio::test]
async fn test_unparseable_evaluation_is_neutral() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("judge", Reply::ok("Looks fine to me!"));
    let critique = SelfCritique::new(invoker.clone());
    let config = quality_config().with_max_iterations(3).with_stop_threshold(0.9);

    let result = critique.run("writer", "Explain traits", &config).await.unwrap();

    assert_eq!(result.status, CollaborationStatus::Completed);
    assert!(!result.converged);
    assert_eq!(result.iterations.len(), 3);
    for iteration in &result.iterations {
        assert!((iteration.critique.overall_score - 0.5).abs() < 1e-9);
        assert!(!iteration.critique.meets_threshold);
    }
    assert_eq!(critique.metrics().runs, 1);
}

#[tokio::test]
async fn test_generation_failure_aborts() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default("writer", Reply::fail("quota exceeded"));
    let critique = SelfCritique::new(invoker.clone());

    let result = critique.run("writer", "Explain macros", &quality_config()).await.unwrap();
    assert_eq!(result.status, CollaborationStatus::Failed);
    assert!(result.iterations.is_empty());
    assert!(result.final_output.is_none());
    assert!(result.error.unwrap().contains("quota exceeded"));
    assert_eq!(invoker.call_count("judge"), 0);
}

#[tokio::test]
async fn test_generation_failure_keeps_earlier_iterations() {
    let invoker = ScriptedInvoker::new();
    invoker.script("writer", vec![Reply::ok("v1"), Reply::fail("quota exceeded")]);
    invoker.set_default("judge", evaluation(0.4, "weak"));
    let critique = SelfCritique::new(invoker.clone());
    let config = quality_config().with_max_iterations(3).with_stop_threshold(0.9);

    let result = critique.run("writer", "Explain macros", &config).await.unwrap();
    assert_eq!(result.status, CollaborationStatus::Failed);
    assert_eq!(result.iterations.len(), 1);
    assert_eq!(result.final_output.as_deref(), Some("v1"));
}

#[tokio::test]
async fn test_per_criterion_thresholds_without_stop_threshold() {
    let invoker = ScriptedInvoker::new();
    invoker.set_default(
        "judge",
        Reply::ok(r#"{"criteriaScores": {"clarity": 0.75, "accuracy": 0.9}, "feedback": "ok"}"#),
    );
    let critique = SelfCritique::new(invoker.clone());
    let config = SelfCritiqueConfig::new(vec![
        QualityCriterion::new("clarity", 0.5, 0.7),
        QualityCriterion::new("accuracy", 0.5, 0.85),
    ])
    .with_evaluator("judge")
    .with_max_iterations(3);

    let result = critique.run("writer", "Explain lifetimes", &config).await.unwrap();
    assert!(result.converged);
    assert_eq!(result.iterations.len(), 1);
    assert!((result.final_score - 0.825).abs() < 1e-9);
}

#[tokio::test]
async fn test_custom_improvement_template() {
    let invoker = ScriptedInvoker::new();
    invoker.script("writer", vec![Reply::ok("v1"), Reply::ok("v2")]);
    invoker.set_default("judge", evaluation(0.3, "needs examples"));
    let critique = SelfCritique::new(invoker.clone());
    let config = quality_config()
        .with_max_iterations(2)
        .with_stop_threshold(0.9)
        .with_improvement_template("Improve {{previous_output}} per {{feedback}}");

    critique.run("writer", "Explain closures", &config).await.unwrap();
    assert_eq!(invoker.calls_to("writer")[1].input, "Improve v1 per needs examples");
}
