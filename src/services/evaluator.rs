//! Response quality evaluation.
//!
//! Every candidate output is scored in [0, 1] by a pure heuristic over the
//! text, the task type, and tool-call presence. Two optional refinements
//! exist: an executable code check (configured shell command fed the
//! candidate on stdin) and a judge model consulted for borderline scores.

use crate::api::models::ChatMessage;
use crate::core::config::{CodeEvalConfig, ModelSpec};
use crate::services::provider::{GenerationRequest, ProviderAdapter};
use lazy_static::lazy_static;
use regex::Regex;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Phrases that mark a refusal; matched case-insensitively.
const REFUSAL_PHRASES: &[&str] = &[
    "i can't",
    "i cannot",
    "i am not able",
    "i'm not able",
    "as an ai",
    "i do not have the ability",
    "i cannot comply",
    "unable to help",
];

lazy_static! {
    static ref FILE_PATH_HINT: Regex =
        Regex::new(r"(src/|lib/|tests/|\.(ts|js|py|go)\b)").unwrap();
    static ref URL_TOKEN: Regex = Regex::new(r"https?://\S+").unwrap();
    static ref JUDGE_SCORE: Regex = Regex::new(r"(0(\.\d+)?|1(\.0+)?)").unwrap();
}

/// Evaluation result: a clamped score plus the adjustments that produced it.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub score: f64,
    pub details: Vec<String>,
}

/// Pure heuristic score over (text, task, tool-call presence).
pub fn heuristic_score(text: &str, task: &str, has_tool_calls: bool) -> Evaluation {
    let mut details = Vec::new();

    if text.trim().is_empty() && !has_tool_calls {
        return Evaluation {
            score: 0.0,
            details: vec!["empty response".to_string()],
        };
    }

    let mut score: f64 = if has_tool_calls { 0.45 } else { 0.35 };

    let length = text.chars().count();
    if length >= 120 {
        score += 0.15;
        details.push("length>=120".to_string());
    }
    if length >= 400 {
        score += 0.20;
        details.push("length>=400".to_string());
    }
    if length < 40 {
        score -= 0.20;
        details.push("length<40".to_string());
    }

    let lower = text.to_lowercase();
    if REFUSAL_PHRASES.iter().any(|p| lower.contains(p)) {
        score -= 0.70;
        details.push("refusal phrase".to_string());
    }

    match task {
        "code" => {
            if has_code_block(text) {
                score += 0.25;
                details.push("code block".to_string());
            } else if !has_tool_calls {
                score -= 0.30;
                details.push("no code block".to_string());
            }
            if FILE_PATH_HINT.is_match(text) {
                score += 0.05;
                details.push("file path hint".to_string());
            }
        }
        "research" => {
            if URL_TOKEN.is_match(text) {
                score += 0.10;
                details.push("url present".to_string());
            }
        }
        _ => {}
    }

    Evaluation {
        score: score.clamp(0.0, 1.0),
        details,
    }
}

/// Whether the text carries a fenced code block or unified-diff markers.
fn has_code_block(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let has_minus = text.lines().any(|l| l.starts_with("--- "));
    let has_plus = text.lines().any(|l| l.starts_with("+++ "));
    let has_hunk = text.lines().any(|l| l.starts_with("@@"));
    (has_minus && has_plus) || has_hunk
}

/// Score a candidate output, applying the executable code check when
/// configured and the task is code.
pub async fn evaluate(
    text: &str,
    task: &str,
    has_tool_calls: bool,
    code_eval: Option<&CodeEvalConfig>,
) -> Evaluation {
    let mut evaluation = heuristic_score(text, task, has_tool_calls);

    if task == "code" {
        if let Some(config) = code_eval {
            match run_code_eval(text, config).await {
                Some(true) => {
                    evaluation.score += config.weight;
                    evaluation.details.push("code eval passed".to_string());
                }
                Some(false) => {
                    evaluation.score -= config.failure_penalty;
                    evaluation.details.push("code eval failed".to_string());
                }
                None => {
                    evaluation.details.push("code eval unavailable".to_string());
                }
            }
            evaluation.score = evaluation.score.clamp(0.0, 1.0);
        }
    }

    evaluation
}

/// Run the configured evaluation command with the candidate text on stdin.
///
/// Returns `Some(true)` on exit 0, `Some(false)` on non-zero exit or
/// timeout (the subprocess is killed), and `None` when the command could
/// not be started.
async fn run_code_eval(text: &str, config: &CodeEvalConfig) -> Option<bool> {
    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&config.command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!(error = %e, command = %config.command, "Failed to spawn code evaluator");
            return None;
        }
    };

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(text.as_bytes()).await {
            tracing::debug!(error = %e, "Failed to feed code evaluator stdin");
        }
        // Dropping stdin closes the pipe so the command sees EOF.
    }

    match tokio::time::timeout(Duration::from_millis(config.timeout_ms), child.wait()).await {
        Ok(Ok(status)) => Some(status.success()),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Code evaluator wait failed");
            None
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = config.timeout_ms,
                "Code evaluator timed out, killing"
            );
            let _ = child.kill().await;
            Some(false)
        }
    }
}

/// Ask the judge model to re-score a borderline answer.
///
/// Failures are swallowed; the judge is best-effort and never makes an
/// attempt worse than its heuristic score already did.
pub async fn judge_score(
    adapter: &dyn ProviderAdapter,
    judge: &ModelSpec,
    question: &str,
    answer: &str,
) -> Option<f64> {
    let prompt = format!(
        "You are grading an assistant's answer. Score its quality and task fit \
         on a scale from 0 to 1. Reply with a single number and nothing else.\n\n\
         Question:\n{}\n\nAnswer:\n{}",
        question, answer
    );

    let request = GenerationRequest {
        messages: vec![ChatMessage::user(prompt)],
        temperature: Some(0.0),
        max_tokens: Some(8),
        ..Default::default()
    };

    match adapter.generate(judge, &request).await {
        Ok(response) => parse_judge_score(&response.text),
        Err(e) => {
            tracing::debug!(judge = %judge.id, error = %e, "Judge call failed, keeping heuristic score");
            None
        }
    }
}

/// Parse the first `0(.d+)?|1(.0+)?` token out of a judge reply.
pub fn parse_judge_score(text: &str) -> Option<f64> {
    JUDGE_SCORE
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_scores_zero() {
        let eval = heuristic_score("", "reasoning", false);
        assert_eq!(eval.score, 0.0);

        let eval = heuristic_score("   \n", "reasoning", false);
        assert_eq!(eval.score, 0.0);
    }

    #[test]
    fn test_empty_text_with_tool_calls_keeps_base() {
        let eval = heuristic_score("", "reasoning", true);
        // Base 0.45, minus the short-text penalty.
        assert!((eval.score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_short_text_penalized() {
        let eval = heuristic_score("no", "reasoning", false);
        // 0.35 - 0.20
        assert!((eval.score - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_length_bonuses_are_cumulative() {
        let medium = "a".repeat(150);
        let eval = heuristic_score(&medium, "reasoning", false);
        assert!((eval.score - 0.50).abs() < 1e-9);

        let long = "a".repeat(450);
        let eval = heuristic_score(&long, "reasoning", false);
        assert!((eval.score - 0.70).abs() < 1e-9);
    }

    #[test]
    fn test_refusal_penalty() {
        let text = format!("I cannot help with that request. {}", "x".repeat(120));
        let eval = heuristic_score(&text, "reasoning", false);
        // 0.35 + 0.15 - 0.70, clamped at 0
        assert_eq!(eval.score, 0.0);
        assert!(eval.details.iter().any(|d| d == "refusal phrase"));
    }

    #[test]
    fn test_refusal_is_case_insensitive() {
        let eval = heuristic_score("AS AN AI, I must decline.", "reasoning", false);
        assert!(eval.details.iter().any(|d| d == "refusal phrase"));
    }

    #[test]
    fn test_code_task_rewards_fenced_block() {
        let text = format!("```ts\nexport const x = 1;\n```\n{}", "x".repeat(120));
        let eval = heuristic_score(&text, "code", false);
        // 0.35 + 0.15 + 0.25
        assert!((eval.score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_code_task_rewards_diff_markers() {
        let text = format!(
            "--- a/src/main.rs\n+++ b/src/main.rs\n@@ -1,3 +1,4 @@\n{}",
            "x".repeat(120)
        );
        let eval = heuristic_score(&text, "code", false);
        assert!(eval.details.iter().any(|d| d == "code block"));
        // File-path hint also fires on src/.
        assert!(eval.details.iter().any(|d| d == "file path hint"));
    }

    #[test]
    fn test_code_task_without_block_penalized() {
        let text = "x".repeat(150);
        let eval = heuristic_score(&text, "code", false);
        // 0.35 + 0.15 - 0.30
        assert!((eval.score - 0.20).abs() < 1e-9);
    }

    #[test]
    fn test_code_task_tool_calls_skip_missing_block_penalty() {
        let text = "x".repeat(150);
        let eval = heuristic_score(&text, "code", true);
        // 0.45 + 0.15, no penalty
        assert!((eval.score - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_file_path_hint_bonus() {
        let text = format!("Edit tests/parser.py accordingly. {}", "x".repeat(120));
        let eval = heuristic_score(&text, "code", false);
        // 0.35 + 0.15 - 0.30 + 0.05
        assert!((eval.score - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_research_url_bonus() {
        let text = format!("See https://example.org/paper for details. {}", "x".repeat(120));
        let eval = heuristic_score(&text, "research", false);
        // 0.35 + 0.15 + 0.10
        assert!((eval.score - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_score_clamped_to_unit_interval() {
        let text = format!("```rs\nfn f() {{}}\n```\nsrc/lib.rs\n{}", "x".repeat(500));
        let eval = heuristic_score(&text, "code", true);
        assert!(eval.score <= 1.0);

        let eval = heuristic_score("I can't", "code", false);
        assert!(eval.score >= 0.0);
    }

    #[test]
    fn test_heuristic_is_pure() {
        let text = "a".repeat(200);
        let a = heuristic_score(&text, "code", false);
        let b = heuristic_score(&text, "code", false);
        assert_eq!(a.score, b.score);
        assert_eq!(a.details, b.details);
    }

    #[test]
    fn test_parse_judge_score() {
        assert_eq!(parse_judge_score("0.85"), Some(0.85));
        assert_eq!(parse_judge_score("Score: 0.4 overall"), Some(0.4));
        assert_eq!(parse_judge_score("1"), Some(1.0));
        assert_eq!(parse_judge_score("1.0"), Some(1.0));
        assert_eq!(parse_judge_score("no number here"), None);
    }

    #[tokio::test]
    async fn test_code_eval_pass_adds_weight() {
        let config = CodeEvalConfig {
            command: "exit 0".to_string(),
            timeout_ms: 5_000,
            weight: 0.3,
            failure_penalty: 0.4,
        };
        let text = "x".repeat(150);
        let eval = evaluate(&text, "code", false, Some(&config)).await;
        // heuristic 0.20 + 0.3
        assert!((eval.score - 0.50).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_code_eval_failure_subtracts_penalty() {
        let config = CodeEvalConfig {
            command: "exit 1".to_string(),
            timeout_ms: 5_000,
            weight: 0.3,
            failure_penalty: 0.4,
        };
        let text = format!("```ts\nconst x = 1;\n```\n{}", "x".repeat(120));
        let eval = evaluate(&text, "code", false, Some(&config)).await;
        // heuristic 0.75 - 0.4
        assert!((eval.score - 0.35).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_code_eval_reads_stdin() {
        let config = CodeEvalConfig {
            command: "grep -q MARKER".to_string(),
            timeout_ms: 5_000,
            weight: 0.3,
            failure_penalty: 0.4,
        };
        let with_marker = format!("MARKER {}", "x".repeat(150));
        let without_marker = "x".repeat(150);

        let passed = evaluate(&with_marker, "code", false, Some(&config)).await;
        let failed = evaluate(&without_marker, "code", false, Some(&config)).await;
        assert!(passed.score > failed.score);
    }

    #[tokio::test]
    async fn test_code_eval_timeout_counts_as_failure() {
        let config = CodeEvalConfig {
            command: "sleep 30".to_string(),
            timeout_ms: 100,
            weight: 0.3,
            failure_penalty: 0.4,
        };
        let text = "x".repeat(150);
        let eval = evaluate(&text, "code", false, Some(&config)).await;
        assert!(eval.details.iter().any(|d| d == "code eval failed"));
    }

    #[tokio::test]
    async fn test_code_eval_skipped_for_non_code_tasks() {
        let config = CodeEvalConfig {
            command: "exit 0".to_string(),
            timeout_ms: 5_000,
            weight: 0.3,
            failure_penalty: 0.4,
        };
        let text = "x".repeat(150);
        let eval = evaluate(&text, "reasoning", false, Some(&config)).await;
        // Plain heuristic: 0.35 + 0.15
        assert!((eval.score - 0.50).abs() < 1e-9);
    }
}
