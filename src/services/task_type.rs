//! Task-type inference for incoming requests.
//!
//! A lowercased keyword scan over the user-authored prompt text decides
//! which routing policy and capability column apply. An explicit task type
//! from the request overrides inference when it names a known type.

use crate::api::models::{ChatMessage, Role};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Task flavor of a request, driving policy and capability lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Code,
    Reasoning,
    Research,
    Rewrite,
    Default,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Reasoning => "reasoning",
            TaskType::Research => "research",
            TaskType::Rewrite => "rewrite",
            TaskType::Default => "default",
        }
    }

    /// Parse an explicit task-type value; `None` for anything outside the
    /// known set.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "code" => Some(TaskType::Code),
            "reasoning" => Some(TaskType::Reasoning),
            "research" => Some(TaskType::Research),
            "rewrite" => Some(TaskType::Rewrite),
            "default" => Some(TaskType::Default),
            _ => None,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CODE_KEYWORDS: &[&str] = &[
    "stack trace",
    "error",
    "exception",
    "refactor",
    "implement",
    "bug",
    "typescript",
    "javascript",
];

const REWRITE_KEYWORDS: &[&str] = &["summarize", "rewrite", "rephrase", "tone", "polish"];

const RESEARCH_KEYWORDS: &[&str] = &["latest", "source", "sources", "compare", "research", "cite"];

/// Infer the task type from the user-authored portions of the conversation.
pub fn infer_task_type(messages: &[ChatMessage]) -> TaskType {
    let prompt: String = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();

    if prompt.contains("```") || CODE_KEYWORDS.iter().any(|k| prompt.contains(k)) {
        return TaskType::Code;
    }
    if REWRITE_KEYWORDS.iter().any(|k| prompt.contains(k)) {
        return TaskType::Rewrite;
    }
    if RESEARCH_KEYWORDS.iter().any(|k| prompt.contains(k)) {
        return TaskType::Research;
    }
    TaskType::Reasoning
}

/// Resolve the effective task type: an explicit known value wins, otherwise
/// infer from the prompt.
pub fn resolve_task_type(explicit: Option<&str>, messages: &[ChatMessage]) -> TaskType {
    explicit
        .and_then(TaskType::parse)
        .unwrap_or_else(|| infer_task_type(messages))
}
