//! Prompt construction for each task type.
//!
//! Prompts are plain text handed to whichever agent runs the task. The
//! payload fields understood here are `files`, `userContext`,
//! `includeRequirements` and, for chat, `message`; anything else is passed
//! through untouched as JSON context.

use cs_core::types::TaskType;
use serde_json::Value;

/// System-level instruction for a task type.
pub fn system_prompt(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::CodebaseAnalysis => {
            "You are a senior software architect. Analyze the repository, identify its \
             business domains and the files that belong to each, and report them as JSON."
        }
        TaskType::Documentation => {
            "You are a technical writer. Produce clear markdown documentation for the \
             given domain: purpose, main flows, key modules and their responsibilities."
        }
        TaskType::Requirements => {
            "You are a business analyst. Extract the functional and non-functional \
             requirements implemented by the given domain as a structured list."
        }
        TaskType::BugsSecurity => {
            "You are a security reviewer. Find bugs and security vulnerabilities in the \
             given domain. For each finding give severity, location and a suggested fix."
        }
        TaskType::Testing => {
            "You are a test engineer. Propose test cases for the given domain, covering \
             happy paths, edge cases and failure modes."
        }
        TaskType::Diagrams => {
            "You are a software architect. Describe the given domain with mermaid \
             diagrams (component, sequence and data-flow)."
        }
        TaskType::Chat => {
            "You are an assistant answering questions about a specific part of a codebase. \
             Be concise and cite files when relevant."
        }
    }
}

/// Render the full prompt for a validated payload.
pub fn build_prompt(task_type: TaskType, domain_id: Option<&str>, payload: &Value) -> String {
    let mut prompt = String::from(system_prompt(task_type));
    prompt.push_str("\n\n");

    if let Some(domain) = domain_id {
        prompt.push_str(&format!("Domain: {domain}\n"));
    }

    if let Some(files) = payload.get("files").and_then(Value::as_array) {
        if !files.is_empty() {
            prompt.push_str("Files in scope:\n");
            for file in files.iter().filter_map(Value::as_str) {
                prompt.push_str(&format!("- {file}\n"));
            }
        }
    }

    if payload
        .get("includeRequirements")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        prompt.push_str(
            "Use the previously extracted requirements for this domain as additional context.\n",
        );
    }

    if let Some(ctx) = payload
        .get("userContext")
        .and_then(Value::as_str)
        .filter(|c| !c.trim().is_empty())
    {
        prompt.push_str(&format!("\nAdditional context from the user:\n{ctx}\n"));
    }

    if task_type == TaskType::Chat {
        if let Some(history) = payload.get("history").and_then(Value::as_array) {
            prompt.push_str("\nConversation so far:\n");
            for turn in history {
                let role = turn.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = turn.get("content").and_then(Value::as_str).unwrap_or_default();
                prompt.push_str(&format!("{role}: {content}\n"));
            }
        }
        if let Some(message) = payload.get("message").and_then(Value::as_str) {
            prompt.push_str(&format!("\nQuestion:\n{message}\n"));
        }
    }

    prompt.push_str(
        "\nReport progress as lines starting with [PROGRESS]. \
         End with a single line containing the JSON result.\n",
    );
    prompt
}
