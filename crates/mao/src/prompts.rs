//! Prompt construction for the CTO and worker agents.
//!
//! The marker blocks embedded here are the wire contract the response
//! parser recognises; their byte forms must not drift.

use std::path::Path;

use crate::roles::RoleCatalog;

/// Instruction appended to every agent prompt so the supervisor can detect
/// completion from the pane log.
pub const COMPLETION_INSTRUCTION: &str = "\n\n## Reporting completion\n\n\
When the task is finished, you MUST print exactly this marker block:\n\n\
[MAO_TASK_COMPLETE]\n\
status: success | failed\n\
changed_files:\n\
  - path/to/file1\n\
  - path/to/file2\n\
summary: <one line>\n\
[/MAO_TASK_COMPLETE]\n\n\
The orchestrator watches for this marker to move your work into the\n\
approval queue. Do not print it before the task is actually done.\n";

/// Feedback-recording instruction given to the CTO.
const FEEDBACK_INSTRUCTION: &str = "\
When you notice something MAO itself should do better, record it as:\n\n\
[MAO_FEEDBACK_START]\n\
Title: <one line>\n\
Category: bug | feature | improvement | documentation\n\
Priority: low | medium | high | critical\n\
Description: |\n\
  <details>\n\
[MAO_FEEDBACK_END]\n";

/// Completion-declaration instruction for feedback-improvement runs.
const FEEDBACK_COMPLETED_INSTRUCTION: &str = "\
Once every task is approved, commit the work, open a pull request with\n\
`gh pr create`, and declare completion with:\n\n\
[FEEDBACK_COMPLETED]\n\
PR: <url>\n\
Summary: <text>\n\
[/FEEDBACK_COMPLETED]\n\n\
MAO will then clean up worktrees and shut the workflow down.\n";

/// Banner inserted above operator feedback when a rejected task restarts.
pub const RETRY_BANNER: &str = "【前回の指摘事項】";

/// Prompt for re-running a rejected task with the operator's feedback.
pub fn build_retry_prompt(original_description: &str, feedback: &str) -> String {
    format!(
        "{original_description}\n\n{RETRY_BANNER}\n{feedback}\n\n\
         上記のフィードバックを反映して修正してください。\n"
    )
}

/// Augment a sub-task description into the full worker-agent prompt.
///
/// When the agent works in its own worktree, a notice names the path and
/// branch so the agent commits there instead of the project root.
pub fn build_agent_prompt(
    task_description: &str,
    worktree: Option<(&Path, &str)>,
) -> String {
    match worktree {
        Some((path, branch)) => format!(
            "You are working in a dedicated git worktree.\n\
             Worktree: {}\n\
             Branch: {}\n\n\
             Commit your changes on this branch when done; merging is\n\
             handled by the CTO after review.\n\n\
             {}{}",
            path.display(),
            branch,
            task_description,
            COMPLETION_INSTRUCTION
        ),
        None => format!("{task_description}{COMPLETION_INSTRUCTION}"),
    }
}

/// Build the full CTO prompt for one operator message.
///
/// Includes the recent conversation, the role catalogue, the spawn
/// directive contract, and, in feedback mode, the worktree workflow and
/// completion declaration.
pub fn build_cto_prompt(
    message: &str,
    history: &[(String, String)],
    catalog: &RoleCatalog,
    feedback_branch: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are the CTO of the MAO multi-agent system.\n\n");
    prompt.push_str(
        "You own technical delivery: analyse the request, split it into\n\
         1-5 focused tasks, and dispatch each to a specialist agent.\n\n",
    );

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n\n");
        for (role, content) in history {
            let name = if role == "user" { "User" } else { "Assistant" };
            prompt.push_str(&format!("{name}: {content}\n\n"));
        }
        prompt.push_str("---\n\n");
    }

    prompt.push_str(&format!("Current request from the operator: {message}\n\n"));

    if let Some(branch) = feedback_branch {
        prompt.push_str(&format!(
            "---\n\
             Git worktree workflow is ACTIVE. You are on branch `{branch}`.\n\
             Every agent gets its own worktree and branch\n\
             (`{branch}-agent-N`), commits there, and you review and merge\n\
             after approval.\n\
             ---\n\n"
        ));
    }

    prompt.push_str("Available roles:\n");
    for role in catalog.iter() {
        prompt.push_str(&format!("   - **{}**: {}\n", role.name, role.display_name));
        if let Some(first) = role.responsibilities.first() {
            prompt.push_str(&format!("     use for: {first}\n"));
        }
        prompt.push_str(&format!("     default model: {}\n", role.model));
    }
    prompt.push('\n');

    prompt.push_str(
        "To dispatch a task, print one directive per agent, exactly in\n\
         this form:\n\n\
         [MAO_AGENT_SPAWN]\n\
         {\"task\": \"<what to do>\", \"role\": \"<role name>\", \
         \"model\": \"opus|sonnet|haiku\", \"priority\": \"low|medium|high|critical\"}\n\
         [/MAO_AGENT_SPAWN]\n\n\
         `model` and `priority` are optional; the role default applies.\n\
         Print one block per task, nothing else around them on the line.\n\n\
         Model guide: opus for complex design work, sonnet for ordinary\n\
         implementation, haiku for simple lookups and small fixes.\n\n",
    );

    if feedback_branch.is_some() {
        prompt.push_str(FEEDBACK_COMPLETED_INSTRUCTION);
        prompt.push('\n');
    }

    prompt.push_str(FEEDBACK_INSTRUCTION);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_completion_instruction_carries_the_markers() {
        assert!(COMPLETION_INSTRUCTION.contains("[MAO_TASK_COMPLETE]"));
        assert!(COMPLETION_INSTRUCTION.contains("[/MAO_TASK_COMPLETE]"));
        assert!(COMPLETION_INSTRUCTION.contains("status: success | failed"));
    }

    #[test]
    fn test_retry_prompt_shape() {
        let prompt = build_retry_prompt("fix the handler", "please add a type annotation");
        assert!(prompt.starts_with("fix the handler\n\n【前回の指摘事項】\n"));
        assert!(prompt.contains("please add a type annotation"));
    }

    #[test]
    fn test_agent_prompt_with_worktree_notice() {
        let path = PathBuf::from("/repo/.mao/worktrees/worker-agent-1-x");
        let prompt = build_agent_prompt("do the thing", Some((&path, "feedback/1-agent-1")));
        assert!(prompt.contains("dedicated git worktree"));
        assert!(prompt.contains("worker-agent-1-x"));
        assert!(prompt.contains("feedback/1-agent-1"));
        assert!(prompt.contains("do the thing"));
        assert!(prompt.ends_with(COMPLETION_INSTRUCTION));
    }

    #[test]
    fn test_agent_prompt_without_worktree() {
        let prompt = build_agent_prompt("just a task", None);
        assert!(prompt.starts_with("just a task"));
        assert!(prompt.contains("[MAO_TASK_COMPLETE]"));
        assert!(!prompt.contains("worktree"));
    }

    #[test]
    fn test_cto_prompt_lists_roles_and_contract() {
        let catalog = RoleCatalog::builtin();
        let prompt = build_cto_prompt("add logging", &[], &catalog, None);
        assert!(prompt.contains("[MAO_AGENT_SPAWN]"));
        assert!(prompt.contains("coder_backend"));
        assert!(prompt.contains("add logging"));
        assert!(prompt.contains("[MAO_FEEDBACK_START]"));
        // Not in feedback mode: no completion declaration.
        assert!(!prompt.contains("[FEEDBACK_COMPLETED]"));
    }

    #[test]
    fn test_cto_prompt_feedback_mode() {
        let catalog = RoleCatalog::builtin();
        let history = vec![("user".to_string(), "earlier message".to_string())];
        let prompt = build_cto_prompt(
            "improve retries",
            &history,
            &catalog,
            Some("feedback/3_abcd-retry"),
        );
        assert!(prompt.contains("feedback/3_abcd-retry"));
        assert!(prompt.contains("[FEEDBACK_COMPLETED]"));
        assert!(prompt.contains("earlier message"));
    }

    #[test]
    fn test_cto_prompt_spawn_example_parses() {
        // The contract block shown to the CTO must itself satisfy the parser.
        let catalog = RoleCatalog::builtin();
        let prompt = build_cto_prompt("x", &[], &catalog, None);
        let extraction = crate::parser::extract_agent_spawns(&prompt);
        // The example block has placeholder values but valid framing.
        assert_eq!(extraction.directives.len(), 1);
        assert_eq!(extraction.directives[0].task, "<what to do>");
    }
}
