//! Extraction of structured blocks from CTO and agent output.
//!
//! The parser is pure: no I/O, no state between calls, deterministic over
//! the same input. It runs against the full accumulated text each time;
//! every extracted block carries its byte span so callers can de-duplicate
//! by recording which offsets they have already consumed.
//!
//! Four grammars are recognised:
//!
//! - `[MAO_AGENT_SPAWN] {json} [/MAO_AGENT_SPAWN]`: spawn directives
//! - `[MAO_TASK_COMPLETE] ... [/MAO_TASK_COMPLETE]`: task completion,
//!   with a small set of prose alternates
//! - `[MAO_FEEDBACK_START] ... [MAO_FEEDBACK_END]`: feedback entries
//! - `[FEEDBACK_COMPLETED] ... [/FEEDBACK_COMPLETED]`: workflow shutdown
//!
//! A legacy `Task N:` text form exists as a fallback for CTO responses
//! that contain no structured spawn blocks; structured directives always
//! take precedence.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use coordination::MaoError;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Byte range of an extracted block in the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// Priority carried by a spawn directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = MaoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(MaoError::validation(format!("unknown priority '{other}'"))),
        }
    }
}

/// One agent-spawn directive from the CTO.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnDirective {
    pub task: String,
    pub role: String,
    pub model: Option<String>,
    pub priority: TaskPriority,
    pub span: Span,
}

/// Result of scanning for spawn directives. Invalid blocks are skipped and
/// described in `warnings` for the caller to log.
#[derive(Debug, Default)]
pub struct SpawnExtraction {
    pub directives: Vec<SpawnDirective>,
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
struct SpawnBody {
    #[serde(default)]
    task: String,
    #[serde(default)]
    role: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

fn spawn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[MAO_AGENT_SPAWN\](.*?)\[/MAO_AGENT_SPAWN\]")
            .expect("static regex")
    })
}

/// Extract every `[MAO_AGENT_SPAWN]` block, in order of occurrence.
pub fn extract_agent_spawns(text: &str) -> SpawnExtraction {
    let mut extraction = SpawnExtraction::default();

    for captures in spawn_regex().captures_iter(text) {
        let whole = captures.get(0).map(|m| Span {
            start: m.start(),
            end: m.end(),
        });
        let Some(span) = whole else { continue };
        let body = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");

        let parsed: SpawnBody = match serde_json::from_str(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                extraction
                    .warnings
                    .push(format!("invalid spawn block JSON: {e}"));
                continue;
            }
        };
        if parsed.task.is_empty() || parsed.role.is_empty() {
            extraction.warnings.push(format!(
                "spawn block missing required fields (task='{}', role='{}')",
                parsed.task, parsed.role
            ));
            continue;
        }
        let priority = match parsed.priority.as_deref() {
            None => TaskPriority::Medium,
            Some(p) => match p.parse() {
                Ok(priority) => priority,
                Err(_) => {
                    extraction
                        .warnings
                        .push(format!("spawn block has unknown priority '{p}', using medium"));
                    TaskPriority::Medium
                }
            },
        };

        extraction.directives.push(SpawnDirective {
            task: parsed.task,
            role: parsed.role,
            model: parsed.model,
            priority,
            span,
        });
    }

    extraction
}

/// A detected task completion.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    /// `success` / `failed` from the structured block, if present.
    pub status: Option<String>,
    pub changed_files: Vec<String>,
    pub summary: Option<String>,
    /// Which pattern fired (the marker itself or a prose alternate).
    pub pattern: &'static str,
    pub span: Span,
}

const COMPLETION_MARKER: &str = r"\[MAO_TASK_COMPLETE\]";

/// Prose alternates that also signal completion, without structured fields.
const PROSE_COMPLETIONS: &[&str] = &[
    "タスクを完了しました",
    "Task completed",
    "変更をコミットしました",
    "changes have been committed",
];

fn completion_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[MAO_TASK_COMPLETE\](.*?)\[/MAO_TASK_COMPLETE\]")
            .expect("static regex")
    })
}

fn completion_fields() -> &'static (Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"status:\s*(\w+)").expect("static regex"),
            Regex::new(r"summary:\s*(.+)").expect("static regex"),
            Regex::new(r"changed_files:\s*\n((?:\s*-\s*.+\n?)+)").expect("static regex"),
        )
    })
}

/// Detect a completion in accumulated agent output. The structured marker
/// wins over the prose alternates; first match wins overall.
pub fn detect_task_completion(text: &str) -> Option<TaskCompletion> {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    let marker = MARKER.get_or_init(|| Regex::new(COMPLETION_MARKER).expect("static regex"));

    if let Some(found) = marker.find(text) {
        let mut completion = TaskCompletion {
            status: None,
            changed_files: Vec::new(),
            summary: None,
            pattern: "[MAO_TASK_COMPLETE]",
            span: Span {
                start: found.start(),
                end: found.end(),
            },
        };

        if let Some(captures) = completion_block_regex().captures(text) {
            if let Some(whole) = captures.get(0) {
                completion.span = Span {
                    start: whole.start(),
                    end: whole.end(),
                };
            }
            let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");
            let (status_re, summary_re, files_re) = completion_fields();
            completion.status = status_re
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            completion.summary = summary_re
                .captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string());
            if let Some(files) = files_re.captures(body).and_then(|c| c.get(1)) {
                completion.changed_files = files
                    .as_str()
                    .lines()
                    .map(|l| l.trim().trim_start_matches('-').trim())
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
            }
        }
        return Some(completion);
    }

    for pattern in PROSE_COMPLETIONS {
        if let Some(start) = text.find(pattern) {
            return Some(TaskCompletion {
                status: None,
                changed_files: Vec::new(),
                summary: None,
                pattern,
                span: Span {
                    start,
                    end: start + pattern.len(),
                },
            });
        }
    }

    None
}

/// One `[MAO_FEEDBACK_START]` block.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackBlock {
    pub title: String,
    pub category: String,
    pub priority: String,
    pub description: String,
    pub span: Span,
}

fn feedback_regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"(?s)\[MAO_FEEDBACK_START\](.*?)\[MAO_FEEDBACK_END\]")
                .expect("static regex"),
            Regex::new(r"Title:\s*(.+)").expect("static regex"),
            Regex::new(r"Category:\s*(\w+)").expect("static regex"),
            Regex::new(r"Priority:\s*(\w+)").expect("static regex"),
            Regex::new(r"(?s)Description:\s*\|?\s*(.+)").expect("static regex"),
        )
    })
}

/// Extract every feedback block. Blocks without a title and description
/// are dropped.
pub fn extract_feedbacks(text: &str) -> Vec<FeedbackBlock> {
    let (block_re, title_re, category_re, priority_re, description_re) = feedback_regexes();
    let mut blocks = Vec::new();

    for captures in block_re.captures_iter(text) {
        let Some(whole) = captures.get(0) else { continue };
        let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");

        let title = title_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        let description = description_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string());
        let (Some(title), Some(description)) = (title, description) else {
            continue;
        };
        if title.is_empty() || description.is_empty() {
            continue;
        }

        let field = |re: &Regex, default: &str| {
            re.captures(body)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_else(|| default.to_string())
        };

        blocks.push(FeedbackBlock {
            title,
            category: field(category_re, "improvement"),
            priority: field(priority_re, "medium"),
            description,
            span: Span {
                start: whole.start(),
                end: whole.end(),
            },
        });
    }

    blocks
}

/// A `[FEEDBACK_COMPLETED]` workflow-shutdown block.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackCompleted {
    pub pr_url: Option<String>,
    pub summary: Option<String>,
    pub span: Span,
}

fn feedback_completed_regexes() -> &'static (Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"(?s)\[FEEDBACK_COMPLETED\](.*?)\[/FEEDBACK_COMPLETED\]")
                .expect("static regex"),
            Regex::new(r"PR:\s*(.+)").expect("static regex"),
            Regex::new(r"(?s)Summary:\s*(.+)").expect("static regex"),
        )
    })
}

/// Detect a feedback-completion block.
pub fn extract_feedback_completed(text: &str) -> Option<FeedbackCompleted> {
    let (block_re, pr_re, summary_re) = feedback_completed_regexes();
    let captures = block_re.captures(text)?;
    let whole = captures.get(0)?;
    let body = captures.get(1).map(|m| m.as_str()).unwrap_or("");

    Some(FeedbackCompleted {
        pr_url: pr_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string()),
        summary: summary_re
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string()),
        span: Span {
            start: whole.start(),
            end: whole.end(),
        },
    })
}

/// One task from the legacy `Task N:` text form.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyTask {
    pub number: u32,
    pub description: String,
    pub role: String,
    pub model: Option<String>,
    pub span: Span,
}

fn legacy_regexes() -> &'static (Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"(?m)^\s*(?:Task|タスク)\s*(\d+)[:：]\s*").expect("static regex"),
            Regex::new(r"(?i)(?:Role|ロール)[:：]\s*(\S+)").expect("static regex"),
            Regex::new(r"(?i)(?:Model|モデル)[:：]\s*(\S+)").expect("static regex"),
        )
    })
}

/// Extract the legacy `Task N:` form. Used only as a fallback when a CTO
/// response contains no structured spawn blocks.
pub fn extract_legacy_tasks(text: &str) -> Vec<LegacyTask> {
    let (head_re, role_re, model_re) = legacy_regexes();

    let heads: Vec<(usize, usize, u32)> = head_re
        .captures_iter(text)
        .filter_map(|c| {
            let whole = c.get(0)?;
            let number = c.get(1)?.as_str().parse().ok()?;
            Some((whole.start(), whole.end(), number))
        })
        .collect();

    let mut tasks = Vec::new();
    for (index, &(start, body_start, number)) in heads.iter().enumerate() {
        let mut end = heads
            .get(index + 1)
            .map(|&(next_start, _, _)| next_start)
            .unwrap_or(text.len());
        let block = &text[body_start..end];
        // A `---` separator terminates the task list.
        if let Some(cut) = block.find("\n---") {
            end = body_start + cut;
        }
        let block = &text[body_start..end];

        let description = block
            .lines()
            .next()
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        if description.is_empty() {
            continue;
        }

        let role = role_re
            .captures(block)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "general".to_string());
        let model = model_re
            .captures(block)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        tasks.push(LegacyTask {
            number,
            description,
            role,
            model,
            span: Span { start, end },
        });
    }

    tasks
}
