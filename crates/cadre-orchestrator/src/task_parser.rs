// Task block parser
//
// Extracts structured tasks from planner output. The grammar:
//
//   @@@task
//   # <title>
//   ## Objective
//   <free text>
//   ## Scope
//   - <item>
//   ## Definition of Done
//   - <criterion>
//   ## Verification
//   - <shell command>
//   @@@
//
// A block without a title is discarded with a warning; empty list sections
// are fine. Zero blocks is a valid outcome meaning "no actionable work".

use cadre_types::TaskRecord;

const BLOCK_OPEN: &str = "@@@task";
const BLOCK_CLOSE: &str = "@@@";

/// Outcome of parsing a plan text.
#[derive(Debug, Default)]
pub struct ParsedPlan {
    pub tasks: Vec<TaskRecord>,
    /// Human-readable notes about skipped/malformed blocks. Never fatal.
    pub warnings: Vec<String>,
}

/// Parse every well-formed `@@@task` block out of `text`.
pub fn parse_task_blocks(workspace_id: &str, text: &str) -> ParsedPlan {
    let mut plan = ParsedPlan::default();
    let mut block: Option<Vec<&str>> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match &mut block {
            None => {
                if trimmed == BLOCK_OPEN {
                    block = Some(Vec::new());
                }
            }
            Some(lines) => {
                if trimmed == BLOCK_CLOSE {
                    match parse_block(workspace_id, lines) {
                        Ok(task) => plan.tasks.push(task),
                        Err(reason) => {
                            tracing::warn!("skipping malformed task block: {}", reason);
                            plan.warnings.push(reason);
                        }
                    }
                    block = None;
                } else if trimmed == BLOCK_OPEN {
                    // A new opener inside a block means the previous one was
                    // never closed.
                    let reason = "unterminated task block".to_string();
                    tracing::warn!("skipping malformed task block: {}", reason);
                    plan.warnings.push(reason);
                    block = Some(Vec::new());
                } else {
                    lines.push(line);
                }
            }
        }
    }

    if block.is_some() {
        let reason = "unterminated task block at end of plan".to_string();
        tracing::warn!("skipping malformed task block: {}", reason);
        plan.warnings.push(reason);
    }

    plan
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Objective,
    Scope,
    DefinitionOfDone,
    Verification,
}

fn parse_block(workspace_id: &str, lines: &[&str]) -> Result<TaskRecord, String> {
    let mut title: Option<String> = None;
    let mut objective_lines: Vec<&str> = Vec::new();
    let mut scope: Vec<String> = Vec::new();
    let mut acceptance_criteria: Vec<String> = Vec::new();
    let mut verification_commands: Vec<String> = Vec::new();
    let mut section = Section::None;

    for line in lines {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            section = match heading.trim().to_ascii_lowercase().as_str() {
                "objective" => Section::Objective,
                "scope" => Section::Scope,
                "definition of done" => Section::DefinitionOfDone,
                "verification" => Section::Verification,
                other => {
                    tracing::debug!("ignoring unknown task section: {}", other);
                    Section::None
                }
            };
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("# ") {
            if title.is_none() {
                let heading = heading.trim();
                if !heading.is_empty() {
                    title = Some(heading.to_string());
                }
            }
            continue;
        }

        match section {
            Section::None => {}
            Section::Objective => objective_lines.push(trimmed),
            Section::Scope => {
                if let Some(item) = list_item(trimmed) {
                    scope.push(item);
                }
            }
            Section::DefinitionOfDone => {
                if let Some(item) = list_item(trimmed) {
                    acceptance_criteria.push(item);
                }
            }
            Section::Verification => {
                if let Some(item) = list_item(trimmed) {
                    verification_commands.push(item);
                }
            }
        }
    }

    let Some(title) = title else {
        return Err("task block has no title".to_string());
    };

    let objective = objective_lines
        .iter()
        .filter(|l| !l.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n");

    let mut task = TaskRecord::new(title, objective, workspace_id);
    task.scope = scope;
    task.acceptance_criteria = acceptance_criteria;
    task.verification_commands = verification_commands;
    Ok(task)
}

fn list_item(line: &str) -> Option<String> {
    let item = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "))?;
    let item = item.trim();
    if item.is_empty() {
        None
    } else {
        Some(item.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::TaskStatus;

    const TWO_TASKS: &str = r#"Here is the decomposition.

@@@task
# Alpha
## Objective
Implement the alpha feature
end to end.
## Scope
- src/alpha.rs
- src/lib.rs
## Definition of Done
- alpha passes the new unit tests
## Verification
- cargo test alpha
@@@

Some narration between blocks.

@@@task
# Beta
## Objective
Wire beta into the CLI.
## Scope
## Definition of Done
## Verification
@@@
"#;

    #[test]
    fn parses_ordered_tasks_with_fresh_pending_status() {
        let plan = parse_task_blocks("ws", TWO_TASKS);
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.tasks.len(), 2);

        let alpha = &plan.tasks[0];
        assert_eq!(alpha.title, "Alpha");
        assert_eq!(
            alpha.objective,
            "Implement the alpha feature\nend to end."
        );
        assert_eq!(alpha.scope, vec!["src/alpha.rs", "src/lib.rs"]);
        assert_eq!(
            alpha.acceptance_criteria,
            vec!["alpha passes the new unit tests"]
        );
        assert_eq!(alpha.verification_commands, vec!["cargo test alpha"]);
        assert_eq!(alpha.status, TaskStatus::Pending);
        assert_eq!(alpha.workspace_id, "ws");

        let beta = &plan.tasks[1];
        assert_eq!(beta.title, "Beta");
        assert!(beta.scope.is_empty());
        assert!(beta.acceptance_criteria.is_empty());
        assert!(beta.verification_commands.is_empty());

        assert_ne!(alpha.id, beta.id);
    }

    #[test]
    fn no_blocks_is_a_valid_empty_outcome() {
        let plan = parse_task_blocks("ws", "Nothing to do.");
        assert!(plan.tasks.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn titleless_block_is_skipped_with_warning() {
        let text = "@@@task\n## Objective\nDo something.\n@@@\n";
        let plan = parse_task_blocks("ws", text);
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn unterminated_block_is_skipped_not_fatal() {
        let text = "@@@task\n# Dangling\n## Objective\nNever closed.";
        let plan = parse_task_blocks("ws", text);
        assert!(plan.tasks.is_empty());
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn reopened_block_discards_the_unclosed_one() {
        let text = "@@@task\n# First\n@@@task\n# Second\n## Objective\nx\n@@@\n";
        let plan = parse_task_blocks("ws", text);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].title, "Second");
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn unknown_sections_are_ignored() {
        let text = "@@@task\n# Solo\n## Objective\ndo it\n## Notes\n- ignored\n@@@\n";
        let plan = parse_task_blocks("ws", text);
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.tasks[0].scope.is_empty());
    }
}
