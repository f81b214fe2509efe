// Role prompt templates
//
// The coordinator assembles each agent's context from these and the
// assignee's task. The wording is deliberately mechanical: the planner's
// output must parse, and the verifier's output must match the verdict
// grammar.

use cadre_types::{CompletionReport, ConversationTurn, TaskRecord};

pub struct RolePrompts;

impl RolePrompts {
    /// Prompt for the Planner: decompose the request into task blocks.
    pub fn planner(request: &str) -> String {
        format!(
            r#"You are the planning agent of a multi-agent coordination system.

## Request
{request}

## Output Format
Decompose the request into independent tasks. Emit each task as a block:

@@@task
# <title>
## Objective
<one or more lines>
## Scope
- <file or area>
## Definition of Done
- <criterion>
## Verification
- <shell command>
@@@

## Rules
1. Every block needs a title; Scope, Definition of Done, and Verification may be empty.
2. Tasks should be small enough for one worker to finish in a single run.
3. If the request needs no work, say so in plain text and emit no blocks."#,
        )
    }

    /// Prompt for a Worker: one task, executed end to end.
    pub fn worker(task: &TaskRecord, transcript_tail: &[ConversationTurn]) -> String {
        let previous = if transcript_tail.is_empty() {
            String::new()
        } else {
            let turns = transcript_tail
                .iter()
                .map(|t| t.content.as_str())
                .collect::<Vec<_>>()
                .join("\n---\n");
            format!("\n## Previous Attempts\n{turns}\n")
        };

        format!(
            r#"You are a worker agent. Complete this task end to end.

## Task
{title}
Task id: {id}

{objective}

## Scope
{scope}

## Definition of Done
{criteria}
{previous}
## Rules
- Stay inside the listed scope.
- When finished, call the `report_completion` tool with your summary, the
  files you modified, and whether you succeeded. If tool calling is
  unavailable, end with a short summary listing the modified file paths and
  the word FAILED if you did not succeed."#,
            title = task.title,
            id = task.id,
            objective = task.objective,
            scope = bullet_list(&task.scope),
            criteria = bullet_list(&task.acceptance_criteria),
            previous = previous,
        )
    }

    /// Prompt for the Verifier: a batched review of a whole wave.
    pub fn verifier(tasks: &[(TaskRecord, Option<CompletionReport>)]) -> String {
        let mut sections = String::new();
        for (task, report) in tasks {
            let reported = match report {
                Some(report) => format!(
                    "Worker summary:\n{}\nFiles modified:\n{}",
                    report.summary,
                    bullet_list(&report.files_modified)
                ),
                None => "No worker report was recorded.".to_string(),
            };
            sections.push_str(&format!(
                r#"## {id}
Title: {title}
Objective: {objective}
Acceptance criteria:
{criteria}
Verification commands:
{commands}
{reported}

"#,
                id = task.id,
                title = task.title,
                objective = task.objective,
                criteria = bullet_list(&task.acceptance_criteria),
                commands = bullet_list(&task.verification_commands),
                reported = reported,
            ));
        }

        format!(
            r#"You are the verifier agent. Review each task below against its
acceptance criteria, running the verification commands where given.

{sections}
## Output Format
For every task, repeat its id (the `## <id>` heading above) followed by a
line containing either APPROVED or NOT APPROVED, then a one-line reason.
Judge strictly: approve only when every criterion is met."#,
        )
    }
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|i| format!("- {}", i))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planner_prompt_embeds_request_and_grammar() {
        let prompt = RolePrompts::planner("Add a cache layer");
        assert!(prompt.contains("Add a cache layer"));
        assert!(prompt.contains("@@@task"));
        assert!(prompt.contains("## Definition of Done"));
    }

    #[test]
    fn worker_prompt_lists_task_fields() {
        let mut task = TaskRecord::new("Alpha", "Build alpha", "ws");
        task.scope = vec!["src/alpha.rs".to_string()];
        task.acceptance_criteria = vec!["tests pass".to_string()];

        let prompt = RolePrompts::worker(&task, &[]);
        assert!(prompt.contains("Alpha"));
        assert!(prompt.contains(&format!("Task id: {}", task.id)));
        assert!(prompt.contains("- src/alpha.rs"));
        assert!(prompt.contains("- tests pass"));
        assert!(prompt.contains("report_completion"));
        assert!(!prompt.contains("Previous Attempts"));
    }

    #[test]
    fn worker_prompt_includes_transcript_tail_on_retry() {
        let task = TaskRecord::new("Alpha", "Build alpha", "ws");
        let turns = vec![ConversationTurn {
            agent_id: "a1".to_string(),
            index: 0,
            content: "first attempt notes".to_string(),
            tool_calls: Vec::new(),
        }];
        let prompt = RolePrompts::worker(&task, &turns);
        assert!(prompt.contains("Previous Attempts"));
        assert!(prompt.contains("first attempt notes"));
    }

    #[test]
    fn verifier_prompt_sections_tasks_by_id() {
        let mut task = TaskRecord::new("Alpha", "Build alpha", "ws");
        task.id = "t-alpha".to_string();
        let report = CompletionReport {
            agent_id: "a1".to_string(),
            task_id: "t-alpha".to_string(),
            summary: "done".to_string(),
            files_modified: vec!["src/alpha.rs".to_string()],
            success: true,
        };

        let prompt = RolePrompts::verifier(&[(task, Some(report))]);
        assert!(prompt.contains("## t-alpha"));
        assert!(prompt.contains("NOT APPROVED"));
        assert!(prompt.contains("src/alpha.rs"));
    }
}
