// Report parsing fallbacks
//
// Used only when a backend did not produce structured tool-call results;
// a recorded `CompletionReport` always takes precedence over these.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use cadre_types::{CompletionReport, TaskId, TaskRecord, Verdict};

const SUMMARY_MAX_CHARS: usize = 500;

// Conservative project-path shape: at least one directory separator, a
// filename with an extension, no URL schemes or spaces.
static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:[A-Za-z0-9_.-]+/)+[A-Za-z0-9_.-]+\.[A-Za-z0-9]{1,8}\b")
        .unwrap_or_else(|e| panic!("invalid path regex: {}", e))
});

/// Reconstruct a completion report from a worker's free-form final text.
pub fn parse_worker_report(agent_id: &str, task_id: &str, text: &str) -> CompletionReport {
    let mut summary = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(3)
        .collect::<Vec<_>>()
        .join("\n");
    if summary.len() > SUMMARY_MAX_CHARS {
        let mut end = SUMMARY_MAX_CHARS;
        while !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }

    let mut files_modified: Vec<String> = Vec::new();
    for m in PATH_RE.find_iter(text) {
        let path = m.as_str().to_string();
        if !files_modified.contains(&path) {
            files_modified.push(path);
        }
    }

    let upper = text.to_uppercase();
    let success = !upper.contains("FAILED") && !upper.contains("ERROR");

    CompletionReport {
        agent_id: agent_id.to_string(),
        task_id: task_id.to_string(),
        summary,
        files_modified,
        success,
    }
}

/// Per-task verdicts extracted from a verifier's free-form review.
///
/// Each task's section is located by its id or verbatim title; when neither
/// appears, the whole text stands in for the section. Within a section,
/// `Approved` requires `APPROVED` without any `NOT APPROVED`/`NOT_APPROVED`.
pub fn parse_verifier_verdicts(
    text: &str,
    tasks: &[TaskRecord],
) -> HashMap<TaskId, (Verdict, String)> {
    // Section starts for all tasks, so each section can end where the next
    // one begins.
    let mut starts: Vec<(usize, usize)> = Vec::new(); // (byte offset, task index)
    for (idx, task) in tasks.iter().enumerate() {
        let at = text
            .find(&task.id)
            .or_else(|| find_title(text, &task.title));
        if let Some(at) = at {
            starts.push((at, idx));
        }
    }
    starts.sort_by_key(|(at, _)| *at);

    let mut verdicts = HashMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        let section = match starts.iter().position(|(_, i)| *i == idx) {
            Some(pos) => {
                let start = starts[pos].0;
                let end = starts
                    .get(pos + 1)
                    .map(|(at, _)| *at)
                    .unwrap_or(text.len());
                &text[start..end]
            }
            None => text,
        };
        verdicts.insert(task.id.clone(), judge_section(section));
    }
    verdicts
}

fn find_title(text: &str, title: &str) -> Option<usize> {
    if title.is_empty() {
        return None;
    }
    text.find(title)
}

fn judge_section(section: &str) -> (Verdict, String) {
    let upper = section.to_uppercase();
    let approved = upper.contains("APPROVED")
        && !upper.contains("NOT APPROVED")
        && !upper.contains("NOT_APPROVED");

    let mut summary = section.trim().to_string();
    if summary.len() > SUMMARY_MAX_CHARS {
        let mut end = SUMMARY_MAX_CHARS;
        while !summary.is_char_boundary(end) {
            end -= 1;
        }
        summary.truncate(end);
    }

    if approved {
        (Verdict::Approved, summary)
    } else {
        (Verdict::NotApproved, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadre_types::TaskRecord;

    #[test]
    fn worker_report_takes_first_three_nonblank_lines() {
        let text = "Implemented the parser.\n\nTouched src/parser/mod.rs and src/lib.rs.\nAll tests pass.\nExtra detail nobody reads.";
        let report = parse_worker_report("a1", "t1", text);

        assert_eq!(report.agent_id, "a1");
        assert_eq!(report.task_id, "t1");
        assert_eq!(
            report.summary,
            "Implemented the parser.\nTouched src/parser/mod.rs and src/lib.rs.\nAll tests pass."
        );
        assert_eq!(
            report.files_modified,
            vec!["src/parser/mod.rs", "src/lib.rs"]
        );
        assert!(report.success);
    }

    #[test]
    fn worker_report_summary_is_truncated_to_500_chars() {
        let text = "x".repeat(800);
        let report = parse_worker_report("a1", "t1", &text);
        assert_eq!(report.summary.len(), 500);
    }

    #[test]
    fn failed_or_error_markers_flip_success() {
        assert!(!parse_worker_report("a", "t", "The build FAILED on step 3").success);
        assert!(!parse_worker_report("a", "t", "error: cannot find symbol").success);
        assert!(parse_worker_report("a", "t", "Everything fine").success);
    }

    #[test]
    fn path_matches_are_distinct_and_conservative() {
        let text = "Edited src/a.rs, again src/a.rs, and docs/guide.md. Not a path: 3.14, nor example.com";
        let report = parse_worker_report("a", "t", text);
        assert_eq!(report.files_modified, vec!["src/a.rs", "docs/guide.md"]);
    }

    #[test]
    fn round_trips_well_formed_reports() {
        // Property 5: serialize then reparse reproduces summary lines,
        // files, and success for well-formed inputs.
        let original = CompletionReport {
            agent_id: "a1".to_string(),
            task_id: "t1".to_string(),
            summary: "Added retry logic.\nUpdated src/retry.rs".to_string(),
            files_modified: vec!["src/retry.rs".to_string()],
            success: true,
        };
        let serialized = format!("{}\nDone.", original.summary);
        let reparsed = parse_worker_report("a1", "t1", &serialized);
        assert_eq!(reparsed.summary.lines().next(), Some("Added retry logic."));
        assert_eq!(reparsed.files_modified, original.files_modified);
        assert_eq!(reparsed.success, original.success);
    }

    fn task(id: &str, title: &str) -> TaskRecord {
        let mut task = TaskRecord::new(title, "objective", "ws");
        task.id = id.to_string();
        task
    }

    #[test]
    fn verdicts_are_located_by_id_or_title() {
        let tasks = vec![task("t-alpha", "Alpha"), task("t-beta", "Beta")];
        let text = "\
## Alpha
Looks correct. APPROVED

## t-beta
Missing edge case handling. NOT APPROVED
";
        let verdicts = parse_verifier_verdicts(text, &tasks);
        assert_eq!(verdicts["t-alpha"].0, Verdict::Approved);
        assert_eq!(verdicts["t-beta"].0, Verdict::NotApproved);
        assert!(verdicts["t-beta"].1.contains("edge case"));
    }

    #[test]
    fn underscore_form_counts_as_rejection() {
        let tasks = vec![task("t1", "Solo")];
        let verdicts = parse_verifier_verdicts("Solo: NOT_APPROVED", &tasks);
        assert_eq!(verdicts["t1"].0, Verdict::NotApproved);
    }

    #[test]
    fn case_is_ignored() {
        let tasks = vec![task("t1", "Solo")];
        let verdicts = parse_verifier_verdicts("Solo: approved", &tasks);
        assert_eq!(verdicts["t1"].0, Verdict::Approved);
    }

    #[test]
    fn missing_section_falls_back_to_whole_text() {
        let tasks = vec![task("t1", "Unmentioned")];
        let verdicts = parse_verifier_verdicts("Everything APPROVED.", &tasks);
        assert_eq!(verdicts["t1"].0, Verdict::Approved);
    }

    #[test]
    fn sections_do_not_bleed_into_each_other() {
        let tasks = vec![task("t-a", "Alpha"), task("t-b", "Beta")];
        let text = "Alpha APPROVED\nBeta NOT APPROVED";
        let verdicts = parse_verifier_verdicts(text, &tasks);
        assert_eq!(verdicts["t-a"].0, Verdict::Approved);
        assert_eq!(verdicts["t-b"].0, Verdict::NotApproved);
    }
}
