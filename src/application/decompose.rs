//! Decomposition output parsing.
//!
//! The lead asks a provider to break a feature request into tasks in a
//! line-oriented format. The parser is tolerant: keywords are matched
//! case-insensitively, unknown lines extend the current description, and
//! dependencies are resolved from referenced titles to IDs with a lookup
//! built as the parser walks the text.

use std::collections::HashMap;
use tracing::warn;

use crate::domain::models::{Task, TaskPriority};

/// Expected shape of one task in the provider's decomposition output.
///
/// ```text
/// TASK: Add config loader
/// DESCRIPTION: Implement hierarchical config loading with env overrides.
/// PRIORITY: High
/// DEPENDS: Define config schema
/// FILES: src/config.rs, src/main.rs
/// ```
pub fn decomposition_format_help() -> &'static str {
    "For each task emit:\n\
     TASK: <short title>\n\
     DESCRIPTION: <what to build and how to verify it>\n\
     PRIORITY: Critical | High | Medium | Low\n\
     DEPENDS: <titles of earlier tasks, comma separated, or none>\n\
     FILES: <files expected to change, comma separated>\n"
}

/// Parse provider output into a task batch.
///
/// IDs are assigned `task-1`, `task-2`, … in text order; `DEPENDS` titles
/// resolve against tasks seen so far. References to titles that never
/// appear are dropped with a warning rather than poisoning the batch.
pub fn parse_decomposition(output: &str) -> Vec<Task> {
    let mut tasks: Vec<Task> = Vec::new();
    let mut title_to_id: HashMap<String, String> = HashMap::new();
    let mut pending_deps: Vec<Vec<String>> = Vec::new();

    for raw_line in output.lines() {
        let line = raw_line.trim();
        let Some((keyword, value)) = split_keyword(line) else {
            // Continuation lines extend the current description.
            if let Some(task) = tasks.last_mut() {
                if !line.is_empty() && !line.starts_with("---") {
                    if !task.description.is_empty() {
                        task.description.push(' ');
                    }
                    task.description.push_str(line);
                }
            }
            continue;
        };

        match keyword.as_str() {
            "TASK" => {
                let id = format!("task-{}", tasks.len() + 1);
                let mut task = Task::new(value.clone(), String::new());
                task.id = id.clone();
                title_to_id.insert(normalize(&value), id);
                tasks.push(task);
                pending_deps.push(Vec::new());
            }
            "DESCRIPTION" => {
                if let Some(task) = tasks.last_mut() {
                    task.description = value;
                }
            }
            "PRIORITY" => {
                if let Some(task) = tasks.last_mut() {
                    if let Some(priority) = TaskPriority::from_str(&value) {
                        task.priority = priority;
                    } else {
                        warn!(task_id = %task.id, value, "unrecognized priority, keeping default");
                    }
                }
            }
            "DEPENDS" | "DEPENDS ON" => {
                if let Some(deps) = pending_deps.last_mut() {
                    deps.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("none"))
                            .map(String::from),
                    );
                }
            }
            "FILES" => {
                if let Some(task) = tasks.last_mut() {
                    task.files = value
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(String::from)
                        .collect();
                }
            }
            _ => {}
        }
    }

    // Second pass: titles to IDs. Forward references work because the
    // lookup now holds the whole batch.
    for (task, deps) in tasks.iter_mut().zip(pending_deps) {
        for dep_title in deps {
            match title_to_id.get(&normalize(&dep_title)) {
                Some(dep_id) if *dep_id != task.id => task.depends_on.push(dep_id.clone()),
                Some(_) => warn!(task_id = %task.id, "task listed itself as a dependency, dropped"),
                None => warn!(
                    task_id = %task.id,
                    dependency = %dep_title,
                    "dependency title not found in decomposition, dropped"
                ),
            }
        }
    }

    tasks
}

fn split_keyword(line: &str) -> Option<(String, String)> {
    let (head, tail) = line.split_once(':')?;
    let keyword = head.trim().to_uppercase();
    match keyword.as_str() {
        "TASK" | "DESCRIPTION" | "PRIORITY" | "DEPENDS" | "DEPENDS ON" | "FILES" => {
            Some((keyword, tail.trim().to_string()))
        }
        _ => None,
    }
}

fn normalize(title: &str) -> String {
    title.trim().to_lowercase()
}
