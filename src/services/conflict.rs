//! AI-driven merge conflict negotiation.
//!
//! Builds a plain-text negotiation prompt from both sides' task intents,
//! capped branch diffs, and the conflicted file bodies; asks the provider
//! for one resolution block per file; applies and stages the results.

use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::models::{ConflictedFile, ProviderConfig};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::git::WorktreeManager;
use crate::infrastructure::providers::ProviderInvoker;

/// Per-diff character budget in the negotiation prompt.
const DIFF_CAP_CHARS: usize = 2_000;

/// Per-file body character budget.
const FILE_CAP_CHARS: usize = 1_500;

/// At most this many conflicted files are shown to the model.
const MAX_FILES: usize = 8;

/// One side's intent, for negotiation context.
#[derive(Debug, Clone)]
pub struct TaskIntent {
    pub agent_id: String,
    pub branch: String,
    /// The task description driving that branch, when known.
    pub description: Option<String>,
}

/// A resolved file produced by negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Path relative to the worktree root.
    pub path: String,
    pub content: String,
}

/// Negotiator bound to one provider/model pair.
pub struct ConflictNegotiator {
    invoker: Arc<ProviderInvoker>,
    provider: ProviderConfig,
    model: String,
}

impl ConflictNegotiator {
    pub fn new(invoker: Arc<ProviderInvoker>, provider: &ProviderConfig, model: impl Into<String>) -> Self {
        Self {
            invoker,
            // Negotiation is analysis only: no file editing, no tool use,
            // no streaming JSON, a single turn.
            provider: provider.to_analysis(),
            model: model.into(),
        }
    }

    /// Negotiate resolutions for `conflicts` inside `worktree_path`.
    ///
    /// Fails with [`CoordError::ManualInterventionRequired`] when the
    /// provider call fails or yields zero parseable resolutions.
    pub async fn negotiate(
        &self,
        git: &WorktreeManager,
        worktree_path: &Path,
        conflicts: &[ConflictedFile],
        ours: &TaskIntent,
        theirs: &TaskIntent,
        cancel: &CancellationToken,
    ) -> CoordResult<Vec<Resolution>> {
        let prompt = self
            .build_prompt(git, worktree_path, conflicts, ours, theirs)
            .await;

        let result = self
            .invoker
            .invoke(&self.provider, &self.model, &prompt, worktree_path, None, cancel)
            .await?;

        if !result.success {
            return Err(CoordError::ManualInterventionRequired(format!(
                "negotiation call failed: {}",
                result.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let resolutions = parse_resolutions(&result.parsed_text);
        if resolutions.is_empty() {
            return Err(CoordError::ManualInterventionRequired(
                "negotiation produced no resolutions".to_string(),
            ));
        }
        info!(files = resolutions.len(), "negotiated conflict resolutions");
        Ok(resolutions)
    }

    /// Write each resolved body into the worktree and stage it.
    pub async fn apply(
        &self,
        git: &WorktreeManager,
        worktree_path: &Path,
        resolutions: &[Resolution],
    ) -> CoordResult<()> {
        for resolution in resolutions {
            let full_path = worktree_path.join(&resolution.path);
            if let Some(parent) = full_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full_path, &resolution.content).await?;
            git.stage_file(worktree_path, &resolution.path).await?;
        }
        Ok(())
    }

    async fn build_prompt(
        &self,
        git: &WorktreeManager,
        worktree_path: &Path,
        conflicts: &[ConflictedFile],
        ours: &TaskIntent,
        theirs: &TaskIntent,
    ) -> String {
        let mut prompt = String::from(
            "Two agents' branches conflict while merging. Resolve each conflicted \
             file so that BOTH tasks' intents are preserved.\n\n",
        );

        for (label, intent) in [("Branch A (ours)", ours), ("Branch B (theirs)", theirs)] {
            prompt.push_str(&format!(
                "{label}: branch `{}`, agent `{}`\n",
                intent.branch, intent.agent_id
            ));
            if let Some(desc) = &intent.description {
                prompt.push_str(&format!("Task intent: {desc}\n"));
            }
            prompt.push('\n');
        }

        for intent in [ours, theirs] {
            let diff = git
                .branch_diff(worktree_path, &theirs.branch, &intent.branch)
                .await;
            if !diff.is_empty() {
                prompt.push_str(&format!(
                    "Changes on `{}`:\n```\n{}\n```\n\n",
                    intent.branch,
                    cap_lines(&diff, DIFF_CAP_CHARS)
                ));
            }
        }

        prompt.push_str("Conflicted files as they stand now (with conflict markers):\n\n");
        for conflict in conflicts.iter().take(MAX_FILES) {
            let body = tokio::fs::read_to_string(&conflict.full_path)
                .await
                .unwrap_or_else(|_| String::from("<unreadable>"));
            prompt.push_str(&format!(
                "file: {}\n```\n{}\n```\n\n",
                conflict.path,
                cap_lines(&body, FILE_CAP_CHARS)
            ));
        }
        if conflicts.len() > MAX_FILES {
            warn!(
                total = conflicts.len(),
                shown = MAX_FILES,
                "conflict list truncated for negotiation prompt"
            );
            prompt.push_str(&format!(
                "({} more conflicted files omitted)\n\n",
                conflicts.len() - MAX_FILES
            ));
        }

        prompt.push_str(
            "Reply with one block per file, exactly in this form:\n\
             ---RESOLUTION---\n\
             file: <relative path>\n\
             content:\n\
             <full resolved file body>\n\
             ---END_RESOLUTION---\n",
        );
        prompt
    }
}

/// Truncate to whole lines within a character budget.
fn cap_lines(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }
    let mut out = String::new();
    for line in text.lines() {
        if out.len() + line.len() + 1 > max_chars {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("… (truncated)");
    out
}

/// Parse `---RESOLUTION---` blocks. Line-oriented and tolerant: content
/// accumulates after a `content:` marker until the next `file:` line or a
/// block terminator.
fn parse_resolutions(text: &str) -> Vec<Resolution> {
    let mut resolutions = Vec::new();
    let mut current_file: Option<String> = None;
    let mut in_content = false;
    let mut body: Vec<&str> = Vec::new();

    let mut flush =
        |file: &mut Option<String>, body: &mut Vec<&str>, out: &mut Vec<Resolution>| {
            if let Some(path) = file.take() {
                let content = body.join("\n");
                if !content.trim().is_empty() {
                    out.push(Resolution {
                        path,
                        content: format!("{content}\n"),
                    });
                }
            }
            body.clear();
        };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed == "---RESOLUTION---" || trimmed == "---END_RESOLUTION---" {
            flush(&mut current_file, &mut body, &mut resolutions);
            in_content = false;
        } else if let Some(path) = trimmed.strip_prefix("file:") {
            flush(&mut current_file, &mut body, &mut resolutions);
            current_file = Some(path.trim().to_string());
            in_content = false;
        } else if trimmed == "content:" && current_file.is_some() && !in_content {
            in_content = true;
        } else if in_content {
            body.push(line);
        }
    }
    flush(&mut current_file, &mut body, &mut resolutions);
    resolutions
}
