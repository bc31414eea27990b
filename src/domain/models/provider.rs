//! Provider configuration model.
//!
//! A provider is an external AI coding tool. The invoker treats provider
//! specifics as data: executable, static arguments, prompt delivery mode,
//! whether output is stream-JSON, and extra environment variables.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How the prompt reaches the provider process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromptDelivery {
    /// Write the prompt to the subprocess's stdin, then close it.
    Stdin,
    /// Write the prompt to a temp file and invoke through a small shell
    /// script that pipes the file in. Avoids argv length and quoting limits.
    PromptArgument,
}

impl Default for PromptDelivery {
    fn default() -> Self {
        Self::Stdin
    }
}

/// Execution backend for a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// Shell out to the configured executable.
    Subprocess,
    /// Delegate to a named in-process SDK adapter.
    InProcess,
}

impl Default for ProviderKind {
    fn default() -> Self {
        Self::Subprocess
    }
}

/// Declaration of one external AI tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name as referenced by model specs (e.g. `claude`).
    pub name: String,
    #[serde(default)]
    pub kind: ProviderKind,
    /// Executable path or name resolved on PATH.
    #[serde(default)]
    pub command: String,
    /// Static arguments for agentic (file-editing) invocations.
    #[serde(default)]
    pub args: Vec<String>,
    /// Arguments for plain analysis calls: no file editing, no tool use,
    /// no streaming JSON, single turn. Used for negotiation and approval
    /// prompts. Falls back to `args` with stream flags dropped when unset.
    #[serde(default)]
    pub analysis_args: Option<Vec<String>>,
    #[serde(default)]
    pub prompt_delivery: PromptDelivery,
    /// Whether stdout is a stream of JSON envelopes.
    #[serde(default)]
    pub stream_json: bool,
    /// Extra environment variables (e.g. `OPENCODE_DISABLE_AUTOUPDATE=true`).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProviderConfig {
    /// A plain-analysis variant of this provider: analysis args when
    /// configured, otherwise the agentic args with stream flags removed,
    /// and stream-JSON parsing off.
    pub fn to_analysis(&self) -> Self {
        let args = self.analysis_args.clone().unwrap_or_else(|| {
            self.args
                .iter()
                .filter(|a| !a.contains("stream"))
                .cloned()
                .collect()
        });
        Self {
            args,
            analysis_args: None,
            stream_json: false,
            ..self.clone()
        }
    }
}

/// A (provider, model) pair handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}
