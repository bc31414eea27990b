//! Provider invocation.
//!
//! Runs an external AI tool as a subprocess: delivers the prompt, streams
//! and parses stdout, drains stderr concurrently with the exit wait, emits
//! heartbeats and a final summary, and cleans up temp files on every path.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::models::{PromptDelivery, ProviderConfig, ProviderKind};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::providers::sdk::SdkAdapter;
use crate::infrastructure::providers::stream::StreamTextAccumulator;

/// Callback receiving progress lines (parsed deltas, heartbeats, summary).
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Interval between heartbeat progress lines.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Maximum length of the final summary line.
const SUMMARY_MAX_CHARS: usize = 200;

/// Outcome of one provider invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub success: bool,
    /// Full stdout transcript, including unparsed stream envelopes.
    pub raw_output: String,
    /// Concatenated text deltas (equal to `raw_output` for plain providers).
    pub parsed_text: String,
    pub error: Option<String>,
    pub output_chars: usize,
    pub error_chars: usize,
    pub duration_ms: u64,
}

/// Stateless runner for provider invocations.
#[derive(Default)]
pub struct ProviderInvoker {
    adapters: HashMap<String, Arc<dyn SdkAdapter>>,
}

impl ProviderInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process adapter under a provider name.
    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: Arc<dyn SdkAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    /// Invoke `provider` with `prompt` in `working_dir`.
    ///
    /// Cancellation terminates the subprocess; output gathered so far is
    /// still returned in the result.
    pub async fn invoke(
        &self,
        provider: &ProviderConfig,
        model: &str,
        prompt: &str,
        working_dir: &Path,
        on_output: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> CoordResult<InvocationResult> {
        match provider.kind {
            ProviderKind::InProcess => {
                self.invoke_in_process(provider, model, prompt, on_output, cancel)
                    .await
            }
            ProviderKind::Subprocess => {
                self.invoke_subprocess(provider, model, prompt, working_dir, on_output, cancel)
                    .await
            }
        }
    }

    async fn invoke_in_process(
        &self,
        provider: &ProviderConfig,
        model: &str,
        prompt: &str,
        on_output: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> CoordResult<InvocationResult> {
        let adapter = self.adapters.get(&provider.name).ok_or_else(|| {
            CoordError::Provider(format!("no SDK adapter registered for '{}'", provider.name))
        })?;

        let started = Instant::now();
        let result = adapter.complete(model, prompt, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(text) => {
                emit_summary(on_output.as_deref(), &text);
                Ok(InvocationResult {
                    success: true,
                    output_chars: text.chars().count(),
                    raw_output: text.clone(),
                    parsed_text: text,
                    error: None,
                    error_chars: 0,
                    duration_ms,
                })
            }
            Err(err) => Ok(InvocationResult {
                success: false,
                error: Some(err.to_string()),
                duration_ms,
                ..InvocationResult::default()
            }),
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn invoke_subprocess(
        &self,
        provider: &ProviderConfig,
        model: &str,
        prompt: &str,
        working_dir: &Path,
        on_output: Option<OutputSink>,
        cancel: &CancellationToken,
    ) -> CoordResult<InvocationResult> {
        let args: Vec<String> = provider
            .args
            .iter()
            .map(|a| a.replace("{model}", model))
            .collect();

        // Temp files (prompt + wrapper script) delete themselves on drop,
        // which covers every exit path including errors and cancellation.
        let mut _temp_guards: Vec<tempfile::TempPath> = Vec::new();

        let mut command = match provider.prompt_delivery {
            PromptDelivery::Stdin => {
                let mut cmd = Command::new(&provider.command);
                cmd.args(&args).stdin(Stdio::piped());
                cmd
            }
            PromptDelivery::PromptArgument => {
                let (script_path, prompt_path) =
                    write_prompt_script(&provider.command, &args, prompt)?;
                let mut cmd = Command::new("sh");
                cmd.arg(&script_path).stdin(Stdio::null());
                _temp_guards.push(script_path);
                _temp_guards.push(prompt_path);
                cmd
            }
        };

        command
            .current_dir(working_dir)
            .envs(&provider.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so cancellation can stop the provider's
            // whole tree; a surviving grandchild would otherwise hold the
            // output pipes open past the kill.
            .process_group(0);

        info!(
            provider = %provider.name,
            model,
            cwd = %working_dir.display(),
            prompt_chars = prompt.chars().count(),
            "invoking provider"
        );

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| CoordError::Provider(format!("failed to spawn {}: {e}", provider.command)))?;

        // Deliver the prompt from a separate task so a full stdout pipe
        // cannot deadlock against a large prompt write.
        if provider.prompt_delivery == PromptDelivery::Stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| CoordError::Provider("child stdin unavailable".to_string()))?;
            let prompt_bytes = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&prompt_bytes).await {
                    warn!(error = %err, "failed to write prompt to provider stdin");
                }
                // Closing stdin signals end of input.
                drop(stdin);
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordError::Provider("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoordError::Provider("child stderr unavailable".to_string()))?;

        // Start the stderr drain before any waiting. Partial stderr stays
        // available even when the invocation is cancelled.
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let stderr_task = {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut reader = stderr;
                let mut bytes = Vec::new();
                let _ = reader.read_to_end(&mut bytes).await;
                buf.lock().await.push_str(&String::from_utf8_lossy(&bytes));
            })
        };

        let mut raw_output = String::new();
        let mut accumulator = StreamTextAccumulator::new();
        let mut plain_text = String::new();
        let mut lines = BufReader::new(stdout).lines();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // immediate first tick is not a heartbeat
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            raw_output.push_str(&line);
                            raw_output.push('\n');
                            if provider.stream_json {
                                if let Some(delta) = accumulator.feed(&line) {
                                    if let Some(sink) = on_output.as_deref() {
                                        sink(&delta);
                                    }
                                }
                            } else {
                                plain_text.push_str(&line);
                                plain_text.push('\n');
                                if let Some(sink) = on_output.as_deref() {
                                    sink(&line);
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "error reading provider stdout");
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    let parsed_len = if provider.stream_json {
                        accumulator.len()
                    } else {
                        plain_text.len()
                    };
                    if let Some(sink) = on_output.as_deref() {
                        sink(&format!(
                            "[{}] still running after {}s, {} chars of output so far",
                            provider.name,
                            started.elapsed().as_secs(),
                            parsed_len
                        ));
                    }
                }
                () = cancel.cancelled() => {
                    warn!(provider = %provider.name, "invocation cancelled, stopping subprocess");
                    // SIGTERM the whole process group first so the tool
                    // can flush; kill after a short grace period.
                    if let Some(pid) = child.id() {
                        let _ = nix::sys::signal::killpg(
                            nix::unistd::Pid::from_raw(pid as i32),
                            nix::sys::signal::Signal::SIGTERM,
                        );
                    }
                    if tokio::time::timeout(Duration::from_secs(2), child.wait())
                        .await
                        .is_err()
                    {
                        let _ = child.kill().await;
                    }
                    cancelled = true;
                    break;
                }
            }
        }

        let status = child.wait().await;
        let _ = stderr_task.await;
        let stderr_text = stderr_buf.lock().await.clone();
        let duration_ms = started.elapsed().as_millis() as u64;

        let parsed_text = if provider.stream_json {
            accumulator.into_text()
        } else {
            plain_text
        };

        let exit_ok = matches!(&status, Ok(s) if s.success());
        let success = exit_ok && !cancelled;

        let error = if cancelled {
            Some("invocation cancelled".to_string())
        } else if !exit_ok {
            let code = status.ok().and_then(|s| s.code());
            Some(format!(
                "provider exited with {:?}: {}",
                code,
                excerpt(&stderr_text, 400)
            ))
        } else {
            None
        };

        if success {
            emit_summary(on_output.as_deref(), &parsed_text);
        }

        debug!(
            provider = %provider.name,
            success,
            duration_ms,
            output_chars = raw_output.chars().count(),
            "provider invocation finished"
        );

        Ok(InvocationResult {
            success,
            output_chars: raw_output.chars().count(),
            error_chars: stderr_text.chars().count(),
            raw_output,
            parsed_text,
            error,
            duration_ms,
        })
    }
}

/// Emit the last non-empty line of parsed text, truncated, via the sink.
fn emit_summary(sink: Option<&(dyn Fn(&str) + Send + Sync)>, parsed_text: &str) {
    let Some(sink) = sink else { return };
    if let Some(last) = parsed_text.lines().rev().find(|l| !l.trim().is_empty()) {
        sink(&excerpt(last.trim(), SUMMARY_MAX_CHARS));
    }
}

fn excerpt(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}…")
    }
}

/// Write the prompt to a temp file plus a wrapper script that pipes it into
/// the provider command. The script closes its own stdin so the provider
/// can never hang waiting on the terminal.
fn write_prompt_script(
    command: &str,
    args: &[String],
    prompt: &str,
) -> CoordResult<(tempfile::TempPath, tempfile::TempPath)> {
    use std::io::Write;

    let mut prompt_file = tempfile::Builder::new()
        .prefix("cohort-prompt-")
        .suffix(".txt")
        .tempfile()?;
    prompt_file.write_all(prompt.as_bytes())?;
    prompt_file.flush()?;
    let prompt_path = prompt_file.into_temp_path();

    let quoted_args: Vec<String> = args.iter().map(|a| shell_quote(a)).collect();
    let script = format!(
        "#!/bin/sh\nexec < /dev/null\ncat {} | {} {}\n",
        shell_quote(&prompt_path.to_string_lossy()),
        shell_quote(command),
        quoted_args.join(" ")
    );

    let mut script_file = tempfile::Builder::new()
        .prefix("cohort-invoke-")
        .suffix(".sh")
        .tempfile()?;
    script_file.write_all(script.as_bytes())?;
    script_file.flush()?;
    let script_path = script_file.into_temp_path();

    Ok((script_path, prompt_path))
}

/// Single-quote a string for POSIX sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
