//! Per-agent durable mailboxes.
//!
//! One JSON-Lines file per agent. Appends serialize behind a sibling lock
//! file; reads are lock-free and track a per-consumer line cursor. A
//! trailing partial line (a writer mid-append) is never consumed: the
//! cursor stays put and the line is retried on the next poll.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::domain::models::{Message, MessageType, BROADCAST};
use crate::domain::{CoordError, CoordResult};
use crate::infrastructure::fs_lock::FileLock;

/// Poll interval while waiting for messages.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Interval between append-lock acquisition attempts.
const LOCK_RETRY: Duration = Duration::from_millis(10);

/// One agent's handle on the team mailbox directory.
pub struct MessageBus {
    mailbox_dir: PathBuf,
    agent_id: String,
    lock_timeout: Duration,
    /// Count of complete lines of our own mailbox already consumed.
    cursor: Mutex<usize>,
    /// Messages of other types set aside by a typed wait; drained first.
    buffered: Mutex<VecDeque<Message>>,
}

impl MessageBus {
    pub fn new(mailbox_dir: impl Into<PathBuf>, agent_id: impl Into<String>) -> Self {
        Self {
            mailbox_dir: mailbox_dir.into(),
            agent_id: agent_id.into(),
            lock_timeout: Duration::from_secs(5),
            cursor: Mutex::new(0),
            buffered: Mutex::new(VecDeque::new()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn mailbox_path(&self, agent_id: &str) -> PathBuf {
        self.mailbox_dir.join(format!("{agent_id}.jsonl"))
    }

    fn lock_path(&self, agent_id: &str) -> PathBuf {
        self.mailbox_dir.join(format!("{agent_id}.jsonl.lock"))
    }

    /// Create this agent's (empty) mailbox so broadcasts can find it.
    pub async fn ensure_mailbox(&self) -> CoordResult<()> {
        tokio::fs::create_dir_all(&self.mailbox_dir).await?;
        let path = self.mailbox_path(&self.agent_id);
        if !path.exists() {
            tokio::fs::File::create(&path).await?;
        }
        Ok(())
    }

    /// Send one message. Fire-and-forget from the caller's point of view;
    /// the append either fully lands or the error is returned.
    pub async fn send(
        &self,
        to: &str,
        message_type: MessageType,
        content: impl Into<String>,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> CoordResult<()> {
        let mut message = Message::new(&self.agent_id, to, message_type, content);
        for (k, v) in metadata {
            message.metadata.insert(k, v);
        }
        if to == BROADCAST {
            return self.fan_out(&message).await;
        }
        self.append(to, &message).await
    }

    /// Send to every mailbox in the directory except our own.
    pub async fn broadcast(
        &self,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> CoordResult<()> {
        let message = Message::new(&self.agent_id, BROADCAST, message_type, content);
        self.fan_out(&message).await
    }

    async fn fan_out(&self, message: &Message) -> CoordResult<()> {
        let recipients = self.list_mailboxes().await?;
        for recipient in recipients {
            if recipient == self.agent_id {
                continue;
            }
            if let Err(err) = self.append(&recipient, message).await {
                warn!(to = %recipient, error = %err, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    /// Agent IDs with a mailbox file in the directory.
    pub async fn list_mailboxes(&self) -> CoordResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.mailbox_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(agent) = name.strip_suffix(".jsonl") {
                names.push(agent.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Append one message line to `to`'s mailbox under its file lock.
    async fn append(&self, to: &str, message: &Message) -> CoordResult<()> {
        tokio::fs::create_dir_all(&self.mailbox_dir).await?;
        let line = serde_json::to_string(message)?;
        let lock = self.acquire_append_lock(to).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.mailbox_path(to))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        drop(lock);

        trace!(
            from = %self.agent_id,
            to,
            message_type = message.message_type.as_str(),
            "message appended"
        );
        Ok(())
    }

    async fn acquire_append_lock(&self, to: &str) -> CoordResult<FileLock> {
        let lock_path = self.lock_path(to);
        let started = Instant::now();
        loop {
            if let Some(lock) = FileLock::try_acquire(&lock_path)? {
                return Ok(lock);
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(CoordError::LockTimeout {
                    path: lock_path,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(LOCK_RETRY).await;
        }
    }

    /// Non-blocking read of everything new in our own mailbox.
    ///
    /// Buffered messages set aside by a typed wait come first, then new
    /// complete lines beyond the cursor.
    pub async fn poll(&self) -> CoordResult<Vec<Message>> {
        let mut messages: Vec<Message> = self.buffered.lock().await.drain(..).collect();
        messages.extend(self.read_new_lines().await?);
        if !messages.is_empty() {
            debug!(agent_id = %self.agent_id, count = messages.len(), "messages received");
        }
        Ok(messages)
    }

    async fn read_new_lines(&self) -> CoordResult<Vec<Message>> {
        let path = self.mailbox_path(&self.agent_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let text = String::from_utf8_lossy(&bytes);

        let ends_with_newline = text.ends_with('\n');
        let mut lines: Vec<&str> = text.split('\n').collect();
        // split leaves one empty trailing segment after a final newline;
        // without the newline the last segment is a partial append.
        let partial_tail = if ends_with_newline {
            lines.pop();
            None
        } else {
            lines.pop()
        };
        if let Some(tail) = partial_tail {
            if !tail.is_empty() {
                trace!(agent_id = %self.agent_id, "partial trailing line, deferring");
            }
        }

        let mut cursor = self.cursor.lock().await;
        let mut messages = Vec::new();
        for line in lines.iter().skip(*cursor) {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    warn!(agent_id = %self.agent_id, error = %err, "skipping malformed mailbox line");
                }
            }
        }
        *cursor = lines.len();
        Ok(messages)
    }

    /// Poll until any message arrives, the timeout elapses, or the token
    /// cancels. Returns whatever arrived (possibly empty).
    pub async fn wait_for_messages(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoordResult<Vec<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.poll().await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            if Instant::now() >= deadline || cancel.is_cancelled() {
                return Ok(Vec::new());
            }
            tokio::select! {
                () = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                () = cancel.cancelled() => return Ok(Vec::new()),
            }
        }
    }

    /// Wait for the next message of one specific type.
    ///
    /// Messages of other types observed while waiting are buffered, not
    /// consumed; a later [`poll`](Self::poll) returns them in order.
    pub async fn wait_for_message_of_type(
        &self,
        message_type: MessageType,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> CoordResult<Option<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.poll().await?;
            let mut found = None;
            let mut set_aside = Vec::new();
            for message in messages {
                if found.is_none() && message.message_type == message_type {
                    found = Some(message);
                } else {
                    set_aside.push(message);
                }
            }
            if !set_aside.is_empty() {
                let mut buffered = self.buffered.lock().await;
                for message in set_aside {
                    buffered.push_back(message);
                }
            }
            if found.is_some() {
                return Ok(found);
            }
            if Instant::now() >= deadline || cancel.is_cancelled() {
                return Ok(None);
            }
            tokio::select! {
                () = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                () = cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// Delete every mailbox and lock file. Failures log but never throw.
    pub async fn cleanup_dir(mailbox_dir: &Path) {
        let Ok(mut entries) = tokio::fs::read_dir(mailbox_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), error = %err, "mailbox cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bus(dir: &TempDir, agent: &str) -> MessageBus {
        MessageBus::new(dir.path(), agent)
    }

    #[tokio::test]
    async fn test_send_poll_round_trip() {
        let dir = TempDir::new().unwrap();
        let alice = bus(&dir, "alice");
        let bob = bus(&dir, "bob");

        alice
            .send("bob", MessageType::Text, "hi", Vec::new())
            .await
            .unwrap();

        let received = bob.poll().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].from_agent_id, "alice");
        assert_eq!(received[0].content, "hi");

        // A second immediate poll returns nothing.
        assert!(bob.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mailbox_order_is_append_order() {
        let dir = TempDir::new().unwrap();
        let sender = bus(&dir, "lead");
        let receiver = bus(&dir, "agent-1");

        for i in 0..5 {
            sender
                .send("agent-1", MessageType::Text, format!("m{i}"), Vec::new())
                .await
                .unwrap();
        }
        let received = receiver.poll().await.unwrap();
        let bodies: Vec<&str> = received.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let dir = TempDir::new().unwrap();
        let lead = bus(&dir, "lead");
        let a = bus(&dir, "agent-1");
        let b = bus(&dir, "agent-2");
        lead.ensure_mailbox().await.unwrap();
        a.ensure_mailbox().await.unwrap();
        b.ensure_mailbox().await.unwrap();

        lead.broadcast(MessageType::Broadcast, "all hands")
            .await
            .unwrap();

        assert_eq!(a.poll().await.unwrap().len(), 1);
        assert_eq!(b.poll().await.unwrap().len(), 1);
        assert!(lead.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_trailing_line_not_consumed() {
        let dir = TempDir::new().unwrap();
        let receiver = bus(&dir, "agent-1");
        let sender = bus(&dir, "lead");

        sender
            .send("agent-1", MessageType::Text, "complete", Vec::new())
            .await
            .unwrap();

        // Simulate a writer caught mid-append: no trailing newline.
        let path = dir.path().join("agent-1.jsonl");
        let mut existing = std::fs::read_to_string(&path).unwrap();
        existing.push_str("{\"message_id\":\"trunc");
        std::fs::write(&path, &existing).unwrap();

        let first = receiver.poll().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].content, "complete");

        // Writer finishes the line; the deferred message now arrives.
        let rest = "ated\"}".to_string(); // still malformed JSON, gets skipped
        std::fs::write(&path, format!("{existing}{rest}\n")).unwrap();
        let second = receiver.poll().await.unwrap();
        assert!(second.is_empty(), "malformed completed line is skipped");

        sender
            .send("agent-1", MessageType::Text, "after", Vec::new())
            .await
            .unwrap();
        let third = receiver.poll().await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].content, "after");
    }

    #[tokio::test]
    async fn test_wait_for_messages_times_out_empty() {
        let dir = TempDir::new().unwrap();
        let receiver = bus(&dir, "agent-1");
        let messages = receiver
            .wait_for_messages(Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_messages_wakes_on_arrival() {
        let dir = TempDir::new().unwrap();
        let receiver = bus(&dir, "agent-1");
        let sender = bus(&dir, "lead");

        let waiter = tokio::spawn(async move {
            receiver
                .wait_for_messages(Duration::from_secs(5), &CancellationToken::new())
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        sender
            .send("agent-1", MessageType::Text, "wake up", Vec::new())
            .await
            .unwrap();

        let messages = waiter.await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "wake up");
    }

    #[tokio::test]
    async fn test_typed_wait_buffers_other_types() {
        let dir = TempDir::new().unwrap();
        let receiver = bus(&dir, "agent-1");
        let sender = bus(&dir, "lead");

        sender
            .send("agent-1", MessageType::Text, "context note", Vec::new())
            .await
            .unwrap();
        sender
            .send(
                "agent-1",
                MessageType::PlanApproval,
                "approved",
                vec![("approved".to_string(), "true".to_string())],
            )
            .await
            .unwrap();

        let approval = receiver
            .wait_for_message_of_type(
                MessageType::PlanApproval,
                Duration::from_secs(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap()
            .expect("approval should arrive");
        assert!(approval.meta_flag("approved"));

        // The Text message was not consumed by the typed wait.
        let leftover = receiver.poll().await.unwrap();
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].content, "context note");
    }

    #[tokio::test]
    async fn test_cancellation_stops_wait() {
        let dir = TempDir::new().unwrap();
        let receiver = bus(&dir, "agent-1");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let started = Instant::now();
        let result = receiver
            .wait_for_message_of_type(MessageType::Text, Duration::from_secs(30), &cancel)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
