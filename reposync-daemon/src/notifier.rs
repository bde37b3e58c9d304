//! Chat notifications for batch outcomes and daemon lifecycle.
//!
//! [`WebhookNotifier`] posts Discord-style `{"content": "..."}` bodies.
//! Delivery is best effort: callers go through [`deliver`], which logs
//! failures and never propagates them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reposync_core::{ChangeEntry, RepoName, SyncConfig};
use reposync_engine::{BatchResult, SyncError};
use serde_json::json;

use crate::error::DaemonError;

/// Discord rejects content over 2000 characters; stay clear of it.
pub const MAX_MESSAGE_CHARS: usize = 1900;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Blocking message sink. The runtime calls it from `spawn_blocking`.
pub trait Notifier: Send + Sync {
    fn send(&self, message: &str) -> Result<(), DaemonError>;
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: WEBHOOK_TIMEOUT,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn send(&self, message: &str) -> Result<(), DaemonError> {
        ureq::post(&self.url)
            .timeout(self.timeout)
            .send_json(json!({ "content": message }))
            .map_err(|err| DaemonError::Notifier(err.to_string()))?;
        Ok(())
    }
}

/// Used when no webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, message: &str) -> Result<(), DaemonError> {
        tracing::debug!(chars = message.len(), "no webhook configured; notification dropped");
        Ok(())
    }
}

pub fn from_config(config: &SyncConfig) -> Arc<dyn Notifier> {
    match config.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(url)),
        _ => Arc::new(NoopNotifier),
    }
}

/// Send every message in order, logging (not returning) failures.
pub fn deliver(notifier: &dyn Notifier, messages: &[String]) {
    for message in messages {
        if let Err(err) = notifier.send(message) {
            tracing::warn!(error = %err, "notification delivery failed");
        }
    }
}

// ─── Rendering ────────────────────────────────────────────────────────────────

/// One line per change: `<repo>: <code>: <path>`.
pub fn update_lines(updates: &BTreeMap<RepoName, Vec<ChangeEntry>>) -> Vec<String> {
    updates
        .iter()
        .flat_map(|(repo, changes)| {
            changes
                .iter()
                .map(move |change| format!("{repo}: {}: {}", change.kind.status_code(), change.path))
        })
        .collect()
}

pub fn failure_lines(errors: &BTreeMap<RepoName, SyncError>) -> Vec<String> {
    errors
        .iter()
        .map(|(repo, err)| format!("{repo}: {}: {err}", err.kind()))
        .collect()
}

/// Messages announcing a batch: pulled changes first, then failures.
/// A batch with neither produces nothing.
pub fn batch_messages(batch: &BatchResult) -> Vec<String> {
    let mut messages = Vec::new();
    if !batch.updates.is_empty() {
        messages.extend(chunk_lines("Updates pulled:", &update_lines(&batch.updates)));
    }
    if !batch.errors.is_empty() {
        messages.extend(chunk_lines("Sync failures:", &failure_lines(&batch.errors)));
    }
    messages
}

pub fn startup_message(repositories: usize) -> String {
    format!("reposync started: monitoring {repositories} repositories")
}

pub fn shutdown_message() -> String {
    "reposync shutting down".to_string()
}

/// Pack `lines` under `header` into messages of at most [`MAX_MESSAGE_CHARS`].
/// A line too long for any message on its own is truncated.
pub fn chunk_lines(header: &str, lines: &[String]) -> Vec<String> {
    let mut messages = Vec::new();
    let mut current = header.to_string();

    let room = MAX_MESSAGE_CHARS.saturating_sub(header.chars().count() + 1);
    for line in lines {
        let line = truncate_chars(line, room);
        if current.chars().count() + 1 + line.chars().count() > MAX_MESSAGE_CHARS {
            messages.push(std::mem::replace(&mut current, header.to_string()));
        }
        current.push('\n');
        current.push_str(&line);
    }
    if current.chars().count() > header.chars().count() {
        messages.push(current);
    }
    messages
}

fn truncate_chars(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_string();
    }
    let mut cut: String = line.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}
