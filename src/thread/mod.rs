//! Conversation thread identity and context.
//!
//! One [`ThreadContext`] per logical conversation, keyed by
//! `(channel, thread id)`. The thread id is the platform's thread-root
//! timestamp when the event is a reply, otherwise the inciting message's
//! own timestamp — so replies share context and a fresh @mention in a busy
//! channel always starts blank. Messages are strictly append-ordered by
//! local arrival; the platform's own timestamps are carried but never used
//! for ordering.

use crate::cache::TtlCache;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A context is live while `now - last_activity` stays under this.
const DEFAULT_TIMEOUT_SECS: i64 = 3600;

/// Summarize once more than this many messages have accumulated.
const DEFAULT_SUMMARY_THRESHOLD: usize = 10;

/// Keep this many recent messages verbatim when summarizing.
const DEFAULT_SUMMARY_KEEP: usize = 5;

/// How much of each user-message opening survives into the digest.
const OPENING_LEN: usize = 48;

const HISTORY_OPEN: &str = "=== CONVERSATION HISTORY ===";
const HISTORY_CLOSE: &str = "=== END CONVERSATION HISTORY ===";
const REQUEST_OPEN: &str = "=== CURRENT REQUEST ===";
const REQUEST_CLOSE: &str = "=== END CURRENT REQUEST ===";

const FRAMING_INSTRUCTION: &str = "The conversation-history block is prior context only. \
Answer the current-request block directly; do not re-answer historical turns.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub role: Role,
    pub content: String,
    /// Local arrival time — the ordering source of truth.
    pub arrived_at: DateTime<Utc>,
    /// Originating platform message id, when the platform assigned one.
    #[serde(default)]
    pub platform_ts: Option<String>,
    #[serde(default)]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadContext {
    pub channel: String,
    pub thread_id: String,
    pub messages: Vec<ThreadMessage>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ThreadContext {
    fn new(channel: &str, thread_id: &str) -> Self {
        Self {
            channel: channel.to_string(),
            thread_id: thread_id.to_string(),
            messages: Vec::new(),
            last_activity: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// A single message in the payload handed to the model backend.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

/// Resolve the thread identifier for an inbound event.
pub fn resolve_thread_id(thread_root: Option<&str>, arrival_ts: &str) -> String {
    match thread_root {
        Some(root) if !root.is_empty() => root.to_string(),
        _ => arrival_ts.to_string(),
    }
}

pub struct ContextManager {
    store: Arc<TtlCache<ThreadContext>>,
    timeout: Duration,
    summary_threshold: usize,
    summary_keep: usize,
}

impl ContextManager {
    pub fn new(store: Arc<TtlCache<ThreadContext>>) -> Self {
        Self {
            store,
            timeout: Duration::seconds(DEFAULT_TIMEOUT_SECS),
            summary_threshold: DEFAULT_SUMMARY_THRESHOLD,
            summary_keep: DEFAULT_SUMMARY_KEEP,
        }
    }

    pub fn with_settings(
        store: Arc<TtlCache<ThreadContext>>,
        timeout: Duration,
        summary_threshold: usize,
        summary_keep: usize,
    ) -> Self {
        Self {
            store,
            timeout,
            summary_threshold,
            summary_keep,
        }
    }

    fn cache_key(channel: &str, thread_id: &str) -> String {
        format!("{}:{}", channel, thread_id)
    }

    /// Physical eviction happens at twice the liveness timeout; between the
    /// two, a stale context still exists but lookups ignore it.
    fn store_ttl(&self) -> Duration {
        self.timeout * 2
    }

    /// Fetch a live context, or silently allocate a fresh one under the
    /// same key when none exists or the previous one has gone stale. Old
    /// messages are never merged into the replacement.
    pub async fn get_or_create(&self, channel: &str, thread_id: &str) -> ThreadContext {
        let key = Self::cache_key(channel, thread_id);
        if let Some(ctx) = self.store.get(&key).await {
            if Utc::now() - ctx.last_activity < self.timeout {
                return ctx;
            }
            debug!("thread {} expired; starting fresh context", key);
        }
        let ctx = ThreadContext::new(channel, thread_id);
        self.store.set(&key, ctx.clone(), Some(self.store_ttl())).await;
        ctx
    }

    pub async fn append_user(
        &self,
        channel: &str,
        thread_id: &str,
        content: impl Into<String>,
        platform_ts: Option<String>,
        author_id: Option<String>,
        author_name: Option<String>,
    ) {
        self.append(
            channel,
            thread_id,
            ThreadMessage {
                role: Role::User,
                content: content.into(),
                arrived_at: Utc::now(),
                platform_ts,
                author_id,
                author_name,
            },
        )
        .await;
    }

    pub async fn append_assistant(
        &self,
        channel: &str,
        thread_id: &str,
        content: impl Into<String>,
        platform_ts: Option<String>,
    ) {
        self.append(
            channel,
            thread_id,
            ThreadMessage {
                role: Role::Assistant,
                content: content.into(),
                arrived_at: Utc::now(),
                platform_ts,
                author_id: None,
                author_name: None,
            },
        )
        .await;
    }

    async fn append(&self, channel: &str, thread_id: &str, message: ThreadMessage) {
        let key = Self::cache_key(channel, thread_id);
        let mut ctx = self.get_or_create(channel, thread_id).await;
        ctx.messages.push(message);
        ctx.last_activity = Utc::now();
        self.store.set(&key, ctx, Some(self.store_ttl())).await;
    }

    pub async fn recent_messages(&self, channel: &str, thread_id: &str, n: usize) -> Vec<ThreadMessage> {
        let ctx = self.get_or_create(channel, thread_id).await;
        let start = ctx.messages.len().saturating_sub(n);
        ctx.messages[start..].to_vec()
    }

    /// Whether the bot has already spoken in this thread — gates whether a
    /// plain (unmentioned) thread reply gets processed.
    pub async fn bot_participates(&self, channel: &str, thread_id: &str) -> bool {
        let key = Self::cache_key(channel, thread_id);
        match self.store.get(&key).await {
            Some(ctx) if Utc::now() - ctx.last_activity < self.timeout => {
                ctx.messages.iter().any(|m| m.role == Role::Assistant)
            }
            _ => false,
        }
    }

    pub async fn reset(&self, channel: &str, thread_id: &str) {
        let key = Self::cache_key(channel, thread_id);
        self.store.delete(&key).await;
    }

    pub async fn context_count(&self) -> usize {
        self.store.len().await
    }

    /// The history slice handed to the model: verbatim while short, one
    /// synthetic digest plus the most recent `summary_keep` once more than
    /// `summary_threshold` messages have accumulated. Token cost stays
    /// bounded without hard-capping conversation length.
    pub fn context_for_model(&self, ctx: &ThreadContext) -> Vec<ThreadMessage> {
        if ctx.messages.len() <= self.summary_threshold {
            return ctx.messages.clone();
        }

        // A misconfigured keep larger than the threshold must not panic;
        // an empty cut just returns everything behind the digest.
        let cut = ctx.messages.len().saturating_sub(self.summary_keep);
        let (older, recent) = ctx.messages.split_at(cut);

        let mut result = vec![ThreadMessage {
            role: Role::System,
            content: summarize(older),
            arrived_at: Utc::now(),
            platform_ts: None,
            author_id: None,
            author_name: None,
        }];
        result.extend_from_slice(recent);
        result
    }

    /// Build the full payload for the model: system framing, prior context
    /// between history sentinels, the live request in its own sentinel
    /// pair. The sentinels are a prompt-engineering guard against the model
    /// conflating historical turns with the current ask.
    pub fn build_prompt(
        &self,
        ctx: &ThreadContext,
        live_text: &str,
        tenant_system_prompt: Option<&str>,
    ) -> Vec<PromptMessage> {
        let mut system = String::new();
        if let Some(prompt) = tenant_system_prompt {
            system.push_str(prompt);
            system.push_str("\n\n");
        }
        system.push_str(FRAMING_INSTRUCTION);

        let history = self.context_for_model(ctx);
        let mut body = String::new();
        if !history.is_empty() {
            body.push_str(HISTORY_OPEN);
            body.push('\n');
            for msg in &history {
                body.push_str(msg.role.as_str());
                body.push_str(": ");
                body.push_str(&msg.content);
                body.push('\n');
            }
            body.push_str(HISTORY_CLOSE);
            body.push_str("\n\n");
        }
        body.push_str(REQUEST_OPEN);
        body.push('\n');
        body.push_str(live_text);
        body.push('\n');
        body.push_str(REQUEST_CLOSE);

        vec![
            PromptMessage {
                role: "system".into(),
                content: system,
            },
            PromptMessage {
                role: "user".into(),
                content: body,
            },
        ]
    }
}

/// Terse digest of the messages dropped from the verbatim window: counts
/// by role plus truncated openings of what users asked.
fn summarize(older: &[ThreadMessage]) -> String {
    let users = older.iter().filter(|m| m.role == Role::User).count();
    let assistants = older.iter().filter(|m| m.role == Role::Assistant).count();

    let openings: Vec<String> = older
        .iter()
        .filter(|m| m.role == Role::User)
        .take(6)
        .map(|m| {
            let mut opening: String = m.content.chars().take(OPENING_LEN).collect();
            if m.content.chars().count() > OPENING_LEN {
                opening.push('…');
            }
            format!("\"{}\"", opening)
        })
        .collect();

    let mut digest = format!(
        "[Summary of {} earlier messages: {} from users, {} from the assistant.",
        older.len(),
        users,
        assistants
    );
    if !openings.is_empty() {
        digest.push_str(" Users asked about: ");
        digest.push_str(&openings.join("; "));
        digest.push('.');
    }
    digest.push(']');
    digest
}
