use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier grouping messages into one logical conversation (a chat id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for ConversationKey {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for ConversationKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ConversationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Which side of a support conversation wrote a message.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The customer who opened the conversation.
    Initiator,
    /// The support operator answering it.
    Responder,
}

impl SenderRole {
    /// Tag used in transcripts: `[USER]: ...` / `[SUPPORT]: ...`.
    pub fn tag(&self) -> &'static str {
        match self {
            SenderRole::Initiator => "USER",
            SenderRole::Responder => "SUPPORT",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferedMessage {
    pub role: SenderRole,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl BufferedMessage {
    pub fn new(role: SenderRole, text: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            role,
            text: text.into(),
            sent_at,
        }
    }

    pub fn transcript_line(&self) -> String {
        format!("[{}]: {}", self.role.tag(), self.text)
    }
}

/// Join messages into the transcript form fed to classification.
pub fn render_transcript<'a, I>(messages: I) -> String
where
    I: IntoIterator<Item = &'a BufferedMessage>,
{
    messages
        .into_iter()
        .map(BufferedMessage::transcript_line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A session handed to the completion handler after its quiet period.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedDialog {
    pub key: ConversationKey,
    pub first_message_id: i64,
    pub transcript: String,
    pub message_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub name: String,
    pub description: String,
}

impl Category {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Result of classifying a transcript.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Classification {
    #[serde(alias = "summary_problem")]
    pub problem: String,
    #[serde(alias = "summary_solution")]
    pub solution: String,
    pub category: String,
}

pub const UNDETERMINED_SUMMARY: &str = "Не удалось определить";
pub const FALLBACK_CATEGORY: &str = "прочее";

impl Classification {
    /// Stand-in used when the analysis service answers with something unparseable.
    pub fn undetermined() -> Self {
        Self {
            problem: UNDETERMINED_SUMMARY.to_string(),
            solution: UNDETERMINED_SUMMARY.to_string(),
            category: FALLBACK_CATEGORY.to_string(),
        }
    }
}

/// Knowledge record about to be inserted into the durable store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewKnowledgeRecord {
    pub source_message_id: Option<i64>,
    pub conversation: ConversationKey,
    pub category: String,
    pub transcript: String,
    pub problem: String,
    pub solution: String,
    pub embedding: Vec<f32>,
}

/// Persisted knowledge record. `synced_at` is the synced-marker: `None` until
/// the record has been delivered to the sheet sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeRecord {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub source_message_id: Option<i64>,
    pub conversation: ConversationKey,
    pub category: String,
    pub transcript: String,
    pub problem: String,
    pub solution: String,
    #[serde(default, skip_serializing)]
    pub embedding: Vec<f32>,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Partial update applied by recalculation; `None` fields are left untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.problem.is_none()
            && self.solution.is_none()
            && self.embedding.is_none()
    }
}

/// One hit from a similarity search, best first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeMatch {
    pub id: i64,
    pub category: String,
    pub problem: String,
    pub solution: String,
    pub transcript: String,
    pub similarity: f32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryCount {
    pub category: String,
    pub count: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub total: u64,
    pub by_category: Vec<CategoryCount>,
    pub last_sync: Option<DateTime<Utc>>,
}
