//! Narrow contracts for the external services the core talks to.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServiceResult;
use crate::types::{
    Category, Classification, ConversationKey, KnowledgeMatch, KnowledgeRecord,
    NewKnowledgeRecord, RecordPatch, StoreStats,
};

/// Options for candidate-answer generation.
#[derive(Clone, Debug, PartialEq)]
pub struct AnswerOptions {
    pub temperature: f32,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self { temperature: 0.4 }
    }
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Summarise a transcript and pick one of `categories`. An unparseable
    /// model answer is reported as `MalformedResponse`.
    async fn classify(
        &self,
        transcript: &str,
        categories: &[Category],
        rules: &[String],
    ) -> ServiceResult<Classification>;

    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>>;

    /// Draft an answer for `query`; `None` when there is nothing to base it on.
    async fn answer(
        &self,
        query: &str,
        matches: &[KnowledgeMatch],
        options: &AnswerOptions,
    ) -> ServiceResult<Option<String>>;

    async fn transcribe_audio(&self, audio: &[u8]) -> ServiceResult<String>;
}

/// Outcome of inserting a category that may already exist.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CategoryInsert {
    Added,
    AlreadyExists,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert(&self, record: NewKnowledgeRecord) -> ServiceResult<i64>;

    async fn update(&self, id: i64, patch: RecordPatch) -> ServiceResult<()>;

    /// Records whose synced-marker is still null, oldest first.
    async fn query_unsynced(&self) -> ServiceResult<Vec<KnowledgeRecord>>;

    /// Stamp every id with the same synced-marker in one batch.
    async fn mark_synced(&self, ids: &[i64]) -> ServiceResult<()>;

    async fn similarity_search(
        &self,
        embedding: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> ServiceResult<Vec<KnowledgeMatch>>;

    async fn list_categories(&self) -> ServiceResult<Vec<Category>>;

    async fn list_rules(&self) -> ServiceResult<Vec<String>>;

    async fn add_category(&self, category: Category) -> ServiceResult<CategoryInsert>;

    async fn add_rule(&self, rule: &str) -> ServiceResult<()>;

    /// All records in creation order, optionally restricted to one category.
    async fn list_records(&self, category: Option<&str>) -> ServiceResult<Vec<KnowledgeRecord>>;

    async fn stats(&self) -> ServiceResult<StoreStats>;
}

/// Row-append destination for synced records (a spreadsheet).
#[async_trait]
pub trait ExternalSink: Send + Sync {
    fn name(&self) -> &str;

    async fn append_rows(&self, rows: &[Vec<String>]) -> ServiceResult<()>;
}

/// Reply sent back to a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Text with decision buttons attached; each entry is (label, action id).
    Choice {
        text: String,
        actions: Vec<(String, String)>,
    },
    File {
        filename: String,
        bytes: Vec<u8>,
    },
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }

    pub fn body(&self) -> &str {
        match self {
            Reply::Text(text) | Reply::Choice { text, .. } => text,
            Reply::File { filename, .. } => filename,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn reply(&self, key: &ConversationKey, reply: Reply) -> anyhow::Result<()>;
}

pub type SharedAnalysis = Arc<dyn AnalysisService>;
pub type SharedStore = Arc<dyn DurableStore>;
pub type SharedSink = Arc<dyn ExternalSink>;
pub type SharedTransport = Arc<dyn Transport>;
