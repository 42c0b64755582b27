//! Turns transcripts into categorised, embedded knowledge records.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::aggregator::DialogHandler;
use crate::collab::{SharedAnalysis, SharedStore};
use crate::error::ServiceError;
use crate::types::{
    Category, Classification, CompletedDialog, ConversationKey, NewKnowledgeRecord, RecordPatch,
};

/// Progress is reported every this many recalculated records.
pub const PROGRESS_EVERY: usize = 10;

pub struct DialogPipeline {
    analysis: SharedAnalysis,
    store: SharedStore,
    fallback_category: String,
    embedding_max_chars: usize,
}

impl DialogPipeline {
    pub fn new(
        analysis: SharedAnalysis,
        store: SharedStore,
        fallback_category: impl Into<String>,
        embedding_max_chars: usize,
    ) -> Self {
        Self {
            analysis,
            store,
            fallback_category: fallback_category.into(),
            embedding_max_chars: embedding_max_chars.max(1),
        }
    }

    async fn taxonomy(&self) -> Result<(Vec<Category>, Vec<String>)> {
        let (categories, rules) =
            tokio::try_join!(self.store.list_categories(), self.store.list_rules())
                .context("load categories and rules")?;
        if categories.is_empty() {
            warn!(
                target: "skb::pipeline",
                fallback = %self.fallback_category,
                "no categories defined; every dialog lands in the fallback"
            );
        }
        Ok((categories, rules))
    }

    /// Classify with the current taxonomy. An unparseable answer becomes the
    /// undetermined summary; an unknown category becomes the fallback.
    async fn classify(
        &self,
        transcript: &str,
        categories: &[Category],
        rules: &[String],
    ) -> Result<Classification> {
        let mut classification = match self.analysis.classify(transcript, categories, rules).await
        {
            Ok(c) => c,
            Err(err @ ServiceError::MalformedResponse { .. }) => {
                warn!(target: "skb::pipeline", error = %err, "classification unparseable; using defaults");
                Classification::undetermined()
            }
            Err(err) => return Err(err).context("classify transcript"),
        };
        let known: HashSet<&str> = categories.iter().map(|c| c.name.as_str()).collect();
        if !known.contains(classification.category.as_str()) {
            classification.category = self.fallback_category.clone();
        }
        Ok(classification)
    }

    async fn embed_summary(&self, classification: &Classification) -> Result<Vec<f32>> {
        let text = format!("{} {}", classification.problem, classification.solution);
        self.analysis
            .embed(truncate_chars(&text, self.embedding_max_chars))
            .await
            .context("embed summary")
    }

    /// Classify, embed and insert one transcript; returns the new record id.
    pub async fn ingest(
        &self,
        conversation: &ConversationKey,
        source_message_id: Option<i64>,
        transcript: &str,
    ) -> Result<i64> {
        let (categories, rules) = self.taxonomy().await?;
        let classification = self.classify(transcript, &categories, &rules).await?;
        let embedding = self.embed_summary(&classification).await?;
        let category = classification.category.clone();
        let id = self
            .store
            .insert(NewKnowledgeRecord {
                source_message_id,
                conversation: conversation.clone(),
                category: classification.category,
                transcript: transcript.to_string(),
                problem: classification.problem,
                solution: classification.solution,
                embedding,
            })
            .await
            .context("insert knowledge record")?;
        info!(
            target: "skb::pipeline",
            key = %conversation,
            id,
            category = %category,
            "dialog processed and saved"
        );
        Ok(id)
    }

    /// Persist a dialog the aggregator completed.
    pub async fn process(&self, dialog: CompletedDialog) -> Result<i64> {
        info!(
            target: "skb::pipeline",
            key = %dialog.key,
            messages = dialog.message_count,
            "processing dialog"
        );
        self.ingest(&dialog.key, Some(dialog.first_message_id), &dialog.transcript)
            .await
    }

    /// Re-run classification and embedding for stored records with the
    /// current categories and rules. `progress(done, total)` fires every
    /// [`PROGRESS_EVERY`] records.
    pub async fn recalculate<P>(&self, category: Option<&str>, mut progress: P) -> Result<usize>
    where
        P: FnMut(usize, usize) + Send,
    {
        let records = self
            .store
            .list_records(category)
            .await
            .context("list records for recalculation")?;
        if records.is_empty() {
            return Ok(0);
        }
        let (categories, rules) = self.taxonomy().await?;
        let total = records.len();
        let mut processed = 0usize;
        for record in records {
            let classification = self
                .classify(&record.transcript, &categories, &rules)
                .await?;
            let embedding = self.embed_summary(&classification).await?;
            self.store
                .update(
                    record.id,
                    RecordPatch {
                        category: Some(classification.category),
                        problem: Some(classification.problem),
                        solution: Some(classification.solution),
                        embedding: Some(embedding),
                    },
                )
                .await
                .with_context(|| format!("update record {}", record.id))?;
            processed += 1;
            if processed % PROGRESS_EVERY == 0 {
                progress(processed, total);
            }
        }
        info!(target: "skb::pipeline", processed, filter = ?category, "recalculation finished");
        Ok(processed)
    }
}

#[async_trait]
impl DialogHandler for DialogPipeline {
    async fn on_dialog_complete(&self, dialog: CompletedDialog) -> Result<()> {
        self.process(dialog).await.map(|_| ())
    }
}

/// Prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
