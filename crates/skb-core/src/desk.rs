//! Operator query side: search the knowledge base, draft an answer, and
//! carry the draft through approve / edit / skip.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::collab::{AnswerOptions, Reply, SharedAnalysis, SharedStore};
use crate::format;
use crate::pending::{
    Decision, PendingDraft, PendingEvent, PendingMode, PendingOutcome, PendingSlot, PendingStore,
};
use crate::pipeline::{truncate_chars, DialogPipeline};
use crate::types::{render_transcript, BufferedMessage, ConversationKey, SenderRole};

pub const ACTION_APPROVE: &str = "approve";
pub const ACTION_EDIT: &str = "edit";
pub const ACTION_SKIP: &str = "skip";

pub const REPLY_EXPIRED: &str = "⌛ Запрос устарел или уже обработан. Отправь вопрос заново.";

pub fn decision_actions() -> Vec<(String, String)> {
    vec![
        ("✅ Сохранить".to_string(), ACTION_APPROVE.to_string()),
        ("✏️ Исправить".to_string(), ACTION_EDIT.to_string()),
        ("⏭ Пропустить".to_string(), ACTION_SKIP.to_string()),
    ]
}

pub struct InteractionDesk {
    analysis: SharedAnalysis,
    store: SharedStore,
    pipeline: Arc<DialogPipeline>,
    pending: Arc<PendingStore>,
    match_count: usize,
    query_max_chars: usize,
    answer_options: AnswerOptions,
}

impl InteractionDesk {
    pub fn new(
        analysis: SharedAnalysis,
        store: SharedStore,
        pipeline: Arc<DialogPipeline>,
        pending: Arc<PendingStore>,
        match_count: usize,
        query_max_chars: usize,
    ) -> Self {
        Self {
            analysis,
            store,
            pipeline,
            pending,
            match_count: match_count.max(1),
            query_max_chars: query_max_chars.max(1),
            answer_options: AnswerOptions::default(),
        }
    }

    pub fn with_answer_options(mut self, options: AnswerOptions) -> Self {
        self.answer_options = options;
        self
    }

    pub fn pending(&self) -> &Arc<PendingStore> {
        &self.pending
    }

    /// Start a new interaction for `query`; any earlier one for the key is dropped.
    pub async fn ask(&self, key: &ConversationKey, query: &str) -> Result<Reply> {
        let mut slot = self.pending.lock(key).await;
        self.ask_locked(&mut slot, query).await
    }

    async fn ask_locked(&self, slot: &mut PendingSlot<'_>, query: &str) -> Result<Reply> {
        if let Some(previous) = slot.clear() {
            debug!(
                target: "skb::desk",
                key = %slot.key(),
                mode = ?previous.mode,
                "replacing outstanding interaction"
            );
        }
        let query = query.trim();
        if query.is_empty() {
            return Ok(Reply::text("Пришли текст вопроса."));
        }

        let embedding = self
            .analysis
            .embed(truncate_chars(query, self.query_max_chars))
            .await
            .context("embed query")?;
        let matches = self
            .store
            .similarity_search(&embedding, self.match_count, None)
            .await
            .context("search similar cases")?;
        if matches.is_empty() {
            info!(target: "skb::desk", key = %slot.key(), "no similar cases");
            return Ok(Reply::text(format::search_results(&[], None)));
        }

        let candidate = self
            .analysis
            .answer(query, &matches, &self.answer_options)
            .await
            .context("draft answer")?
            .filter(|answer| !answer.trim().is_empty());
        let text = format::search_results(&matches, candidate.as_deref());
        let has_candidate = candidate.is_some();
        info!(
            target: "skb::desk",
            key = %slot.key(),
            matches = matches.len(),
            has_candidate,
            "query answered"
        );
        slot.set(PendingDraft::for_query(query, candidate, matches));
        Ok(if has_candidate {
            Reply::Choice {
                text,
                actions: decision_actions(),
            }
        } else {
            Reply::Text(text)
        })
    }

    /// Transcribe a voice message and treat the text as a query.
    pub async fn ask_voice(&self, key: &ConversationKey, audio: &[u8]) -> Result<Vec<Reply>> {
        let text = self
            .analysis
            .transcribe_audio(audio)
            .await
            .context("transcribe voice message")?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(vec![Reply::text("Не удалось распознать голосовое сообщение.")]);
        }
        let heard = Reply::text(format!("🎤 Распознано: \"{text}\""));
        let answer = self.ask(key, text).await?;
        Ok(vec![heard, answer])
    }

    /// A message forwarded from a customer is queried on its text.
    pub async fn ask_forwarded(&self, key: &ConversationKey, text: &str) -> Result<Reply> {
        self.ask(key, text).await
    }

    pub async fn decide(&self, key: &ConversationKey, decision: Decision) -> Result<Reply> {
        let outcome = self
            .pending
            .lock(key)
            .await
            .apply(PendingEvent::Decision(decision));
        debug!(target: "skb::desk", key = %key, decision = decision.as_str(), "decision applied");
        match outcome {
            PendingOutcome::Resolved {
                interaction,
                answer,
            } => self.persist_answer(key, &interaction.query, &answer).await,
            PendingOutcome::AwaitingAnswer(_) => Ok(Reply::text(
                "✏️ Напиши свой вариант ответа следующим сообщением.",
            )),
            PendingOutcome::Cancelled => Ok(Reply::text("⏭ Пропущено, в базу не сохранено.")),
            PendingOutcome::Absent => Ok(Reply::text(REPLY_EXPIRED)),
            PendingOutcome::Ignored(PendingMode::AwaitingFreeformAnswer) => Ok(Reply::text(
                "Жду текст ответа. Напиши его или отправь /cancel.",
            )),
            PendingOutcome::Ignored(PendingMode::AwaitingDecision) => {
                Ok(Reply::text("Выбери действие кнопками под ответом."))
            }
        }
    }

    /// A plain operator message: the typed answer while one is awaited,
    /// otherwise a new query.
    pub async fn follow_up(&self, key: &ConversationKey, text: &str) -> Result<Reply> {
        let mut slot = self.pending.lock(key).await;
        let awaiting_answer =
            slot.get().map(|record| record.mode) == Some(PendingMode::AwaitingFreeformAnswer);
        if !awaiting_answer {
            return self.ask_locked(&mut slot, text).await;
        }
        let outcome = slot.apply(PendingEvent::FollowUp(text.trim().to_string()));
        drop(slot);
        match outcome {
            PendingOutcome::Resolved {
                interaction,
                answer,
            } => self.persist_answer(key, &interaction.query, &answer).await,
            _ => Ok(Reply::text(REPLY_EXPIRED)),
        }
    }

    pub async fn cancel(&self, key: &ConversationKey) -> Reply {
        match self.pending.lock(key).await.apply(PendingEvent::Cancel) {
            PendingOutcome::Cancelled => Reply::text("Отменено."),
            _ => Reply::text("Нечего отменять."),
        }
    }

    /// Store `[USER]: query / [SUPPORT]: answer` as a new knowledge record.
    pub async fn persist_answer(
        &self,
        key: &ConversationKey,
        query: &str,
        answer: &str,
    ) -> Result<Reply> {
        let now = chrono::Utc::now();
        let transcript = render_transcript(&[
            BufferedMessage::new(SenderRole::Initiator, query, now),
            BufferedMessage::new(SenderRole::Responder, answer, now),
        ]);
        let id = self
            .pipeline
            .ingest(key, None, &transcript)
            .await
            .context("persist operator answer")?;
        info!(target: "skb::desk", key = %key, id, "answer saved");
        Ok(Reply::text(format!("✅ Сохранено в базу знаний (#{id}).")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_map_to_decisions() {
        for (_, action) in decision_actions() {
            assert!(Decision::from_slug(&action).is_some(), "{action}");
        }
    }
}
