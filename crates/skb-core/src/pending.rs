//! Short-lived per-conversation record of a produced answer awaiting an
//! operator decision.
//!
//! Every read-modify-write goes through a [`PendingSlot`], which holds the
//! key's async mutex for as long as it lives; two events for the same key
//! (a button press racing a typed reply) are therefore applied one after the
//! other. Expiry is checked on read: a stale record is deleted by the read
//! that observes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::types::{ConversationKey, KnowledgeMatch};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PendingMode {
    /// A candidate answer was produced; waiting for approve / edit / skip.
    AwaitingDecision,
    /// Waiting for the operator to type the answer.
    AwaitingFreeformAnswer,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PendingInteraction {
    pub query: String,
    pub candidate: Option<String>,
    pub matches: Vec<KnowledgeMatch>,
    pub mode: PendingMode,
    pub created_at: DateTime<Utc>,
}

/// Payload for [`PendingSlot::set`]; the store stamps the creation time.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingDraft {
    pub query: String,
    pub candidate: Option<String>,
    pub matches: Vec<KnowledgeMatch>,
    pub mode: PendingMode,
}

impl PendingDraft {
    /// Mode follows from whether a candidate exists.
    pub fn for_query(
        query: impl Into<String>,
        candidate: Option<String>,
        matches: Vec<KnowledgeMatch>,
    ) -> Self {
        let mode = if candidate.is_some() {
            PendingMode::AwaitingDecision
        } else {
            PendingMode::AwaitingFreeformAnswer
        };
        Self {
            query: query.into(),
            candidate,
            matches,
            mode,
        }
    }
}

/// Operator decision attached to a produced answer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Edit,
    Skip,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Edit => "edit",
            Decision::Skip => "skip",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "ok" | "save" => Some(Decision::Approve),
            "edit" => Some(Decision::Edit),
            "skip" | "cancel" => Some(Decision::Skip),
            _ => None,
        }
    }
}

/// Inputs that move a pending record through its states.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingEvent {
    Decision(Decision),
    FollowUp(String),
    Cancel,
}

/// What the caller should do after [`PendingSlot::apply`].
#[derive(Clone, Debug, PartialEq)]
pub enum PendingOutcome {
    /// The interaction is finished with `answer`; the record has been removed.
    Resolved {
        interaction: PendingInteraction,
        answer: String,
    },
    /// The record now waits for a typed answer.
    AwaitingAnswer(PendingInteraction),
    /// Removed without effect.
    Cancelled,
    /// No live record (never set, already consumed, or expired).
    Absent,
    /// The event does not apply to the current state; the record is unchanged.
    Ignored(PendingMode),
}

struct Entry {
    record: PendingInteraction,
    stamped: Instant,
}

type Slot = Arc<AsyncMutex<Option<Entry>>>;

pub struct PendingStore {
    ttl: Duration,
    slots: Mutex<HashMap<ConversationKey, Slot>>,
}

impl PendingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to `key`'s record until the returned slot is dropped.
    pub async fn lock(&self, key: &ConversationKey) -> PendingSlot<'_> {
        let slot = {
            let mut slots = self.lock_slots();
            Arc::clone(slots.entry(key.clone()).or_default())
        };
        let guard = slot.lock_owned().await;
        PendingSlot {
            store: self,
            key: key.clone(),
            guard,
        }
    }

    pub async fn set(&self, key: &ConversationKey, draft: PendingDraft) {
        self.lock(key).await.set(draft);
    }

    pub async fn get(&self, key: &ConversationKey) -> Option<PendingInteraction> {
        self.lock(key).await.get().cloned()
    }

    pub async fn clear(&self, key: &ConversationKey) -> Option<PendingInteraction> {
        self.lock(key).await.clear()
    }

    /// Keys with a slot allocated, live or not yet observed as expired.
    pub fn tracked_keys(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct PendingSlot<'a> {
    store: &'a PendingStore,
    key: ConversationKey,
    guard: OwnedMutexGuard<Option<Entry>>,
}

impl PendingSlot<'_> {
    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    /// The live record, deleting it first if its TTL has elapsed.
    pub fn get(&mut self) -> Option<&PendingInteraction> {
        let expired = self
            .guard
            .as_ref()
            .is_some_and(|entry| entry.stamped.elapsed() > self.store.ttl);
        if expired {
            *self.guard = None;
            debug!(target: "skb::pending", key = %self.key, "pending interaction expired");
        }
        self.guard.as_ref().map(|entry| &entry.record)
    }

    /// Replace whatever is stored, wholesale.
    pub fn set(&mut self, draft: PendingDraft) {
        let mode = draft.mode;
        *self.guard = Some(Entry {
            record: PendingInteraction {
                query: draft.query,
                candidate: draft.candidate,
                matches: draft.matches,
                mode: draft.mode,
                created_at: Utc::now(),
            },
            stamped: Instant::now(),
        });
        debug!(target: "skb::pending", key = %self.key, ?mode, "pending interaction stored");
    }

    pub fn clear(&mut self) -> Option<PendingInteraction> {
        self.guard.take().map(|entry| entry.record)
    }

    /// Apply one event to the current state.
    pub fn apply(&mut self, event: PendingEvent) -> PendingOutcome {
        let Some(mode) = self.get().map(|record| record.mode) else {
            return PendingOutcome::Absent;
        };
        match (mode, event) {
            (_, PendingEvent::Cancel) | (_, PendingEvent::Decision(Decision::Skip)) => {
                self.clear();
                PendingOutcome::Cancelled
            }
            (PendingMode::AwaitingDecision, PendingEvent::Decision(Decision::Approve)) => {
                match self.clear() {
                    Some(interaction) => match interaction.candidate.clone() {
                        Some(answer) => PendingOutcome::Resolved {
                            interaction,
                            answer,
                        },
                        None => PendingOutcome::Absent,
                    },
                    None => PendingOutcome::Absent,
                }
            }
            (PendingMode::AwaitingDecision, PendingEvent::Decision(Decision::Edit)) => {
                let Some(current) = self.clear() else {
                    return PendingOutcome::Absent;
                };
                self.set(PendingDraft {
                    query: current.query,
                    candidate: current.candidate,
                    matches: current.matches,
                    mode: PendingMode::AwaitingFreeformAnswer,
                });
                match self.get() {
                    Some(record) => PendingOutcome::AwaitingAnswer(record.clone()),
                    None => PendingOutcome::Absent,
                }
            }
            (PendingMode::AwaitingFreeformAnswer, PendingEvent::FollowUp(text)) => {
                match self.clear() {
                    Some(interaction) => PendingOutcome::Resolved {
                        interaction,
                        answer: text,
                    },
                    None => PendingOutcome::Absent,
                }
            }
            (mode, _) => PendingOutcome::Ignored(mode),
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            return;
        }
        // Drop the empty slot unless another event is already queued on it:
        // the map and this guard are the only owners in that case.
        let mut slots = self.store.lock_slots();
        let slot = OwnedMutexGuard::mutex(&self.guard);
        let sole_owner = Arc::strong_count(slot) == 2;
        if sole_owner && slots.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(&self.key);
        }
    }
}
