//! Quiet-period aggregation of conversation messages.
//!
//! Every conversation key owns at most one open session. Each recorded
//! message re-arms the session's single deadline; when a deadline elapses
//! with no newer message the session is removed and handed to the
//! [`DialogHandler`] as one [`CompletedDialog`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::types::{render_transcript, BufferedMessage, CompletedDialog, ConversationKey};

/// Receives each completed session exactly once.
///
/// Errors are logged by the aggregator and the session is discarded anyway;
/// there is no retry and the raw transcript is not kept.
#[async_trait]
pub trait DialogHandler: Send + Sync {
    async fn on_dialog_complete(&self, dialog: CompletedDialog) -> anyhow::Result<()>;
}

struct Session {
    first_message_id: i64,
    messages: Vec<BufferedMessage>,
    /// Bumped on every message; a deadline only completes the session it was armed for.
    generation: u64,
    deadline: JoinHandle<()>,
}

struct Inner {
    quiet_period: Duration,
    sessions: Mutex<HashMap<ConversationKey, Session>>,
    handler: Arc<dyn DialogHandler>,
    callbacks: TaskTracker,
    generations: AtomicU64,
}

/// Result of a bounded flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: usize,
    /// Callbacks still running when the grace period ran out.
    pub timed_out: bool,
}

#[derive(Clone)]
pub struct QuietPeriodAggregator {
    inner: Arc<Inner>,
}

impl QuietPeriodAggregator {
    pub fn new(quiet_period: Duration, handler: Arc<dyn DialogHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                quiet_period,
                sessions: Mutex::new(HashMap::new()),
                handler,
                callbacks: TaskTracker::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.inner.quiet_period
    }

    /// Append `message` to the key's session, opening one if needed, and push
    /// its deadline out to now + quiet period. Must run inside a tokio runtime.
    pub fn record(&self, key: ConversationKey, message_id: i64, message: BufferedMessage) {
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sessions = self.inner.lock_sessions();
        let role = message.role;
        let count = match sessions.get_mut(&key) {
            Some(session) => {
                session.deadline.abort();
                session.messages.push(message);
                session.generation = generation;
                session.deadline = self.arm_deadline(key.clone(), generation);
                session.messages.len()
            }
            None => {
                let deadline = self.arm_deadline(key.clone(), generation);
                sessions.insert(
                    key.clone(),
                    Session {
                        first_message_id: message_id,
                        messages: vec![message],
                        generation,
                        deadline,
                    },
                );
                1
            }
        };
        drop(sessions);
        info!(
            target: "skb::aggregator",
            key = %key,
            sender = role.tag(),
            messages = count,
            "message buffered"
        );
    }

    fn arm_deadline(&self, key: ConversationKey, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let quiet_period = self.inner.quiet_period;
        tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;
            if let Some(inner) = weak.upgrade() {
                inner.complete_if_current(&key, generation);
            }
        })
    }

    /// Complete every open session now and wait for all completion callbacks
    /// (including ones already started by elapsed deadlines) to finish.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(ConversationKey, Session)> = {
            let mut sessions = self.inner.lock_sessions();
            sessions.drain().collect()
        };
        let flushed = drained.len();
        for (key, session) in drained {
            session.deadline.abort();
            self.inner.dispatch(key, session);
        }
        info!(target: "skb::aggregator", flushed, "flushed open dialogs");
        // Closed only changes wait(): it resolves once no callback is in flight.
        self.inner.callbacks.close();
        self.inner.callbacks.wait().await;
        flushed
    }

    /// [`flush_all`](Self::flush_all) bounded by `grace`.
    pub async fn flush_all_with_grace(&self, grace: Duration) -> FlushReport {
        let pending = self.pending_count();
        match tokio::time::timeout(grace, self.flush_all()).await {
            Ok(flushed) => FlushReport {
                flushed,
                timed_out: false,
            },
            Err(_) => {
                warn!(
                    target: "skb::aggregator",
                    grace_ms = grace.as_millis() as u64,
                    inflight = self.inner.callbacks.len(),
                    "dialog callbacks still running after grace period"
                );
                FlushReport {
                    flushed: pending,
                    timed_out: true,
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    pub fn is_open(&self, key: &ConversationKey) -> bool {
        self.inner.lock_sessions().contains_key(key)
    }
}

impl Inner {
    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete_if_current(&self, key: &ConversationKey, generation: u64) {
        let session = {
            let mut sessions = self.lock_sessions();
            let current = sessions
                .get(key)
                .is_some_and(|session| session.generation == generation);
            if current {
                sessions.remove(key)
            } else {
                None
            }
        };
        match session {
            Some(session) => self.dispatch(key.clone(), session),
            None => debug!(target: "skb::aggregator", key = %key, "stale deadline ignored"),
        }
    }

    fn dispatch(&self, key: ConversationKey, session: Session) {
        let dialog = CompletedDialog {
            transcript: render_transcript(&session.messages),
            message_count: session.messages.len(),
            first_message_id: session.first_message_id,
            key,
        };
        info!(
            target: "skb::aggregator",
            key = %dialog.key,
            messages = dialog.message_count,
            first_message_id = dialog.first_message_id,
            "dialog complete"
        );
        let handler = Arc::clone(&self.handler);
        self.callbacks.spawn(async move {
            let key = dialog.key.clone();
            let messages = dialog.message_count;
            if let Err(err) = handler.on_dialog_complete(dialog).await {
                error!(
                    target: "skb::aggregator",
                    key = %key,
                    messages,
                    error = %err,
                    "dialog handler failed; transcript discarded"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SenderRole;
    use chrono::Utc;
    use tokio::time::{sleep, Instant};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(CompletedDialog, Instant)>>,
        fail: bool,
    }

    impl Recorder {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn dialogs(&self) -> Vec<(CompletedDialog, Instant)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DialogHandler for Recorder {
        async fn on_dialog_complete(&self, dialog: CompletedDialog) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push((dialog, Instant::now()));
            if self.fail {
                anyhow::bail!("classification unavailable");
            }
            Ok(())
        }
    }

    fn msg(role: SenderRole, text: &str) -> BufferedMessage {
        BufferedMessage::new(role, text, Utc::now())
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn aggregator(recorder: &Arc<Recorder>) -> QuietPeriodAggregator {
        QuietPeriodAggregator::new(Duration::from_secs(300), recorder.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn burst_completes_once_after_last_message() {
        let recorder = Arc::new(Recorder::default());
        let agg = aggregator(&recorder);
        let key = ConversationKey::from(77_i64);
        let start = Instant::now();

        agg.record(key.clone(), 10, msg(SenderRole::Initiator, "M1"));
        sleep(Duration::from_secs(200)).await;
        agg.record(key.clone(), 11, msg(SenderRole::Responder, "M2"));

        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(agg.is_open(&key), "session still open at t=201s");
        assert!(recorder.dialogs().is_empty());

        sleep(Duration::from_secs(298)).await;
        settle().await;
        assert!(recorder.dialogs().is_empty(), "nothing before t=500s");

        sleep(Duration::from_secs(2)).await;
        settle().await;
        let dialogs = recorder.dialogs();
        assert_eq!(dialogs.len(), 1);
        let (dialog, fired_at) = &dialogs[0];
        assert_eq!(*fired_at - start, Duration::from_secs(500));
        assert_eq!(dialog.message_count, 2);
        assert_eq!(dialog.first_message_id, 10);
        assert_eq!(dialog.transcript, "[USER]: M1\n[SUPPORT]: M2");
        assert_eq!(agg.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_gap_yields_two_independent_dialogs() {
        let recorder = Arc::new(Recorder::default());
        let agg = aggregator(&recorder);
        let key = ConversationKey::from("chat-1");

        agg.record(key.clone(), 1, msg(SenderRole::Initiator, "first"));
        sleep(Duration::from_secs(301)).await;
        settle().await;
        agg.record(key.clone(), 2, msg(SenderRole::Initiator, "second"));
        sleep(Duration::from_secs(301)).await;
        settle().await;

        let dialogs = recorder.dialogs();
        assert_eq!(dialogs.len(), 2);
        assert_eq!(dialogs[0].0.first_message_id, 1);
        assert_eq!(dialogs[0].0.transcript, "[USER]: first");
        assert_eq!(dialogs[1].0.first_message_id, 2);
        assert_eq!(dialogs[1].0.transcript, "[USER]: second");
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let recorder = Arc::new(Recorder::default());
        let agg = aggregator(&recorder);

        agg.record("a".into(), 1, msg(SenderRole::Initiator, "a1"));
        sleep(Duration::from_secs(100)).await;
        agg.record("b".into(), 2, msg(SenderRole::Initiator, "b1"));
        sleep(Duration::from_secs(201)).await;
        settle().await;

        let dialogs = recorder.dialogs();
        assert_eq!(dialogs.len(), 1);
        assert_eq!(dialogs[0].0.key.as_str(), "a");
        assert!(agg.is_open(&"b".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_completes_every_open_session() {
        let recorder = Arc::new(Recorder::default());
        let agg = aggregator(&recorder);
        for n in 0..4_i64 {
            agg.record(n.into(), n * 10, msg(SenderRole::Initiator, "hi"));
        }
        assert_eq!(agg.pending_count(), 4);

        assert_eq!(agg.flush_all().await, 4);
        assert_eq!(recorder.dialogs().len(), 4);
        assert_eq!(agg.pending_count(), 0);

        // Cancelled deadlines must not fire a second completion.
        sleep(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(recorder.dialogs().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_discards_session_and_keeps_running() {
        let recorder = Arc::new(Recorder::failing());
        let agg = aggregator(&recorder);
        let key = ConversationKey::from(5_i64);

        agg.record(key.clone(), 1, msg(SenderRole::Initiator, "lost"));
        sleep(Duration::from_secs(301)).await;
        settle().await;
        assert_eq!(recorder.dialogs().len(), 1);
        assert!(!agg.is_open(&key));

        agg.record(key.clone(), 2, msg(SenderRole::Initiator, "fresh"));
        assert!(agg.is_open(&key));
        sleep(Duration::from_secs(301)).await;
        settle().await;
        assert_eq!(recorder.dialogs().len(), 2);
        assert_eq!(recorder.dialogs()[1].0.first_message_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_deadline_is_a_noop() {
        let recorder = Arc::new(Recorder::default());
        let agg = aggregator(&recorder);
        let key = ConversationKey::from(9_i64);
        agg.record(key.clone(), 1, msg(SenderRole::Initiator, "x"));
        agg.inner.complete_if_current(&key, 0);
        assert!(agg.is_open(&key));
        agg.flush_all().await;
        agg.inner.complete_if_current(&key, 1);
        assert_eq!(recorder.dialogs().len(), 1);
    }

    struct SlowHandler;

    #[async_trait]
    impl DialogHandler for SlowHandler {
        async fn on_dialog_complete(&self, _dialog: CompletedDialog) -> anyhow::Result<()> {
            sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_bounds_flush() {
        let agg = QuietPeriodAggregator::new(Duration::from_secs(300), Arc::new(SlowHandler));
        agg.record("slow".into(), 1, msg(SenderRole::Initiator, "x"));
        let report = agg.flush_all_with_grace(Duration::from_secs(5)).await;
        assert!(report.timed_out);
        assert_eq!(report.flushed, 1);
        assert_eq!(agg.pending_count(), 0);
    }
}
