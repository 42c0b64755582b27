//! Per-conversation mailboxes in front of the [`Router`].
//!
//! Events for one key are handled strictly in submission order by a single
//! worker; different keys run concurrently. A worker exits once its mailbox
//! is empty, so idle conversations hold no task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::router::{Event, Router};
use crate::types::ConversationKey;

type Mailboxes = Mutex<HashMap<ConversationKey, UnboundedSender<Event>>>;

pub struct KeyedDispatcher {
    router: Arc<Router>,
    mailboxes: Arc<Mailboxes>,
    workers: TaskTracker,
}

impl KeyedDispatcher {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            mailboxes: Arc::new(Mutex::new(HashMap::new())),
            workers: TaskTracker::new(),
        }
    }

    /// Queue `event` behind every earlier event for the same key. Must run
    /// inside a tokio runtime.
    pub fn submit(&self, event: Event) {
        let mut mailboxes = lock(&self.mailboxes);
        let event = match mailboxes.get(&event.key) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // Worker gone without deregistering; start a fresh one.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let key = event.key.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        mailboxes.insert(key.clone(), tx);
        drop(mailboxes);

        debug!(target: "skb::desk", key = %key, "mailbox opened");
        self.workers.spawn(drain(
            key,
            rx,
            Arc::clone(&self.router),
            Arc::clone(&self.mailboxes),
        ));
    }

    /// Conversations with queued or running events.
    pub fn active_keys(&self) -> usize {
        lock(&self.mailboxes).len()
    }

    /// Workers still running.
    pub fn inflight(&self) -> usize {
        self.workers.len()
    }

    /// Stop counting new workers towards [`wait`](Self::wait).
    pub fn close(&self) {
        self.workers.close();
    }

    /// Resolves once closed and every worker has drained its mailbox.
    pub async fn wait(&self) {
        self.workers.wait().await;
    }
}

async fn drain(
    key: ConversationKey,
    mut rx: UnboundedReceiver<Event>,
    router: Arc<Router>,
    mailboxes: Arc<Mailboxes>,
) {
    loop {
        let event = match rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Empty) => {
                // Senders only push while holding the map lock, so an empty
                // queue observed under it stays empty until we deregister.
                let mut boxes = lock(&mailboxes);
                match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => {
                        boxes.remove(&key);
                        debug!(target: "skb::desk", key = %key, "mailbox drained");
                        return;
                    }
                }
            }
            Err(TryRecvError::Disconnected) => return,
        };
        router.dispatch(event).await;
    }
}

fn lock(
    mailboxes: &Mailboxes,
) -> std::sync::MutexGuard<'_, HashMap<ConversationKey, UnboundedSender<Event>>> {
    mailboxes
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
