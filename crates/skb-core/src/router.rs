//! Entry point for transport events: access control, routing, and the
//! handler boundary where failures become an apology reply.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::aggregator::QuietPeriodAggregator;
use crate::collab::{CategoryInsert, Reply, SharedStore, SharedTransport};
use crate::desk::InteractionDesk;
use crate::format;
use crate::pending::Decision;
use crate::pipeline::DialogPipeline;
use crate::sync::{SyncCoordinator, SyncOutcome};
use crate::types::{BufferedMessage, Category, ConversationKey, SenderRole};

pub const REPLY_APOLOGY: &str = "❌ Что-то пошло не так. Попробуй ещё раз чуть позже.";
pub const REPLY_DENIED: &str = "⛔ Доступ запрещён.";

const HELP: &str = "👋 Я веду базу знаний поддержки.\n\n\
Пришли вопрос текстом, голосом или пересланным сообщением — найду похожие кейсы и предложу ответ.\n\n\
Команды:\n\
/stats — статистика базы\n\
/export — выгрузка базы\n\
/sync_now — синхронизировать с таблицей\n\
/add_category <имя> <описание> — новая категория\n\
/change <правило> — добавить правило и пересчитать базу\n\
/recalculate [категория] — пересчитать записи\n\
/cancel — отменить текущий запрос";

/// One inbound event from the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub key: ConversationKey,
    pub sender: i64,
    pub message_id: i64,
    pub sent_at: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    Message { text: String, forwarded: bool },
    Voice { audio: Vec<u8> },
    Command { name: String, args: String },
    Action { id: String },
    /// A message in the customer/support channel; feeds the aggregator.
    Privileged { text: String },
}

impl EventKind {
    fn operation(&self) -> &'static str {
        match self {
            EventKind::Message { .. } => "message",
            EventKind::Voice { .. } => "voice",
            EventKind::Command { .. } => "command",
            EventKind::Action { .. } => "action",
            EventKind::Privileged { .. } => "privileged",
        }
    }
}

/// `/name@bot args` → (`name`, `args`).
pub fn parse_command(text: &str) -> Option<(String, String)> {
    let rest = text.trim().strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, args.to_string()))
}

pub struct Router {
    operators: HashSet<i64>,
    aggregator: QuietPeriodAggregator,
    desk: Arc<InteractionDesk>,
    pipeline: Arc<DialogPipeline>,
    store: SharedStore,
    sync: Arc<SyncCoordinator>,
    transport: SharedTransport,
}

impl Router {
    pub fn new(
        operators: impl IntoIterator<Item = i64>,
        aggregator: QuietPeriodAggregator,
        desk: Arc<InteractionDesk>,
        pipeline: Arc<DialogPipeline>,
        store: SharedStore,
        sync: Arc<SyncCoordinator>,
        transport: SharedTransport,
    ) -> Self {
        let operators: HashSet<i64> = operators.into_iter().collect();
        if operators.is_empty() {
            warn!(target: "skb::desk", "operator allow-list is empty; every operator event will be refused");
        }
        Self {
            operators,
            aggregator,
            desk,
            pipeline,
            store,
            sync,
            transport,
        }
    }

    pub fn is_operator(&self, sender: i64) -> bool {
        self.operators.contains(&sender)
    }

    /// Handle one event and send its replies. Never fails: handler errors
    /// are logged and answered with an apology.
    pub async fn dispatch(&self, event: Event) {
        let key = event.key.clone();
        let operation = event.kind.operation();
        let replies = match self.handle(event).await {
            Ok(replies) => replies,
            Err(err) => {
                error!(
                    target: "skb::desk",
                    key = %key,
                    operation,
                    error = %format!("{err:#}"),
                    "handler failed"
                );
                vec![Reply::text(REPLY_APOLOGY)]
            }
        };
        for reply in replies {
            self.send(&key, reply).await;
        }
    }

    async fn send(&self, key: &ConversationKey, reply: Reply) {
        if let Err(err) = self.transport.reply(key, reply).await {
            warn!(target: "skb::desk", key = %key, error = %err, "reply not delivered");
        }
    }

    async fn handle(&self, event: Event) -> Result<Vec<Reply>> {
        let Event {
            key,
            sender,
            message_id,
            sent_at,
            kind,
        } = event;

        let kind = match kind {
            EventKind::Privileged { text } => {
                let role = if self.is_operator(sender) {
                    SenderRole::Responder
                } else {
                    SenderRole::Initiator
                };
                self.aggregator
                    .record(key, message_id, BufferedMessage::new(role, text, sent_at));
                return Ok(Vec::new());
            }
            other => other,
        };

        if !self.is_operator(sender) {
            info!(target: "skb::desk", key = %key, sender, "event from unknown sender refused");
            return Ok(vec![Reply::text(REPLY_DENIED)]);
        }

        match kind {
            EventKind::Message { text, forwarded } => {
                if let Some((name, args)) = parse_command(&text) {
                    return self.command(&key, &name, &args).await;
                }
                let reply = if forwarded {
                    self.desk.ask_forwarded(&key, &text).await?
                } else {
                    self.desk.follow_up(&key, &text).await?
                };
                Ok(vec![reply])
            }
            EventKind::Voice { audio } => self.desk.ask_voice(&key, &audio).await,
            EventKind::Command { name, args } => {
                let name = name.trim_start_matches('/').to_lowercase();
                self.command(&key, &name, &args).await
            }
            EventKind::Action { id } => match Decision::from_slug(&id) {
                Some(decision) => Ok(vec![self.desk.decide(&key, decision).await?]),
                None => {
                    warn!(target: "skb::desk", key = %key, action = %id, "unknown action");
                    Ok(vec![Reply::text(crate::desk::REPLY_EXPIRED)])
                }
            },
            EventKind::Privileged { .. } => Ok(Vec::new()),
        }
    }

    async fn command(&self, key: &ConversationKey, name: &str, args: &str) -> Result<Vec<Reply>> {
        info!(target: "skb::desk", key = %key, command = name, "command");
        let reply = match name {
            "start" | "help" => Reply::text(HELP),
            "stats" => {
                let stats = self.store.stats().await.context("load stats")?;
                Reply::text(format::stats(&stats, Utc::now()))
            }
            "export" => self.export().await?,
            "sync_now" => Reply::text(self.sync_now().await?),
            "add_category" => self.add_category(args).await?,
            "change" => return self.change(key, args).await,
            "recalculate" => {
                let filter = Some(args).filter(|a| !a.is_empty());
                return self.recalculate(key, filter).await;
            }
            "cancel" => self.desk.cancel(key).await,
            _ => Reply::text("Неизвестная команда. /start — список команд."),
        };
        Ok(vec![reply])
    }

    async fn export(&self) -> Result<Reply> {
        let records = self
            .store
            .list_records(None)
            .await
            .context("list records for export")?;
        if records.is_empty() {
            return Ok(Reply::text("База знаний пуста."));
        }
        let bytes = serde_json::to_vec_pretty(&records).context("serialize export")?;
        Ok(Reply::File {
            filename: format!("knowledge_base_{}.json", Utc::now().format("%Y%m%d_%H%M%S")),
            bytes,
        })
    }

    async fn sync_now(&self) -> Result<String> {
        let outcome = self.sync.sync_pending().await?;
        Ok(match outcome {
            SyncOutcome::Synced(n) => format!("✅ Синхронизировано записей: {n}"),
            SyncOutcome::NothingToSync => "Новых записей для синхронизации нет.".to_string(),
            SyncOutcome::Disabled => "⚠️ Синхронизация с таблицей не настроена.".to_string(),
            SyncOutcome::Busy => "⏳ Синхронизация уже идёт.".to_string(),
            SyncOutcome::Failed { attempts } => {
                format!("❌ Таблица недоступна после {attempts} попыток; повторю по расписанию.")
            }
        })
    }

    async fn add_category(&self, args: &str) -> Result<Reply> {
        let Some((name, description)) = args
            .split_once(char::is_whitespace)
            .map(|(n, d)| (n.trim(), d.trim()))
            .filter(|(n, d)| !n.is_empty() && !d.is_empty())
        else {
            return Ok(Reply::text(
                "Использование: /add_category <имя> <описание>",
            ));
        };
        let inserted = self
            .store
            .add_category(Category::new(name, description))
            .await
            .context("add category")?;
        Ok(match inserted {
            CategoryInsert::Added => Reply::text(format!("✅ Категория «{name}» добавлена.")),
            CategoryInsert::AlreadyExists => {
                Reply::text(format!("⚠️ Категория «{name}» уже существует."))
            }
        })
    }

    async fn change(&self, key: &ConversationKey, rule: &str) -> Result<Vec<Reply>> {
        if rule.is_empty() {
            return Ok(vec![Reply::text("Использование: /change <правило>")]);
        }
        self.store.add_rule(rule).await.context("add rule")?;
        self.send(key, Reply::text("📝 Правило добавлено. Пересчитываю базу…"))
            .await;
        self.recalculate(key, None).await
    }

    async fn recalculate(
        &self,
        key: &ConversationKey,
        category: Option<&str>,
    ) -> Result<Vec<Reply>> {
        // Progress is relayed in order and always ahead of the final reply.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(usize, usize)>();
        let recalculated = self.pipeline.recalculate(category, move |done, total| {
            let _ = progress_tx.send((done, total));
        });
        let relay = async {
            while let Some((done, total)) = progress_rx.recv().await {
                self.send(key, Reply::text(format!("⏳ Обработано {done}/{total}")))
                    .await;
            }
        };
        let (processed, ()) = tokio::join!(recalculated, relay);
        let processed = processed?;
        let text = if processed == 0 {
            "Нет записей для пересчёта.".to_string()
        } else {
            format!("✅ Пересчитано записей: {processed}")
        };
        Ok(vec![Reply::text(text)])
    }
}
