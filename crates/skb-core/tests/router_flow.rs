mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use common::{categories, FakeAnalysis, RecordingTransport, ScriptedSink};
use skb_core::router::{REPLY_APOLOGY, REPLY_DENIED};
use skb_core::{
    ConversationKey, DialogPipeline, DurableStore, Event, EventKind, InMemoryStore,
    InteractionDesk, KeyedDispatcher, PendingStore, QuietPeriodAggregator, Reply, RetryPolicy, Router, SharedSink,
    SyncCoordinator,
};

const OPERATOR: i64 = 7;
const CUSTOMER: i64 = 9000;

struct Harness {
    analysis: Arc<FakeAnalysis>,
    store: Arc<InMemoryStore>,
    transport: Arc<RecordingTransport>,
    aggregator: QuietPeriodAggregator,
    router: Arc<Router>,
}

fn harness(sink: Option<SharedSink>) -> Harness {
    let analysis = Arc::new(FakeAnalysis::new("прочее"));
    let store = Arc::new(InMemoryStore::with_categories(categories()));
    let transport = Arc::new(RecordingTransport::default());
    let pipeline = Arc::new(DialogPipeline::new(
        analysis.clone(),
        store.clone(),
        "прочее",
        14_000,
    ));
    let aggregator = QuietPeriodAggregator::new(Duration::from_secs(300), pipeline.clone());
    let desk = Arc::new(InteractionDesk::new(
        analysis.clone(),
        store.clone(),
        pipeline.clone(),
        Arc::new(PendingStore::new(Duration::from_secs(600))),
        3,
        14_000,
    ));
    let sync = Arc::new(SyncCoordinator::new(
        store.clone(),
        sink,
        RetryPolicy::fixed(3, Duration::from_millis(10)),
    ));
    let router = Arc::new(Router::new(
        [OPERATOR],
        aggregator.clone(),
        desk,
        pipeline,
        store.clone(),
        sync,
        transport.clone(),
    ));
    Harness {
        analysis,
        store,
        transport,
        aggregator,
        router,
    }
}

fn event(sender: i64, message_id: i64, kind: EventKind) -> Event {
    Event {
        key: ConversationKey::from(-100_i64),
        sender,
        message_id,
        sent_at: Utc::now(),
        kind,
    }
}

fn text(sender: i64, body: &str) -> Event {
    event(
        sender,
        1,
        EventKind::Message {
            text: body.to_string(),
            forwarded: false,
        },
    )
}

#[tokio::test]
async fn unknown_sender_is_refused() {
    let h = harness(None);
    h.router.dispatch(text(CUSTOMER, "/stats")).await;
    assert_eq!(h.transport.bodies(), vec![REPLY_DENIED.to_string()]);
}

#[tokio::test]
async fn privileged_channel_feeds_the_aggregator_with_roles() -> Result<()> {
    let h = harness(None);
    h.router
        .dispatch(event(
            CUSTOMER,
            41,
            EventKind::Privileged {
                text: "не работает оплата".into(),
            },
        ))
        .await;
    h.router
        .dispatch(event(
            OPERATOR,
            42,
            EventKind::Privileged {
                text: "проверьте карту".into(),
            },
        ))
        .await;
    assert!(h.transport.bodies().is_empty());
    assert!(h.aggregator.is_open(&ConversationKey::from(-100_i64)));

    assert_eq!(h.aggregator.flush_all().await, 1);
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_message_id, Some(41));
    assert_eq!(
        records[0].transcript,
        "[USER]: не работает оплата\n[SUPPORT]: проверьте карту"
    );
    Ok(())
}

#[tokio::test]
async fn query_then_button_saves_the_answer() -> Result<()> {
    let h = harness(None);
    h.router
        .dispatch(event(
            OPERATOR,
            2,
            EventKind::Privileged {
                text: "как поменять тариф".into(),
            },
        ))
        .await;
    h.aggregator.flush_all().await;

    h.router.dispatch(text(OPERATOR, "смена тарифа")).await;
    let replies = h.transport.replies();
    assert!(matches!(replies.last(), Some(Reply::Choice { .. })));

    h.router
        .dispatch(event(OPERATOR, 3, EventKind::Action { id: "approve".into() }))
        .await;
    assert!(h
        .transport
        .bodies()
        .last()
        .is_some_and(|b| b.contains("Сохранено")));
    assert_eq!(h.store.records().len(), 2);
    Ok(())
}

#[tokio::test]
async fn handler_failure_becomes_an_apology() {
    let h = harness(None);
    h.analysis.unavailable.store(true, Ordering::SeqCst);
    h.router.dispatch(text(OPERATOR, "что-то сломалось")).await;
    assert_eq!(h.transport.bodies(), vec![REPLY_APOLOGY.to_string()]);
}

#[tokio::test]
async fn add_category_reports_duplicates() -> Result<()> {
    let h = harness(None);
    h.router
        .dispatch(text(OPERATOR, "/add_category оплата Вопросы по оплате"))
        .await;
    h.router
        .dispatch(text(OPERATOR, "/add_category оплата Вопросы по оплате"))
        .await;
    h.router.dispatch(text(OPERATOR, "/add_category оплата")).await;
    let bodies = h.transport.bodies();
    assert!(bodies[0].contains("добавлена"));
    assert!(bodies[1].contains("уже существует"));
    assert!(bodies[2].starts_with("Использование"));
    assert!(h
        .store
        .list_categories()
        .await?
        .iter()
        .any(|c| c.name == "оплата"));
    Ok(())
}

#[tokio::test]
async fn sync_now_reports_outcome() -> Result<()> {
    let disabled = harness(None);
    disabled.router.dispatch(text(OPERATOR, "/sync_now")).await;
    assert!(disabled.transport.bodies()[0].contains("не настроена"));

    let sink = Arc::new(ScriptedSink::default());
    let h = harness(Some(sink.clone() as SharedSink));
    h.router
        .dispatch(event(
            CUSTOMER,
            5,
            EventKind::Privileged {
                text: "вопрос".into(),
            },
        ))
        .await;
    h.aggregator.flush_all().await;
    h.router
        .dispatch(event(
            OPERATOR,
            6,
            EventKind::Command {
                name: "sync_now".into(),
                args: String::new(),
            },
        ))
        .await;
    assert!(h.transport.bodies()[0].contains("Синхронизировано записей: 1"));
    assert_eq!(sink.delivered_rows().len(), 1);
    assert!(h.store.query_unsynced().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn change_adds_rule_and_recalculates() -> Result<()> {
    let h = harness(None);
    h.router
        .dispatch(event(
            CUSTOMER,
            8,
            EventKind::Privileged {
                text: "кнопка не работает".into(),
            },
        ))
        .await;
    h.aggregator.flush_all().await;

    h.analysis.set_category("баги_фронтенд");
    h.router
        .dispatch(text(OPERATOR, "/change кнопки относятся к фронтенду"))
        .await;

    assert_eq!(
        h.store.list_rules().await?,
        vec!["кнопки относятся к фронтенду".to_string()]
    );
    assert_eq!(h.store.records()[0].category, "баги_фронтенд");
    let bodies = h.transport.bodies();
    assert!(bodies[0].contains("Правило добавлено"));
    assert!(bodies.last().is_some_and(|b| b.contains("Пересчитано записей: 1")));
    Ok(())
}

#[tokio::test]
async fn stats_and_export() -> Result<()> {
    let h = harness(None);
    h.router.dispatch(text(OPERATOR, "/export")).await;
    assert_eq!(h.transport.bodies()[0], "База знаний пуста.");
    h.transport.clear();

    h.router
        .dispatch(event(
            CUSTOMER,
            3,
            EventKind::Privileged {
                text: "вопрос".into(),
            },
        ))
        .await;
    h.aggregator.flush_all().await;

    h.router.dispatch(text(OPERATOR, "/stats")).await;
    h.router.dispatch(text(OPERATOR, "/export")).await;
    let replies = h.transport.replies();
    assert!(replies[0].body().contains("Всего диалогов: 1"));
    match &replies[1] {
        Reply::File { filename, bytes } => {
            assert!(filename.ends_with(".json"));
            let exported: serde_json::Value = serde_json::from_slice(bytes)?;
            assert_eq!(exported.as_array().map(Vec::len), Some(1));
            assert!(exported[0].get("embedding").is_none());
        }
        other => panic!("expected a file, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn unknown_action_and_command() {
    let h = harness(None);
    h.router
        .dispatch(event(OPERATOR, 1, EventKind::Action { id: "later".into() }))
        .await;
    h.router.dispatch(text(OPERATOR, "/frobnicate")).await;
    let bodies = h.transport.bodies();
    assert!(bodies[0].contains("устарел"));
    assert!(bodies[1].contains("Неизвестная команда"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_events_keep_arrival_order_per_conversation() {
    let h = harness(None);
    let dispatcher = KeyedDispatcher::new(h.router.clone());
    let mut expected = Vec::new();
    for i in 0..200_i64 {
        let (sender, tag) = if i % 3 == 0 {
            (OPERATOR, "SUPPORT")
        } else {
            (CUSTOMER, "USER")
        };
        expected.push(format!("[{tag}]: m{i}"));
        dispatcher.submit(event(
            sender,
            i,
            EventKind::Privileged {
                text: format!("m{i}"),
            },
        ));
    }
    dispatcher.close();
    dispatcher.wait().await;
    assert_eq!(dispatcher.active_keys(), 0);

    assert_eq!(h.aggregator.flush_all().await, 1);
    let records = h.store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source_message_id, Some(0));
    assert_eq!(records[0].transcript, expected.join("\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typed_answer_after_edit_resolves_in_order() {
    let h = harness(None);
    h.router
        .dispatch(event(
            CUSTOMER,
            1,
            EventKind::Privileged {
                text: "не приходит код".into(),
            },
        ))
        .await;
    h.aggregator.flush_all().await;

    let dispatcher = KeyedDispatcher::new(h.router.clone());
    dispatcher.submit(text(OPERATOR, "код не приходит"));
    dispatcher.submit(event(OPERATOR, 2, EventKind::Action { id: "edit".into() }));
    dispatcher.submit(text(OPERATOR, "Проверьте папку спам"));
    dispatcher.close();
    dispatcher.wait().await;

    let bodies = h.transport.bodies();
    assert_eq!(bodies.len(), 3, "{bodies:?}");
    assert!(bodies[1].contains("Напиши свой вариант"));
    assert!(bodies[2].contains("Сохранено"));
    let records = h.store.records();
    assert_eq!(records.len(), 2);
    assert_eq!(
        records[1].transcript,
        "[USER]: код не приходит\n[SUPPORT]: Проверьте папку спам"
    );
}

#[tokio::test]
async fn recalculation_progress_precedes_the_summary() -> Result<()> {
    let h = harness(None);
    for chat in 0..12_i64 {
        h.router
            .dispatch(Event {
                key: ConversationKey::from(chat),
                sender: CUSTOMER,
                message_id: chat,
                sent_at: Utc::now(),
                kind: EventKind::Privileged {
                    text: format!("вопрос {chat}"),
                },
            })
            .await;
    }
    assert_eq!(h.aggregator.flush_all().await, 12);

    h.router.dispatch(text(OPERATOR, "/recalculate")).await;
    assert_eq!(
        h.transport.bodies(),
        vec![
            "⏳ Обработано 10/12".to_string(),
            "✅ Пересчитано записей: 12".to_string(),
        ]
    );
    Ok(())
}
