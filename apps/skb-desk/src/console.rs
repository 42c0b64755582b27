//! Line-oriented transport: one JSON event per stdin line, one JSON reply
//! per stdout line.
//!
//! ```text
//! {"type":"business","chat":-100,"from":9000,"id":41,"text":"не работает оплата"}
//! {"type":"message","chat":7,"from":7,"text":"как сменить тариф"}
//! {"type":"action","chat":7,"from":7,"action":"approve"}
//! {"type":"command","chat":7,"from":7,"name":"stats"}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use skb_core::{ConversationKey, Event, EventKind, Reply, Transport};
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct ConsoleLine {
    chat: i64,
    from: i64,
    #[serde(default)]
    id: i64,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(flatten)]
    body: LineBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum LineBody {
    Message {
        text: String,
        #[serde(default)]
        forwarded: bool,
    },
    Voice {
        audio_b64: String,
    },
    Command {
        name: String,
        #[serde(default)]
        args: String,
    },
    Action {
        action: String,
    },
    /// Customer/support channel traffic.
    Business {
        text: String,
    },
}

pub fn parse_line(line: &str) -> Result<Event> {
    let parsed: ConsoleLine = serde_json::from_str(line).context("parse console event")?;
    let kind = match parsed.body {
        LineBody::Message { text, forwarded } => EventKind::Message { text, forwarded },
        LineBody::Voice { audio_b64 } => EventKind::Voice {
            audio: base64::engine::general_purpose::STANDARD
                .decode(audio_b64.trim())
                .context("decode voice payload")?,
        },
        LineBody::Command { name, args } => EventKind::Command { name, args },
        LineBody::Action { action } => EventKind::Action { id: action },
        LineBody::Business { text } => EventKind::Privileged { text },
    };
    Ok(Event {
        key: ConversationKey::from(parsed.chat),
        sender: parsed.from,
        message_id: parsed.id,
        sent_at: parsed.date.unwrap_or_else(Utc::now),
        kind,
    })
}

pub fn render_reply(key: &ConversationKey, reply: &Reply) -> Value {
    match reply {
        Reply::Text(text) => json!({"chat": key.as_str(), "text": text}),
        Reply::Choice { text, actions } => json!({
            "chat": key.as_str(),
            "text": text,
            "actions": actions
                .iter()
                .map(|(label, id)| json!({"label": label, "action": id}))
                .collect::<Vec<_>>(),
        }),
        Reply::File { filename, bytes } => json!({
            "chat": key.as_str(),
            "file": filename,
            "bytes_b64": base64::engine::general_purpose::STANDARD.encode(bytes),
        }),
    }
}

pub struct ConsoleTransport {
    out: Mutex<Stdout>,
}

impl ConsoleTransport {
    pub fn stdout() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn reply(&self, key: &ConversationKey, reply: Reply) -> Result<()> {
        let mut line = serde_json::to_vec(&render_reply(key, &reply))?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line).await.context("write reply")?;
        out.flush().await.context("flush reply")?;
        Ok(())
    }
}
