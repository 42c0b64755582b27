//! Operator-facing reply texts.

use chrono::{DateTime, Utc};

use crate::types::{KnowledgeMatch, StoreStats};

/// Upper bound the chat transport accepts for one message.
pub const MAX_REPLY_CHARS: usize = 4096;

pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.is_empty() {
        return "N/A".to_string();
    }
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_matches(matches: &[KnowledgeMatch]) -> Self {
        if matches.is_empty() {
            return Confidence::Low;
        }
        let avg = matches.iter().map(|m| m.similarity).sum::<f32>() / matches.len() as f32;
        if avg > 0.7 {
            Confidence::High
        } else if avg > 0.5 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Confidence::High => "высокая",
            Confidence::Medium => "средняя",
            Confidence::Low => "низкая",
        }
    }
}

pub fn search_results(matches: &[KnowledgeMatch], candidate: Option<&str>) -> String {
    if matches.is_empty() {
        return "⚠️ В базе знаний пока нет похожих кейсов.".to_string();
    }
    let mut text = format!("🔍 Найдено похожих кейсов: {}\n\n", matches.len());
    for (i, m) in matches.iter().enumerate() {
        let pct = (m.similarity * 100.0).round() as i64;
        text.push_str(&format!("{}. [{}% совпадение]\n", i + 1, pct));
        text.push_str(&format!(
            "   Проблема: {}\n",
            truncate_with_ellipsis(&m.problem, 300)
        ));
        text.push_str(&format!(
            "   Решение: {}\n",
            truncate_with_ellipsis(&m.solution, 300)
        ));
        text.push_str(&format!("   Категория: {}\n\n", m.category));
    }
    match candidate {
        Some(answer) => {
            let confidence = Confidence::from_matches(matches);
            text.push_str(&format!(
                "💡 Рекомендуемый ответ (уверенность: {}):\n\"{}\"",
                confidence.label(),
                answer
            ));
        }
        None => text.push_str("✍️ Готового ответа нет — напиши свой, я сохраню его в базу."),
    }
    if text.chars().count() > MAX_REPLY_CHARS {
        text = truncate_with_ellipsis(&text, MAX_REPLY_CHARS);
    }
    text
}

pub fn stats(stats: &StoreStats, now: DateTime<Utc>) -> String {
    let mut text = String::from("📊 Статистика базы знаний:\n\n");
    text.push_str(&format!("Всего диалогов: {}\n", stats.total));
    text.push_str("По категориям:\n");
    for entry in &stats.by_category {
        text.push_str(&format!("  • {}: {}\n", entry.category, entry.count));
    }
    match stats.last_sync {
        Some(at) => {
            let ago = (now - at).num_minutes().max(0);
            text.push_str(&format!("\nПоследняя синхронизация: {ago} мин назад"));
        }
        None => text.push_str("\nСинхронизация с таблицей: не выполнялась"),
    }
    text
}
