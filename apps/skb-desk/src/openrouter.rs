//! OpenRouter-compatible chat-completions and embeddings client.

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{json, Value};
use skb_core::{
    AnalysisConfig, AnalysisService, AnswerOptions, Category, Classification, KnowledgeMatch,
    ServiceError, ServiceResult,
};
use tracing::{debug, info};

use crate::http_client;

const SERVICE: &str = "analysis";

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    chat_model: String,
    embedding_model: String,
}

impl OpenRouterClient {
    pub fn new(http: reqwest::Client, config: &AnalysisConfig) -> Self {
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            chat_model: config.chat_model.clone(),
            embedding_model: config.embedding_model.clone(),
        }
    }

    fn key(&self) -> ServiceResult<&str> {
        self.api_key
            .as_deref()
            .ok_or(ServiceError::NotConfigured("analysis api key"))
    }

    async fn chat(&self, content: Value, temperature: f32, max_tokens: u32) -> ServiceResult<String> {
        let key = self.key()?;
        let body = json!({
            "model": self.chat_model,
            "messages": [{"role": "user", "content": content}],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let started = std::time::Instant::now();
        let request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&body);
        let response = http_client::send(SERVICE, request).await?;
        let value: Value = http_client::json_body(SERVICE, response).await?;
        let tokens = total_tokens(&value);
        info!(
            target: "skb::pipeline",
            model = %self.chat_model,
            tokens,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "analysis request"
        );
        value
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| ServiceError::malformed(SERVICE, "completion without message content"))
    }
}

/// `usage.total_tokens` of a completion, when the provider reports it.
fn total_tokens(completion: &Value) -> Option<u64> {
    completion
        .get("usage")
        .and_then(|usage| usage.get("total_tokens"))
        .and_then(serde_json::Value::as_u64)
}

fn classification_prompt(transcript: &str, categories: &[Category], rules: &[String]) -> String {
    let category_list = categories
        .iter()
        .map(|c| format!("- {}: {}", c.name, c.description))
        .collect::<Vec<_>>()
        .join("\n");
    let rules_text = if rules.is_empty() {
        String::new()
    } else {
        format!(
            "\nДополнительные правила категоризации:\n{}",
            rules
                .iter()
                .map(|r| format!("- {r}"))
                .collect::<Vec<_>>()
                .join("\n")
        )
    };
    format!(
        "Проанализируй диалог из службы поддержки. Верни JSON (без markdown):\n\
{{\n  \"summary_problem\": \"подробное описание проблемы пользователя (5-15 предложений)\",\n  \
\"summary_solution\": \"подробное описание решения и чем закончился диалог (5-15 предложений)\",\n  \
\"category\": \"одна из категорий ниже\"\n}}\n\n\
Сохраняй конкретику: ошибки, названия моделей, действия пользователя, точные формулировки решения.\n\n\
Доступные категории:\n{category_list}\n{rules_text}\n\n\
Выбери ОДНУ категорию. Если ничего не подходит — \"прочее\".\n\n\
Диалог:\n{transcript}"
    )
}

fn answer_prompt(query: &str, matches: &[KnowledgeMatch]) -> String {
    let cases = matches
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let dialog: String = m.transcript.chars().take(2_000).collect();
            format!(
                "Кейс {} (совпадение {}%):\nПроблема: {}\nРешение: {}\nДиалог: {}",
                i + 1,
                (m.similarity * 100.0).round() as i64,
                m.problem,
                m.solution,
                dialog
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!(
        "Ты — помощник оператора поддержки. На основе похожих кейсов из базы знаний \
сформулируй ответ для пользователя.\n\n\
Запрос оператора: \"{query}\"\n\n\
Похожие кейсы из базы:\n{cases}\n\n\
Напиши готовый ответ пользователю. Будь дружелюбным, конкретным, без воды. \
Если кейсы не очень релевантны — честно скажи."
    )
}

/// Model output may be wrapped in a markdown fence or surrounded by prose.
pub fn parse_classification(raw: &str) -> ServiceResult<Classification> {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();
    let candidate = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => cleaned,
    };
    serde_json::from_str(candidate).map_err(|err| {
        debug!(target: "skb::pipeline", raw, "unparseable classification");
        ServiceError::malformed(SERVICE, err.to_string())
    })
}

#[async_trait]
impl AnalysisService for OpenRouterClient {
    async fn classify(
        &self,
        transcript: &str,
        categories: &[Category],
        rules: &[String],
    ) -> ServiceResult<Classification> {
        let prompt = classification_prompt(transcript, categories, rules);
        let raw = self.chat(Value::String(prompt), 0.1, 2_048).await?;
        parse_classification(&raw)
    }

    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        let key = self.key()?;
        let request = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(key)
            .json(&json!({"model": self.embedding_model, "input": text}));
        let response = http_client::send(SERVICE, request).await?;
        let value: Value = http_client::json_body(SERVICE, response).await?;
        let embedding = value
            .pointer("/data/0/embedding")
            .cloned()
            .ok_or_else(|| ServiceError::malformed(SERVICE, "embedding response without data"))?;
        serde_json::from_value(embedding).map_err(|err| ServiceError::malformed(SERVICE, err.to_string()))
    }

    async fn answer(
        &self,
        query: &str,
        matches: &[KnowledgeMatch],
        options: &AnswerOptions,
    ) -> ServiceResult<Option<String>> {
        if matches.is_empty() {
            return Ok(None);
        }
        let text = self
            .chat(
                Value::String(answer_prompt(query, matches)),
                options.temperature,
                512,
            )
            .await?;
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }

    async fn transcribe_audio(&self, audio: &[u8]) -> ServiceResult<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        let content = json!([
            {
                "type": "text",
                "text": "Транскрибируй это голосовое сообщение. Верни только текст, без пояснений."
            },
            {
                "type": "image_url",
                "image_url": {"url": format!("data:audio/ogg;base64,{encoded}")}
            }
        ]);
        let text = self.chat(content, 0.1, 2_048).await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_tolerates_fences_and_prose() {
        let raw = "Вот ответ:\n```json\n{\"summary_problem\":\"p\",\"summary_solution\":\"s\",\"category\":\"прочее\"}\n```";
        let parsed = parse_classification(raw).expect("parsed");
        assert_eq!(parsed.problem, "p");
        assert_eq!(parsed.solution, "s");
        assert_eq!(parsed.category, "прочее");
    }

    #[test]
    fn garbage_is_malformed() {
        let err = parse_classification("не знаю").unwrap_err();
        assert!(matches!(err, ServiceError::MalformedResponse { .. }));
    }

    #[test]
    fn token_usage_is_optional() {
        assert_eq!(
            total_tokens(&json!({"usage": {"total_tokens": 812}, "choices": []})),
            Some(812)
        );
        assert_eq!(total_tokens(&json!({"choices": []})), None);
        assert_eq!(total_tokens(&json!({"usage": {"total_tokens": "n/a"}})), None);
    }

    #[tokio::test]
    async fn missing_key_is_not_configured() {
        let client = OpenRouterClient::new(reqwest::Client::new(), &AnalysisConfig::default());
        let err = client.embed("hi").await.unwrap_err();
        assert_eq!(err, ServiceError::NotConfigured("analysis api key"));
        assert_eq!(
            client
                .answer("q", &[], &AnswerOptions::default())
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn prompts_list_categories_and_rules() {
        let prompt = classification_prompt(
            "[USER]: hi",
            &[Category::new("прочее", "Всё остальное")],
            &["оплата → лимиты".to_string()],
        );
        assert!(prompt.contains("- прочее: Всё остальное"));
        assert!(prompt.contains("- оплата → лимиты"));
        assert!(prompt.ends_with("[USER]: hi"));
    }
}
