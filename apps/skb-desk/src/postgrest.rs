//! Durable store backed by a PostgREST endpoint (Supabase-style).
//!
//! Tables: `support_kb` (records, pgvector `embedding`, nullable
//! `last_synced_to_sheets`), `kb_categories`, `kb_rules`; similarity search is
//! the `search_kb` RPC.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use skb_core::types::CategoryCount;
use skb_core::{
    Category, CategoryInsert, ConversationKey, DurableStore, KnowledgeMatch, KnowledgeRecord,
    NewKnowledgeRecord, RecordPatch, ServiceError, ServiceResult, StoreStats,
};
use tracing::info;

use crate::http_client;

const SERVICE: &str = "store";
const RECORD_COLUMNS: &str = "id,created_at,telegram_message_id,telegram_user_id,category,full_dialog,summary_problem,summary_solution,last_synced_to_sheets";

pub struct PostgrestStore {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

#[derive(Serialize)]
struct InsertRow<'a> {
    telegram_message_id: Option<i64>,
    telegram_user_id: Option<i64>,
    category: &'a str,
    full_dialog: &'a str,
    summary_problem: &'a str,
    summary_solution: &'a str,
    embedding: &'a [f32],
}

#[derive(Serialize)]
struct PatchRow<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    category: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary_problem: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary_solution: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<&'a [f32]>,
}

#[derive(Deserialize)]
struct RecordRow {
    id: i64,
    created_at: DateTime<Utc>,
    telegram_message_id: Option<i64>,
    telegram_user_id: Option<i64>,
    category: Option<String>,
    full_dialog: Option<String>,
    summary_problem: Option<String>,
    summary_solution: Option<String>,
    last_synced_to_sheets: Option<DateTime<Utc>>,
}

impl From<RecordRow> for KnowledgeRecord {
    fn from(row: RecordRow) -> Self {
        KnowledgeRecord {
            id: row.id,
            created_at: row.created_at,
            source_message_id: row.telegram_message_id,
            conversation: row
                .telegram_user_id
                .map(ConversationKey::from)
                .unwrap_or_else(|| ConversationKey::new("")),
            category: row.category.unwrap_or_default(),
            transcript: row.full_dialog.unwrap_or_default(),
            problem: row.summary_problem.unwrap_or_default(),
            solution: row.summary_solution.unwrap_or_default(),
            embedding: Vec::new(),
            synced_at: row.last_synced_to_sheets,
        }
    }
}

#[derive(Deserialize)]
struct MatchRow {
    id: i64,
    category: Option<String>,
    summary_problem: Option<String>,
    summary_solution: Option<String>,
    full_dialog: Option<String>,
    similarity: f32,
}

#[derive(Deserialize)]
struct IdRow {
    id: i64,
}

#[derive(Deserialize)]
struct RuleRow {
    rule_text: String,
}

#[derive(Deserialize)]
struct CategoryRow {
    category: Option<String>,
}

#[derive(Deserialize)]
struct SyncRow {
    last_synced_to_sheets: Option<DateTime<Utc>>,
}

impl PostgrestStore {
    /// `url` is the project URL; requests go to `{url}/rest/v1`.
    pub fn new(http: reqwest::Client, url: &str, key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            key: key.into(),
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    fn table(&self, table: &str) -> String {
        format!("{}/{table}", self.base_url)
    }

    async fn fetch<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> ServiceResult<Vec<T>> {
        let request = self.authed(self.http.get(self.table(table)).query(query));
        let response = http_client::send(SERVICE, request).await?;
        http_client::json_body(SERVICE, response).await
    }
}

#[async_trait]
impl DurableStore for PostgrestStore {
    async fn insert(&self, record: NewKnowledgeRecord) -> ServiceResult<i64> {
        let row = InsertRow {
            telegram_message_id: record.source_message_id,
            telegram_user_id: record.conversation.as_str().parse().ok(),
            category: &record.category,
            full_dialog: &record.transcript,
            summary_problem: &record.problem,
            summary_solution: &record.solution,
            embedding: &record.embedding,
        };
        let request = self
            .authed(self.http.post(self.table("support_kb")))
            .query(&[("select", "id")])
            .header("Prefer", "return=representation")
            .json(&[row]);
        let response = http_client::send(SERVICE, request).await?;
        let rows: Vec<IdRow> = http_client::json_body(SERVICE, response).await?;
        let id = rows
            .first()
            .map(|r| r.id)
            .ok_or_else(|| ServiceError::malformed(SERVICE, "insert returned no id"))?;
        info!(target: "skb::pipeline", id, category = %record.category, "record inserted");
        Ok(id)
    }

    async fn update(&self, id: i64, patch: RecordPatch) -> ServiceResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let row = PatchRow {
            category: patch.category.as_deref(),
            summary_problem: patch.problem.as_deref(),
            summary_solution: patch.solution.as_deref(),
            embedding: patch.embedding.as_deref(),
        };
        let request = self
            .authed(self.http.patch(self.table("support_kb")))
            .query(&[("id", format!("eq.{id}"))])
            .json(&row);
        http_client::send(SERVICE, request).await?;
        Ok(())
    }

    async fn query_unsynced(&self) -> ServiceResult<Vec<KnowledgeRecord>> {
        let rows: Vec<RecordRow> = self
            .fetch(
                "support_kb",
                &[
                    ("select", RECORD_COLUMNS.to_string()),
                    ("last_synced_to_sheets", "is.null".to_string()),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(KnowledgeRecord::from).collect())
    }

    async fn mark_synced(&self, ids: &[i64]) -> ServiceResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let list = ids
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let request = self
            .authed(self.http.patch(self.table("support_kb")))
            .query(&[
                ("id", format!("in.({list})")),
                ("last_synced_to_sheets", "is.null".to_string()),
            ])
            .json(&json!({"last_synced_to_sheets": Utc::now()}));
        http_client::send(SERVICE, request).await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> ServiceResult<Vec<KnowledgeMatch>> {
        let request = self
            .authed(self.http.post(format!("{}/rpc/search_kb", self.base_url)))
            .json(&json!({
                "query_embedding": embedding,
                "match_count": limit,
                "filter_category": category,
            }));
        let response = http_client::send(SERVICE, request).await?;
        let rows: Vec<MatchRow> = http_client::json_body(SERVICE, response).await?;
        Ok(rows
            .into_iter()
            .map(|row| KnowledgeMatch {
                id: row.id,
                category: row.category.unwrap_or_default(),
                problem: row.summary_problem.unwrap_or_default(),
                solution: row.summary_solution.unwrap_or_default(),
                transcript: row.full_dialog.unwrap_or_default(),
                similarity: row.similarity,
            })
            .collect())
    }

    async fn list_categories(&self) -> ServiceResult<Vec<Category>> {
        self.fetch(
            "kb_categories",
            &[
                ("select", "name,description".to_string()),
                ("order", "name".to_string()),
            ],
        )
        .await
    }

    async fn list_rules(&self) -> ServiceResult<Vec<String>> {
        let rows: Vec<RuleRow> = self
            .fetch(
                "kb_rules",
                &[
                    ("select", "rule_text".to_string()),
                    ("active", "eq.true".to_string()),
                    ("order", "created_at".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().map(|r| r.rule_text).collect())
    }

    async fn add_category(&self, category: Category) -> ServiceResult<CategoryInsert> {
        let request = self
            .authed(self.http.post(self.table("kb_categories")))
            .json(&category);
        match http_client::send(SERVICE, request).await {
            Ok(_) => Ok(CategoryInsert::Added),
            // Unique violation (23505) surfaces as 409.
            Err(ServiceError::Rejected { message, .. })
                if message.starts_with(StatusCode::CONFLICT.as_str()) =>
            {
                Ok(CategoryInsert::AlreadyExists)
            }
            Err(err) => Err(err),
        }
    }

    async fn add_rule(&self, rule: &str) -> ServiceResult<()> {
        let request = self
            .authed(self.http.post(self.table("kb_rules")))
            .json(&json!({"rule_text": rule}));
        http_client::send(SERVICE, request).await?;
        Ok(())
    }

    async fn list_records(&self, category: Option<&str>) -> ServiceResult<Vec<KnowledgeRecord>> {
        let mut query = vec![
            ("select", RECORD_COLUMNS.to_string()),
            ("order", "created_at".to_string()),
        ];
        if let Some(category) = category {
            query.push(("category", format!("eq.{category}")));
        }
        let rows: Vec<RecordRow> = self.fetch("support_kb", &query).await?;
        Ok(rows.into_iter().map(KnowledgeRecord::from).collect())
    }

    async fn stats(&self) -> ServiceResult<StoreStats> {
        let categories: Vec<CategoryRow> = self
            .fetch("support_kb", &[("select", "category".to_string())])
            .await?;
        let last: Vec<SyncRow> = self
            .fetch(
                "support_kb",
                &[
                    ("select", "last_synced_to_sheets".to_string()),
                    ("last_synced_to_sheets", "not.is.null".to_string()),
                    ("order", "last_synced_to_sheets.desc".to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for row in &categories {
            let name = row.category.clone().unwrap_or_default();
            *counts.entry(name).or_default() += 1;
        }
        let mut by_category: Vec<CategoryCount> = counts
            .into_iter()
            .map(|(category, count)| CategoryCount { category, count })
            .collect();
        by_category.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(StoreStats {
            total: categories.len() as u64,
            by_category,
            last_sync: last.first().and_then(|r| r.last_synced_to_sheets),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_map_onto_records() {
        let row: RecordRow = serde_json::from_value(json!({
            "id": 3,
            "created_at": "2025-03-01T10:15:00.123456+00:00",
            "telegram_message_id": 55,
            "telegram_user_id": -1001,
            "category": "прочее",
            "full_dialog": "[USER]: hi",
            "summary_problem": null,
            "summary_solution": "s",
            "last_synced_to_sheets": null
        }))
        .expect("row");
        let record = KnowledgeRecord::from(row);
        assert_eq!(record.id, 3);
        assert_eq!(record.conversation.as_str(), "-1001");
        assert_eq!(record.source_message_id, Some(55));
        assert_eq!(record.problem, "");
        assert!(record.synced_at.is_none());
    }

    #[test]
    fn patch_only_carries_set_fields() {
        let row = PatchRow {
            category: Some("прочее"),
            summary_problem: None,
            summary_solution: None,
            embedding: None,
        };
        assert_eq!(
            serde_json::to_value(&row).expect("json"),
            json!({"category": "прочее"})
        );
    }

    #[test]
    fn endpoint_is_rest_v1() {
        let store = PostgrestStore::new(reqwest::Client::new(), "https://db.example/", "k");
        assert_eq!(store.table("kb_rules"), "https://db.example/rest/v1/kb_rules");
    }
}
