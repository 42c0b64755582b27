//! Process-local [`DurableStore`] used when no database is configured and in tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::collab::{CategoryInsert, DurableStore};
use crate::error::{ServiceError, ServiceResult};
use crate::types::{
    Category, CategoryCount, KnowledgeMatch, KnowledgeRecord, NewKnowledgeRecord, RecordPatch,
    StoreStats,
};

#[derive(Default)]
struct State {
    next_id: i64,
    records: BTreeMap<i64, KnowledgeRecord>,
    categories: Vec<Category>,
    rules: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(categories: Vec<Category>) -> Self {
        let store = Self::default();
        store.lock().categories = categories;
        store
    }

    pub fn record(&self, id: i64) -> Option<KnowledgeRecord> {
        self.lock().records.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<KnowledgeRecord> {
        self.lock().records.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Cosine similarity; 0 for empty or mismatched vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert(&self, record: NewKnowledgeRecord) -> ServiceResult<i64> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.records.insert(
            id,
            KnowledgeRecord {
                id,
                created_at: Utc::now(),
                source_message_id: record.source_message_id,
                conversation: record.conversation,
                category: record.category,
                transcript: record.transcript,
                problem: record.problem,
                solution: record.solution,
                embedding: record.embedding,
                synced_at: None,
            },
        );
        Ok(id)
    }

    async fn update(&self, id: i64, patch: RecordPatch) -> ServiceResult<()> {
        let mut state = self.lock();
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| ServiceError::rejected("memory store", format!("no record {id}")))?;
        if let Some(category) = patch.category {
            record.category = category;
        }
        if let Some(problem) = patch.problem {
            record.problem = problem;
        }
        if let Some(solution) = patch.solution {
            record.solution = solution;
        }
        if let Some(embedding) = patch.embedding {
            record.embedding = embedding;
        }
        Ok(())
    }

    async fn query_unsynced(&self) -> ServiceResult<Vec<KnowledgeRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| r.synced_at.is_none())
            .cloned()
            .collect())
    }

    async fn mark_synced(&self, ids: &[i64]) -> ServiceResult<()> {
        let now = Utc::now();
        let mut state = self.lock();
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                if record.synced_at.is_none() {
                    record.synced_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn similarity_search(
        &self,
        embedding: &[f32],
        limit: usize,
        category: Option<&str>,
    ) -> ServiceResult<Vec<KnowledgeMatch>> {
        let state = self.lock();
        let mut scored: Vec<KnowledgeMatch> = state
            .records
            .values()
            .filter(|r| category.map_or(true, |c| r.category == c))
            .map(|r| KnowledgeMatch {
                id: r.id,
                category: r.category.clone(),
                problem: r.problem.clone(),
                solution: r.solution.clone(),
                transcript: r.transcript.clone(),
                similarity: cosine_similarity(embedding, &r.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn list_categories(&self) -> ServiceResult<Vec<Category>> {
        let mut categories = self.lock().categories.clone();
        categories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(categories)
    }

    async fn list_rules(&self) -> ServiceResult<Vec<String>> {
        Ok(self.lock().rules.clone())
    }

    async fn add_category(&self, category: Category) -> ServiceResult<CategoryInsert> {
        let mut state = self.lock();
        if state.categories.iter().any(|c| c.name == category.name) {
            return Ok(CategoryInsert::AlreadyExists);
        }
        state.categories.push(category);
        Ok(CategoryInsert::Added)
    }

    async fn add_rule(&self, rule: &str) -> ServiceResult<()> {
        self.lock().rules.push(rule.to_string());
        Ok(())
    }

    async fn list_records(&self, category: Option<&str>) -> ServiceResult<Vec<KnowledgeRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .filter(|r| category.map_or(true, |c| r.category == c))
            .cloned()
            .collect())
    }

    async fn stats(&self) -> ServiceResult<StoreStats> {
        let state = self.lock();
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for record in state.records.values() {
            *counts.entry(record.category.as_str()).or_default() += 1;
        }
        let mut by_category: Vec<CategoryCount> = counts
            .into_iter()
            .map(|(category, count)| CategoryCount {
                category: category.to_string(),
                count,
            })
            .collect();
        by_category.sort_by(|a, b| b.count.cmp(&a.count));
        Ok(StoreStats {
            total: state.records.len() as u64,
            by_category,
            last_sync: state.records.values().filter_map(|r| r.synced_at).max(),
        })
    }
}
