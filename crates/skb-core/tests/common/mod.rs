#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use skb_core::{
    AnalysisService, AnswerOptions, Category, Classification, ConversationKey, ExternalSink,
    KnowledgeMatch, Reply, ServiceError, ServiceResult, Transport,
};

/// Analysis double: classifies into a configurable category and embeds every
/// text onto the same direction so any stored record is a match.
pub struct FakeAnalysis {
    pub category: Mutex<String>,
    pub malformed: AtomicBool,
    pub unavailable: AtomicBool,
    pub answer: Mutex<Option<String>>,
    pub transcription: Mutex<String>,
    pub classify_calls: AtomicUsize,
    pub embedded: Mutex<Vec<String>>,
    pub answer_temperatures: Mutex<Vec<f32>>,
}

impl FakeAnalysis {
    pub fn new(category: &str) -> Self {
        Self {
            category: Mutex::new(category.to_string()),
            malformed: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            answer: Mutex::new(Some("Перезайдите в аккаунт".to_string())),
            transcription: Mutex::new(String::new()),
            classify_calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
            answer_temperatures: Mutex::new(Vec::new()),
        }
    }

    pub fn set_category(&self, category: &str) {
        *self.category.lock().unwrap() = category.to_string();
    }

    pub fn set_answer(&self, answer: Option<&str>) {
        *self.answer.lock().unwrap() = answer.map(str::to_string);
    }

    pub fn set_transcription(&self, text: &str) {
        *self.transcription.lock().unwrap() = text.to_string();
    }
}

#[async_trait]
impl AnalysisService for FakeAnalysis {
    async fn classify(
        &self,
        transcript: &str,
        _categories: &[Category],
        _rules: &[String],
    ) -> ServiceResult<Classification> {
        self.classify_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::transient("analysis", "502 bad gateway"));
        }
        if self.malformed.load(Ordering::SeqCst) {
            return Err(ServiceError::malformed("analysis", "not json"));
        }
        let first = transcript.lines().next().unwrap_or_default();
        Ok(Classification {
            problem: format!("problem: {first}"),
            solution: "solution".to_string(),
            category: self.category.lock().unwrap().clone(),
        })
    }

    async fn embed(&self, text: &str) -> ServiceResult<Vec<f32>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ServiceError::transient("analysis", "timeout"));
        }
        self.embedded.lock().unwrap().push(text.to_string());
        Ok(vec![1.0, 0.5])
    }

    async fn answer(
        &self,
        _query: &str,
        _matches: &[KnowledgeMatch],
        options: &AnswerOptions,
    ) -> ServiceResult<Option<String>> {
        self.answer_temperatures
            .lock()
            .unwrap()
            .push(options.temperature);
        Ok(self.answer.lock().unwrap().clone())
    }

    async fn transcribe_audio(&self, _audio: &[u8]) -> ServiceResult<String> {
        Ok(self.transcription.lock().unwrap().clone())
    }
}

/// Sink that plays back scripted results, then succeeds.
#[derive(Default)]
pub struct ScriptedSink {
    script: Mutex<VecDeque<ServiceResult<()>>>,
    always_fail: bool,
    pub calls: AtomicUsize,
    pub delivered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSink {
    pub fn failing_times(n: usize) -> Self {
        let script = (0..n)
            .map(|_| Err(ServiceError::transient("sheet", "503 service unavailable")))
            .collect();
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered_rows(&self) -> Vec<Vec<String>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSink for ScriptedSink {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> ServiceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            return Err(ServiceError::transient("sheet", "connection reset"));
        }
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            next?;
        }
        self.delivered.lock().unwrap().extend(rows.iter().cloned());
        Ok(())
    }
}

/// Transport that keeps every reply for inspection.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<(ConversationKey, Reply)>>,
}

impl RecordingTransport {
    pub fn bodies(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reply)| reply.body().to_string())
            .collect()
    }

    pub fn replies(&self) -> Vec<Reply> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reply)| reply.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn reply(&self, key: &ConversationKey, reply: Reply) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((key.clone(), reply));
        Ok(())
    }
}

pub fn categories() -> Vec<Category> {
    vec![
        Category::new("баги_фронтенд", "Баги на фронтенде"),
        Category::new("прочее", "Всё остальное"),
    ]
}
