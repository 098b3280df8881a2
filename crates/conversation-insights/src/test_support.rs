//! Scripted providers and database fixtures for unit tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::analysis_db::{AnalysisDatabase, ClaimedJob, NewResponse, Strategy};
use crate::error::{AnalysisError, AnalysisResult};
use crate::providers::{EmbeddingProvider, TextGenerator};

pub(crate) const TEST_OWNER: &str = "test-worker";

/// Create a conversation holding `texts`; returns its id and the response ids.
pub(crate) fn seed_conversation(db: &AnalysisDatabase, texts: &[&str]) -> (String, Vec<String>) {
    let conversation = db.conversations.create_conversation("Test conversation").unwrap();
    let ids = add_texts(db, &conversation.id, texts);
    (conversation.id, ids)
}

pub(crate) fn add_texts(db: &AnalysisDatabase, conversation_id: &str, texts: &[&str]) -> Vec<String> {
    let responses: Vec<NewResponse> = texts
        .iter()
        .map(|t| NewResponse {
            text: t.to_string(),
            tag: None,
        })
        .collect();
    db.conversations.add_responses(conversation_id, &responses).unwrap()
}

/// Queue a job for the conversation and claim it as [`TEST_OWNER`].
pub(crate) fn claim_job_for(db: &AnalysisDatabase, conversation_id: &str, strategy: Strategy) -> ClaimedJob {
    db.jobs.enqueue(conversation_id, strategy).unwrap();
    db.jobs
        .claim(TEST_OWNER, Duration::from_secs(300), 3)
        .unwrap()
        .expect("a queued job to claim")
}

enum EmbedMode {
    ByLength,
    Table(HashMap<String, Vec<f32>>),
    AlwaysFail,
}

pub(crate) struct FakeEmbedder {
    mode: EmbedMode,
    fail_on_text: Option<String>,
    drop_last: bool,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl FakeEmbedder {
    fn with_mode(mode: EmbedMode) -> Self {
        Self {
            mode,
            fail_on_text: None,
            drop_last: false,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// `[chars, 1.0]` for every text.
    pub(crate) fn by_length() -> Self {
        Self::with_mode(EmbedMode::ByLength)
    }

    pub(crate) fn from_table(entries: &[(&str, Vec<f32>)]) -> Self {
        let table = entries.iter().map(|(t, v)| (t.to_string(), v.clone())).collect();
        Self::with_mode(EmbedMode::Table(table))
    }

    pub(crate) fn always_failing() -> Self {
        Self::with_mode(EmbedMode::AlwaysFail)
    }

    /// Fail any batch that contains `text`.
    pub(crate) fn failing_on_text(mut self, text: &str) -> Self {
        self.fail_on_text = Some(text.to_string());
        self
    }

    /// Return one vector fewer than requested.
    pub(crate) fn dropping_last(mut self) -> Self {
        self.drop_last = true;
        self
    }

    pub(crate) fn length_vector(text: &str) -> Vec<f32> {
        vec![text.chars().count() as f32, 1.0]
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every text received so far, in call order.
    pub(crate) fn texts_seen(&self) -> Vec<String> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> AnalysisResult<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.extend(texts.iter().cloned());
        }
        if let Some(bad) = &self.fail_on_text {
            if texts.iter().any(|t| t == bad) {
                return Err(AnalysisError::provider(format!("scripted failure on '{}'", bad)));
            }
        }

        let mut vectors = texts
            .iter()
            .map(|text| match &self.mode {
                EmbedMode::ByLength => Ok(Self::length_vector(text)),
                EmbedMode::Table(table) => table
                    .get(text)
                    .cloned()
                    .ok_or_else(|| AnalysisError::provider(format!("no scripted vector for '{}'", text))),
                EmbedMode::AlwaysFail => Err(AnalysisError::provider("embedding service unavailable")),
            })
            .collect::<AnalysisResult<Vec<_>>>()?;
        if self.drop_last {
            vectors.pop();
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        "fake-embedder"
    }
}

type Script = Box<dyn Fn(&str) -> AnalysisResult<String> + Send + Sync>;

pub(crate) struct FakeGenerator {
    script: Script,
    calls: AtomicUsize,
}

impl FakeGenerator {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(&str) -> AnalysisResult<String> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn replying(reply: &str) -> Self {
        let reply = reply.to_string();
        Self::new(move |_| Ok(reply.clone()))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, prompt: &str) -> AnalysisResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(prompt)
    }
}
