//! Test doubles shared by the core unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use biothreat_shared::Result;

use crate::llm::{Completion, CompletionClient, CompletionRequest};

type Script = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

/// A [`CompletionClient`] that answers from a closure and counts calls.
pub struct ScriptedClient {
    script: Box<Script>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(script: impl Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(request).map(|text| Completion { text })
    }

    fn model_id(&self) -> &str {
        "scripted/test"
    }
}

/// Temp-file database for a single test.
pub async fn test_storage() -> biothreat_storage::Storage {
    let path = std::env::temp_dir().join(format!("biothreat_core_test_{}.db", uuid::Uuid::now_v7()));
    biothreat_storage::Storage::open(&path).await.expect("open test db")
}
