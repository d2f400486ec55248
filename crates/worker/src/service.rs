//! Chat pipeline: validate, admit, load, generate
//!
//! [`ChatService`] is what the HTTP layer talks to. It owns the admission gate,
//! the lazily loaded resource and the blocking pool, and turns a user message
//! into a reply.

use crate::gate::AdmissionGate;
use crate::inference::{self, GenerationResult};
use crate::loader::{ResourceLoader, ResourceSource};
use crate::pool::BlockingPool;
use chatgate_common::config::AppConfig;
use chatgate_common::error::{ChatGateError, Result, EMPTY_MESSAGE_DETAIL};
use chatgate_common::METRICS;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Shared entry point for chat requests
pub struct ChatService {
    gate: AdmissionGate,
    loader: Arc<ResourceLoader>,
    pool: Arc<BlockingPool>,
}

impl ChatService {
    pub fn new(gate: AdmissionGate, loader: Arc<ResourceLoader>, pool: Arc<BlockingPool>) -> Self {
        Self { gate, loader, pool }
    }

    /// Build the gate, pool and loader described by `config`
    pub fn from_config(config: &AppConfig, source: Arc<dyn ResourceSource>) -> Result<Self> {
        config.validate()?;

        let gate = AdmissionGate::new(config.concurrency.max_concurrent_requests)?;
        let pool = Arc::new(BlockingPool::new(config.concurrency.worker_threads)?);
        let loader = Arc::new(ResourceLoader::new(
            source,
            config.generation.clone(),
            Arc::clone(&pool),
        ));

        info!(
            "Chat service ready: {} concurrent generations, {} worker threads",
            gate.capacity(),
            pool.threads()
        );

        Ok(Self::new(gate, loader, pool))
    }

    /// Reject messages that are empty after trimming whitespace
    pub fn validate(message: &str) -> Result<&str> {
        let trimmed = message.trim();
        if trimmed.is_empty() {
            return Err(ChatGateError::validation(EMPTY_MESSAGE_DETAIL));
        }
        Ok(trimmed)
    }

    /// Produce a reply to `message`
    ///
    /// Waits for an admission slot, then for the resource, then runs the
    /// generation on the blocking pool. The slot stays held until the
    /// generation finishes, even if this future is dropped first.
    pub async fn respond(&self, message: &str) -> Result<GenerationResult> {
        let prompt = Self::validate(message)?.to_string();

        let permit = self.gate.acquire().await?;
        debug!("Admitted ({} of {} slots in use)", self.gate.active(), self.gate.capacity());

        let loaded = self.loader.get().await?;

        let start = Instant::now();
        let result = self
            .pool
            .run(move || {
                let _permit = permit;
                inference::run(&loaded.resource, &loaded.generation, &prompt)
            })
            .await?;

        METRICS.inference.generation_duration.observe(start.elapsed().as_secs_f64());
        METRICS.inference.tokens_generated_total.inc_by(result.completion_tokens as u64);

        Ok(result)
    }

    /// Start loading the resource without waiting for a request
    pub async fn preload(&self) -> Result<()> {
        self.loader.get().await.map(|_| ())
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn loader(&self) -> &ResourceLoader {
        &self.loader
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeModel, FakeSource};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn service(source: Arc<FakeSource>, capacity: usize) -> Arc<ChatService> {
        let mut config = AppConfig::default();
        config.concurrency.max_concurrent_requests = capacity;
        config.concurrency.worker_threads = 8;
        config.generation.max_new_tokens = 20;
        config.generation.do_sample = false;

        Arc::new(ChatService::from_config(&config, source).unwrap())
    }

    #[test]
    fn test_validate() {
        assert_eq!(ChatService::validate("  hi  ").unwrap(), "hi");

        for blank in ["", "   ", "\n\t "] {
            let err = ChatService::validate(blank).unwrap_err();
            assert!(err.is_client_error());
            assert_eq!(err.public_message(), EMPTY_MESSAGE_DETAIL);
        }
    }

    #[tokio::test]
    async fn test_respond() {
        let source = Arc::new(FakeSource::default());
        let service = service(Arc::clone(&source), 5);

        let result = service.respond("Hello").await.unwrap();

        assert_eq!(result.text, FakeModel::REPLY.trim());
        assert_eq!(service.gate().admitted(), 1);
        assert_eq!(service.gate().active(), 0);
        assert_eq!(source.loads(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_touches_nothing() {
        let source = Arc::new(FakeSource::default());
        let service = service(Arc::clone(&source), 5);

        let err = service.respond(" \n ").await.unwrap_err();

        assert!(matches!(err, ChatGateError::Validation(_)));
        assert_eq!(service.gate().admitted(), 0);
        assert_eq!(service.loader().load_attempts(), 0);
        assert_eq!(source.model().calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let model = FakeModel::new().with_step_delay(Duration::from_millis(5));
        let source = Arc::new(FakeSource::new(model));
        let service = service(Arc::clone(&source), 3);

        let replies = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let service = Arc::clone(&service);
                let replies = Arc::clone(&replies);
                tokio::spawn(async move {
                    let result = service.respond(&format!("Hello {}", i)).await.unwrap();
                    replies.lock().push(result.text);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(replies.lock().len(), 10);
        // Ten callers against three slots keep the gate saturated
        assert_eq!(service.gate().peak(), 3);
        assert_eq!(source.model().peak_in_flight(), 3);
        assert_eq!(service.gate().admitted(), 10);
        assert_eq!(service.gate().available(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_first_requests_share_one_load() {
        let source = Arc::new(FakeSource::default().with_load_delay(Duration::from_millis(50)));
        let service = service(Arc::clone(&source), 5);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.respond("Hello").await.unwrap() })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(source.loads(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn test_failures_release_the_slot() {
        let source = Arc::new(FakeSource::new(FakeModel::new().failing()));
        let service = service(Arc::clone(&source), 1);

        for _ in 0..3 {
            let err = service.respond("Hello").await.unwrap_err();
            assert!(matches!(err, ChatGateError::Inference(_)));
        }

        assert_eq!(service.gate().available(), 1);
        assert_eq!(service.gate().active(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_then_recovery() {
        let source = Arc::new(FakeSource::default());
        source.set_broken(true);
        let service = service(Arc::clone(&source), 2);

        let err = service.respond("Hello").await.unwrap_err();
        assert!(matches!(err, ChatGateError::ResourceLoad(_)));
        assert_eq!(service.gate().available(), 2);

        source.set_broken(false);
        assert!(service.respond("Hello").await.is_ok());
        assert_eq!(source.loads(), 2);
    }

    #[tokio::test]
    async fn test_preload() {
        let source = Arc::new(FakeSource::default());
        let service = service(Arc::clone(&source), 2);

        service.preload().await.unwrap();
        assert!(service.loader().is_loaded());

        service.respond("Hello").await.unwrap();
        assert_eq!(source.loads(), 1);
    }
}
