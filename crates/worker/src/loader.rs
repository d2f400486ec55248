//! Lazy, single-flight loading of the inference resource
//!
//! The tokenizer and model are built on first use, at most one load runs at a
//! time, and every caller waiting on an in-flight load gets the same finished
//! resource. A failed load is not cached: the next caller tries again.
//! Callers that stop waiting do not cancel the load.

use crate::model::{Gpt2Model, LanguageModel};
use crate::pool::BlockingPool;
use crate::tokenizer::{ChatTokenizer, TokenCodec};
use chatgate_common::config::{GenerationConfig, ModelConfig};
use chatgate_common::error::{ChatGateError, Result};
use chatgate_common::METRICS;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::{watch, OnceCell};
use tracing::{error, info};

/// Tokenizer and model pair, shared read-only by every generation
#[derive(Clone)]
pub struct InferenceResource {
    pub tokenizer: Arc<dyn TokenCodec>,
    pub model: Arc<dyn LanguageModel>,
}

/// Produces an [`InferenceResource`]; called on a blocking thread
pub trait ResourceSource: Send + Sync + 'static {
    /// Build the resource from scratch
    fn load(&self) -> Result<InferenceResource>;

    /// Human readable origin, for logs
    fn describe(&self) -> String;
}

/// Loads a pretrained tokenizer and GPT-2 checkpoint from disk
#[derive(Debug, Clone)]
pub struct PretrainedSource {
    model_dir: PathBuf,
    tokenizer_dir: PathBuf,
}

impl PretrainedSource {
    pub fn new(model_dir: impl Into<PathBuf>, tokenizer_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            tokenizer_dir: tokenizer_dir.into(),
        }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(&config.model_dir, &config.tokenizer_dir)
    }
}

impl ResourceSource for PretrainedSource {
    fn load(&self) -> Result<InferenceResource> {
        let tokenizer = ChatTokenizer::from_dir(&self.tokenizer_dir)?;
        let model = Gpt2Model::load(&self.model_dir)?;

        Ok(InferenceResource {
            tokenizer: Arc::new(tokenizer),
            model: Arc::new(model),
        })
    }

    fn describe(&self) -> String {
        format!(
            "model {} / tokenizer {}",
            self.model_dir.display(),
            self.tokenizer_dir.display()
        )
    }
}

/// A loaded resource and the generation config frozen alongside it
pub struct LoadedResource {
    pub resource: InferenceResource,

    /// Configured parameters with the end-of-sequence id filled in
    pub generation: GenerationConfig,
}

/// Outcome of one load execution as seen by its waiters
type LoadOutcome = std::result::Result<Arc<LoadedResource>, String>;

/// A load execution that has started and not yet published its outcome
struct InFlight {
    attempt: usize,
    outcome: watch::Receiver<Option<LoadOutcome>>,
}

/// State shared between the loader and the task running a load
struct LoaderShared {
    source: Arc<dyn ResourceSource>,
    generation: GenerationConfig,
    pool: Arc<BlockingPool>,
    cell: OnceCell<Arc<LoadedResource>>,
    in_flight: Mutex<Option<InFlight>>,
    load_attempts: AtomicUsize,
}

/// Owner of the once-initialized resource
///
/// A load runs in its own task, detached from the callers waiting on it, so
/// a caller that gives up never causes a second load to start.
pub struct ResourceLoader {
    shared: Arc<LoaderShared>,
}

impl ResourceLoader {
    /// Create a loader; nothing is loaded until [`ResourceLoader::get`] is called
    pub fn new(
        source: Arc<dyn ResourceSource>,
        generation: GenerationConfig,
        pool: Arc<BlockingPool>,
    ) -> Self {
        Self {
            shared: Arc::new(LoaderShared {
                source,
                generation,
                pool,
                cell: OnceCell::new(),
                in_flight: Mutex::new(None),
                load_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Return the resource, loading it if this is the first successful call
    ///
    /// Joins the running load if there is one, otherwise starts one.
    pub async fn get(&self) -> Result<Arc<LoadedResource>> {
        if let Some(loaded) = self.shared.cell.get() {
            return Ok(Arc::clone(loaded));
        }

        let (attempt, mut outcome) = {
            let mut in_flight = self.shared.in_flight.lock();
            if let Some(loaded) = self.shared.cell.get() {
                return Ok(Arc::clone(loaded));
            }

            match in_flight.as_ref() {
                Some(current) => (current.attempt, current.outcome.clone()),
                None => {
                    let started = LoaderShared::start(&self.shared);
                    let joined = (started.attempt, started.outcome.clone());
                    *in_flight = Some(started);
                    joined
                }
            }
        };

        let published = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| Option::clone(&value));

        match published {
            Ok(Some(Ok(loaded))) => Ok(loaded),
            Ok(Some(Err(message))) => Err(ChatGateError::resource_load(message)),
            Ok(None) | Err(_) => {
                self.shared.abandon(attempt);
                Err(ChatGateError::resource_load("resource load ended without a result"))
            }
        }
    }

    /// Whether a load has completed
    pub fn is_loaded(&self) -> bool {
        self.shared.cell.initialized()
    }

    /// Number of load executions started so far
    pub fn load_attempts(&self) -> usize {
        self.shared.load_attempts.load(Ordering::SeqCst)
    }
}

impl LoaderShared {
    /// Spawn a load task; the caller must hold the `in_flight` lock
    fn start(shared: &Arc<Self>) -> InFlight {
        let attempt = shared.load_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let (publisher, outcome) = watch::channel(None);

        let task = Arc::clone(shared);
        tokio::spawn(async move {
            let result = task.load(attempt).await;

            {
                let mut in_flight = task.in_flight.lock();
                if let Ok(loaded) = &result {
                    // Only this task ever fills the cell
                    let _ = task.cell.set(Arc::clone(loaded));
                }
                if in_flight.as_ref().map(|current| current.attempt) == Some(attempt) {
                    *in_flight = None;
                }
            }

            publisher.send_replace(Some(result));
        });

        InFlight { attempt, outcome }
    }

    /// Forget a load whose task went away without publishing
    fn abandon(&self, attempt: usize) {
        let mut in_flight = self.in_flight.lock();
        if in_flight.as_ref().map(|current| current.attempt) == Some(attempt) {
            *in_flight = None;
        }
    }

    async fn load(&self, attempt: usize) -> LoadOutcome {
        METRICS.inference.resource_loads_total.inc();

        info!("Loading model and tokenizer from {} (attempt {})", self.source.describe(), attempt);
        let start = Instant::now();

        let source = Arc::clone(&self.source);
        let outcome = self
            .pool
            .run(move || source.load())
            .await
            .and_then(|resource| self.freeze(resource));

        match outcome {
            Ok(loaded) => {
                info!("Model and tokenizer successfully loaded in {:?}", start.elapsed());
                Ok(Arc::new(loaded))
            }
            Err(e) => {
                METRICS.inference.resource_load_failures.inc();
                let message = match e {
                    ChatGateError::ResourceLoad(message) => message,
                    other => other.to_string(),
                };
                error!("Model loading failed: {}", message);
                Err(message)
            }
        }
    }

    /// Resolve the end-of-sequence id and fix it into the generation config
    fn freeze(&self, resource: InferenceResource) -> Result<LoadedResource> {
        let eos_token_id = resource
            .tokenizer
            .eos_token_id()
            .or_else(|| resource.model.eos_token_id())
            .ok_or_else(|| ChatGateError::resource_load("no end-of-sequence token defined by tokenizer or model"))?;

        info!(
            "End-of-sequence token id {}, padding token id {:?}",
            eos_token_id,
            resource.tokenizer.pad_token_id()
        );

        Ok(LoadedResource {
            resource,
            generation: self.generation.clone().with_eos_token_id(eos_token_id),
        })
    }
}
