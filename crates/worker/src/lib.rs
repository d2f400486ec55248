//! ChatGate Worker
//!
//! Bounded-concurrency text generation: an admission gate in front of a lazily
//! loaded tokenizer/model pair, with every CPU-bound step run on a dedicated
//! blocking pool.

pub mod gate;
pub mod generation;
pub mod inference;
pub mod loader;
pub mod model;
pub mod pool;
pub mod service;
pub mod tokenizer;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use gate::{AdmissionGate, AdmissionPermit};
pub use inference::GenerationResult;
pub use loader::{InferenceResource, LoadedResource, PretrainedSource, ResourceLoader, ResourceSource};
pub use model::{Gpt2Model, LanguageModel};
pub use pool::BlockingPool;
pub use service::ChatService;
pub use tokenizer::{ChatTokenizer, TokenCodec};
