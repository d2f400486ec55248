//! Dedicated pool for blocking inference work
//!
//! Tokenization, the forward passes and decoding are CPU-bound and must never
//! run on the async dispatch threads. Jobs are handed to a fixed-size rayon
//! pool and the caller awaits a oneshot completion.

use chatgate_common::error::{ChatGateError, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Fixed-size pool for blocking jobs
pub struct BlockingPool {
    pool: rayon::ThreadPool,
}

impl BlockingPool {
    /// Create a pool with `threads` workers (0 = CPU count)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("chatgate-infer-{}", index))
            .build()
            .map_err(|e| ChatGateError::config(format!("Failed to build worker pool: {}", e)))?;

        debug!("Blocking pool started with {} threads", pool.current_num_threads());

        Ok(Self { pool })
    }

    /// Number of worker threads
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `job` on the pool and wait for its result
    ///
    /// A panic inside the job becomes an inference error. If the caller stops
    /// waiting, the job still runs to completion and its result is dropped.
    pub async fn run<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            if tx.send(outcome).is_err() {
                debug!("Blocking job finished after its caller went away");
            }
        });

        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                warn!("Blocking job panicked: {}", message);
                Err(ChatGateError::inference(format!("worker panicked: {}", message)))
            }
            Err(_) => Err(ChatGateError::internal("worker pool dropped the job")),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
