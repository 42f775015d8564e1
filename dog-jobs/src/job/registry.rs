use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{Job, JobError};

/// Callback that performs the work named by a job
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<(), JobError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> Result<(), JobError> {
        (self)(job).await
    }
}

/// What `dispatch` did with a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    /// A handler ran and returned success
    Handled,
    /// No handler is registered for the name; the job was discarded
    NoHandler,
}

/// Name-keyed table of job handlers
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a handler with a job name, replacing any previous one
    pub fn register<H>(&self, name: impl Into<String>, handler: H)
    where
        H: JobHandler + 'static,
    {
        let name = name.into();
        let replaced = self.handlers.write().insert(name.clone(), Arc::new(handler));
        if replaced.is_some() {
            debug!(job = %name, "Replaced job handler");
        } else {
            debug!(job = %name, "Registered job handler");
        }
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        self.register(name, f);
    }

    /// Look up the handler for a name
    pub fn handler(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(name).cloned()
    }

    /// Check if a job name is registered
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// All registered job names, sorted
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the handler registered for `job.name`.
    ///
    /// Unknown names are logged and discarded. A panicking handler is
    /// reported as a retryable failure.
    pub async fn dispatch(&self, job: &Job) -> Result<Dispatched, JobError> {
        let Some(handler) = self.handler(&job.name) else {
            warn!(job = %job.name, "No handler registered for job, dropping it");
            return Ok(Dispatched::NoHandler);
        };

        match AssertUnwindSafe(handler.handle(job.clone())).catch_unwind().await {
            Ok(Ok(())) => Ok(Dispatched::Handled),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(JobError::Retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.registered_names())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
