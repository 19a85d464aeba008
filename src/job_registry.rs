use crate::BackgroundJob;
use crate::job::JobError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// A type-erased handler: context and payload in, outcome out.
pub type RunTaskFn<Context> =
    dyn Fn(Context, Value) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync;

/// Maps handler names to the code that executes them.
///
/// Built up front and shared read-only by every worker once the runner starts.
pub struct JobRegistry<Context> {
    entries: HashMap<String, Arc<RunTaskFn<Context>>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<Context> std::fmt::Debug for JobRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("handlers", &self.handlers())
            .finish()
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    /// Register a typed job under its `JOB_NAME`.
    pub fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        self.entries
            .insert(J::JOB_NAME.to_string(), Arc::new(runnable::<J>));
    }

    /// Register a handler that works on the raw JSON payload.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let run: Arc<RunTaskFn<Context>> =
            Arc::new(move |ctx, payload| handler(ctx, payload).boxed());
        self.entries.insert(name.into(), run);
    }
}

impl<Context> JobRegistry<Context> {
    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<&RunTaskFn<Context>> {
        self.entries.get(name).map(|run| &**run)
    }

    /// Registered handler names, sorted.
    pub fn handlers(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    payload: Value,
) -> BoxFuture<'static, Result<(), JobError>> {
    async move {
        let job: J = serde_json::from_value(payload)
            .map_err(|error| JobError::Terminal(anyhow::Error::new(error).context("invalid payload")))?;
        job.run(ctx).await
    }
    .boxed()
}
