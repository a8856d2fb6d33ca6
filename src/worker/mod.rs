//! WorkerAdapter contract and variants (spec §4.6, §9 "duck-typed adapter
//! polymorphism" note: tagged variants, shared process-based template).

mod cli_adapter;
mod mock;

pub use cli_adapter::CliWorkerAdapter;
pub use mock::{MockAdapter, MockBehavior};

use crate::model::{WorkerEvent, WorkerHandle, WorkerResult, WorkerTask};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Every adapter exposes this contract (spec §4.6). Implemented as a
/// trait object behind an enum-dispatched registry (`AdapterRegistry`)
/// rather than an ambient global, per spec §9.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    fn kind(&self) -> crate::model::WorkerKind;

    async fn start_task(&self, task: WorkerTask) -> Result<WorkerHandle, crate::error::WorkerError>;

    /// Lazily streams events for an already-started handle. Adapters that
    /// support streaming return a stream of `WorkerEvent`; a handle that
    /// was already fully consumed via `await_result` returns an empty
    /// stream (the `{unread|streaming|streamed}` state machine of spec §9).
    fn stream_events(&self, handle: &WorkerHandle) -> BoxStream<'static, WorkerEvent>;

    async fn cancel(&self, handle: &WorkerHandle);

    async fn await_result(&self, handle: WorkerHandle) -> WorkerResult;
}

/// A small closed registry keyed by `WorkerKind`, matching spec §9's
/// "duck-typed adapter polymorphism" guidance: the set of adapters is
/// small, closed, and keyed by an enum.
pub struct AdapterRegistry {
    adapters: std::collections::HashMap<crate::model::WorkerKind, std::sync::Arc<dyn WorkerAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: std::collections::HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: std::sync::Arc<dyn WorkerAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: crate::model::WorkerKind) -> Option<std::sync::Arc<dyn WorkerAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
