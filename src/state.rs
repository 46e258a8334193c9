use crate::error::DbError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared engine state used to surface asynchronous failures.
///
/// The background log writer cannot return errors to the transaction that
/// produced a page, so it hands them here. Higher layers inspect
/// `last_error` to decide whether to mark the datafile invalid and refuse
/// further work.
#[derive(Debug, Default)]
pub struct EngineState {
    last_error: Mutex<Option<Arc<DbError>>>,
    handled: AtomicUsize,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an asynchronous failure. Only the first error is kept; later
    /// ones are logged and dropped.
    pub fn handle(&self, err: Arc<DbError>) {
        tracing::error!(error = %err, "async storage failure");
        self.handled.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.last_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub fn last_error(&self) -> Option<Arc<DbError>> {
        self.last_error.lock().clone()
    }

    /// Number of failures routed through `handle`.
    pub fn error_count(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}
