use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single cancellable delayed action.
///
/// Scheduling replaces whatever was pending. Dropping the timer cancels it.
#[derive(Debug, Default)]
pub struct DebounceTimer {
    pending: Option<JoinHandle<()>>,
}

impl DebounceTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay`, cancelling any earlier schedule
    pub fn schedule<F, Fut>(&mut self, delay: Duration, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action().await;
        }));
    }

    /// Cancel the pending action. Returns true if one was still waiting.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                let waiting = !handle.is_finished();
                handle.abort();
                waiting
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
