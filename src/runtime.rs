//! Runtime abstraction layer for the loader's background tasks
//!
//! The loader never calls `tokio::spawn` directly; it goes through an
//! [`AsyncSpawner`] so the embedding application decides which runtime (and
//! which handle) runs the fetch workers.

use crate::prelude::{Arc, Future, Pin};
use crate::{MapError, Result};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A trait for spawning async tasks (object-safe version)
pub trait AsyncSpawner: Send + Sync + 'static {
    fn spawn_boxed(
        &self,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn AsyncHandle>;
}

/// Handle to a spawned async task
pub trait AsyncHandle: Send + Sync {
    fn is_finished(&self) -> bool;

    fn cancel(&self);
}

/// Typed convenience over [`AsyncSpawner::spawn_boxed`]
pub fn spawn<F>(spawner: &dyn AsyncSpawner, future: F) -> Box<dyn AsyncHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    spawner.spawn_boxed(Box::pin(future))
}

/// Spawns onto a specific tokio runtime
#[derive(Debug, Clone)]
pub struct TokioSpawner {
    handle: Handle,
}

impl TokioSpawner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Spawner for the runtime the caller is running on
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|err| MapError::Runtime(err.to_string()))
    }

    pub fn shared_current() -> Result<Arc<dyn AsyncSpawner>> {
        Ok(Arc::new(Self::current()?))
    }
}

impl AsyncSpawner for TokioSpawner {
    fn spawn_boxed(
        &self,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) -> Box<dyn AsyncHandle> {
        Box::new(TokioHandle(self.handle.spawn(future)))
    }
}

struct TokioHandle(JoinHandle<()>);

impl AsyncHandle for TokioHandle {
    fn is_finished(&self) -> bool {
        self.0.is_finished()
    }

    fn cancel(&self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_tokio_spawner() {
        let spawner = TokioSpawner::current().unwrap();
        let handle = spawn(&spawner, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
        });

        assert!(!handle.is_finished());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_cancel() {
        let spawner = TokioSpawner::current().unwrap();
        let handle = spawn(&spawner, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_finished());
    }

    #[test]
    fn test_current_outside_runtime() {
        assert!(matches!(TokioSpawner::current(), Err(MapError::Runtime(_))));
    }
}
