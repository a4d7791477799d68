//! Helpers shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tilepyramid::prelude::*;
use tilepyramid::tiles::RawDecoder;

type Behavior = dyn Fn(TileKey) -> std::result::Result<Vec<u8>, FetchError> + Send + Sync;

/// Provider answering from a closure, counting every fetch
pub struct MockProvider {
    spec: ProviderSpec,
    delay: Duration,
    behavior: Box<Behavior>,
    calls: AtomicUsize,
    fetched: Mutex<Vec<TileKey>>,
}

impl fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockProvider")
            .field("id", &self.spec.id)
            .field("calls", &self.calls())
            .finish()
    }
}

impl MockProvider {
    pub fn new(
        id: &str,
        behavior: impl Fn(TileKey) -> std::result::Result<Vec<u8>, FetchError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            spec: ProviderSpec::new(id, id, "mock://{z}/{x}/{y}"),
            delay: Duration::ZERO,
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            fetched: Mutex::new(Vec::new()),
        }
    }

    /// Answers every key with `<id>/<z>/<x>/<y>`
    pub fn serving(id: &str) -> Self {
        let prefix = id.to_string();
        Self::new(id, move |key| Ok(tile_bytes(&prefix, key)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_spec(mut self, spec: ProviderSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<TileKey> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl TileProvider for MockProvider {
    fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    async fn fetch_tile_bytes(&self, key: TileKey) -> std::result::Result<Vec<u8>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fetched.lock().unwrap().push(key);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behavior)(key)
    }
}

pub fn tile_bytes(provider: &str, key: TileKey) -> Vec<u8> {
    format!("{}/{}/{}/{}", provider, key.zoom, key.pos.x, key.pos.y).into_bytes()
}

/// Fast retries so failure paths finish quickly
pub fn test_config() -> SessionConfig {
    SessionConfig::for_testing()
}

pub fn session(provider: Arc<MockProvider>, config: SessionConfig) -> MapSession {
    MapSession::builder(provider)
        .with_config(config)
        .with_decoder(Arc::new(RawDecoder))
        .build()
        .unwrap()
}

pub fn session_with_store(
    provider: Arc<MockProvider>,
    store: Arc<dyn TileStore>,
    config: SessionConfig,
) -> MapSession {
    MapSession::builder(provider)
        .with_config(config)
        .with_store(store)
        .with_decoder(Arc::new(RawDecoder))
        .build()
        .unwrap()
}

/// Bytes held by the first layer of a loaded tile
pub fn layer_bytes(tile: &TileForDraw) -> Vec<u8> {
    tile.image()
        .and_then(|image| image.downcast_ref::<Arc<[u8]>>())
        .map(|bytes| bytes.to_vec())
        .unwrap_or_default()
}

/// Collects events until the queue drains or five seconds pass
pub async fn wait_drained(events: &Receiver<TileEvent>) -> Vec<TileEvent> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        while let Ok(event) = events.try_recv() {
            let drained = matches!(event, TileEvent::QueueDrained { .. });
            seen.push(event);
            if drained {
                return seen;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never drained, events so far: {:?}", seen);
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
