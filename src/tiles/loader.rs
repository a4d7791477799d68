//! Background tile fetching
//!
//! [`TileLoader`] turns "tile wanted" requests into [`TileMatrix`] inserts.
//! A single dispatcher task keeps a priority queue of pending work and hands
//! tasks to workers while a semaphore permit is available. A worker resolves
//! one key through the tile store, then the provider, and commits the result
//! only if the loader generation it was started under is still current.
//!
//! Per key the loader walks `Requested → InFlight → {Succeeded, Failed}`;
//! retryable failures go back to the queue after the configured backoff.

use crate::core::config::SessionConfig;
use crate::core::constants::MAX_ZOOM;
use crate::core::geo::{PixelSize, TileKey};
use crate::prelude::{Arc, Duration, HashMap, Instant};
use crate::runtime::{spawn, AsyncHandle, AsyncSpawner};
use crate::tiles::decoder::TileDecoder;
use crate::tiles::failures::FailureLedger;
use crate::tiles::matrix::TileMatrix;
use crate::tiles::source::{FetchError, TileProvider};
use crate::tiles::store::TileStore;
use crate::tiles::tile::{Layer, Tile};
use crate::Result;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

/// Priority for tile loading (higher number = higher priority)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TilePriority {
    Background = 1,
    /// Ancestors and neighbours fetched ahead of need
    Prefetch = 10,
    /// One ring around visible area
    Adjacent = 50,
    #[default]
    Visible = 100,
}

/// Where a requested key currently is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Requested,
    InFlight,
    /// Decoded and stored in the matrix
    Succeeded,
    /// `terminal: false` while a retry is scheduled
    Failed { terminal: bool },
}

/// Notifications for the rendering consumer
#[derive(Debug, Clone, PartialEq)]
pub enum TileEvent {
    Loaded { key: TileKey, from_store: bool },
    /// Sent once per key, when its failure turns terminal
    LoadFailed { key: TileKey, error: FetchError },
    /// The loader went from idle to busy
    QueueStarted,
    /// Every outstanding request finished
    QueueDrained { elapsed: Duration },
}

/// Loader counters, updated lock-free by the workers
#[derive(Debug, Default)]
pub struct LoaderStats {
    requested: AtomicU64,
    deduplicated: AtomicU64,
    store_hits: AtomicU64,
    network_fetches: AtomicU64,
    retries: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    stale_dropped: AtomicU64,
    events_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderStatsSnapshot {
    pub requested: u64,
    pub deduplicated: u64,
    pub store_hits: u64,
    pub network_fetches: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stale_dropped: u64,
    /// Notifications discarded because the consumer fell behind
    pub events_dropped: u64,
}

impl LoaderStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> LoaderStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(AtomicOrdering::Relaxed);
        LoaderStatsSnapshot {
            requested: load(&self.requested),
            deduplicated: load(&self.deduplicated),
            store_hits: load(&self.store_hits),
            network_fetches: load(&self.network_fetches),
            retries: load(&self.retries),
            succeeded: load(&self.succeeded),
            failed: load(&self.failed),
            stale_dropped: load(&self.stale_dropped),
            events_dropped: load(&self.events_dropped),
        }
    }
}

/// A queued fetch of one key
#[derive(Debug, Clone)]
struct FetchTask {
    key: TileKey,
    priority: TilePriority,
    /// Sequence number for tie-breaking (lower = earlier)
    sequence: u64,
    generation: u64,
    attempt: u32,
}

impl PartialEq for FetchTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FetchTask {}

impl PartialOrd for FetchTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FetchTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier sequence number
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

struct ResolvedTile {
    tile: Tile,
    from_store: bool,
}

#[derive(Debug, Default)]
struct QueueActivity {
    outstanding: usize,
    busy_since: Option<Instant>,
}

/// Everything a loader needs, wired by the session
pub struct LoaderParts {
    pub config: SessionConfig,
    pub matrix: TileMatrix,
    pub ledger: Arc<FailureLedger>,
    pub provider: Arc<dyn TileProvider>,
    pub store: Option<Arc<dyn TileStore>>,
    pub decoder: Arc<dyn TileDecoder>,
    pub spawner: Arc<dyn AsyncSpawner>,
}

struct LoaderShared {
    config: SessionConfig,
    matrix: TileMatrix,
    ledger: Arc<FailureLedger>,
    store: Option<Arc<dyn TileStore>>,
    decoder: Arc<dyn TileDecoder>,
    spawner: Arc<dyn AsyncSpawner>,
    provider: RwLock<Arc<dyn TileProvider>>,
    /// Bumped under the `states` lock; commits compare against it under the same lock
    generation: AtomicU64,
    states: Mutex<HashMap<TileKey, FetchState>>,
    activity: Mutex<QueueActivity>,
    sequence: AtomicU64,
    task_tx: mpsc::UnboundedSender<FetchTask>,
    events: Sender<TileEvent>,
    /// Kept so the oldest event can be discarded when the channel is full
    event_rx: Receiver<TileEvent>,
    /// Active zoom and levels kept around it, once the session picked one
    zoom_window: Mutex<Option<(u8, u8)>>,
    stats: LoaderStats,
}

impl LoaderShared {
    fn lock_states(&self) -> MutexGuard<'_, HashMap<TileKey, FetchState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    fn provider(&self) -> Arc<dyn TileProvider> {
        self.provider
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn emit(&self, event: TileEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            // consumer fell behind, the oldest notification goes
            let _ = self.event_rx.try_recv();
            LoaderStats::bump(&self.stats.events_dropped);
            let _ = self.events.try_send(event);
        }
    }

    fn zoom_window(&self) -> Option<(u8, u8)> {
        *self.zoom_window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_started(&self) {
        let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        activity.outstanding += 1;
        if activity.outstanding == 1 {
            activity.busy_since = Some(Instant::now());
            self.emit(TileEvent::QueueStarted);
        }
    }

    fn task_finished(&self) {
        let drained = {
            let mut activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
            activity.outstanding = activity.outstanding.saturating_sub(1);
            if activity.outstanding == 0 {
                let elapsed = activity
                    .busy_since
                    .take()
                    .map(|since| since.elapsed())
                    .unwrap_or_default();
                log::debug!("tile queue drained in {:?}", elapsed);
                self.emit(TileEvent::QueueDrained { elapsed });
                true
            } else {
                false
            }
        };

        // late commits for levels the session already left are dropped here,
        // outside the activity lock since eviction waits for the matrix
        if drained {
            if let Some((zoom, levels_to_keep)) = self.zoom_window() {
                self.matrix.evict_outside_window(zoom, levels_to_keep);
            }
        }
    }

    fn drop_stale(&self, task: &FetchTask) {
        LoaderStats::bump(&self.stats.stale_dropped);
        log::trace!(
            "dropping tile {} from generation {} (now {})",
            task.key,
            task.generation,
            self.current_generation()
        );
        self.task_finished();
    }

    fn set_state(&self, task: &FetchTask, state: FetchState) {
        let mut states = self.lock_states();
        if task.generation == self.current_generation() {
            states.insert(task.key, state);
        }
    }

    async fn process(
        self: Arc<Self>,
        task: FetchTask,
        provider: Arc<dyn TileProvider>,
        permit: OwnedSemaphorePermit,
    ) {
        self.set_state(&task, FetchState::InFlight);
        let outcome = self.resolve(&provider, task.key).await;
        drop(permit);

        match outcome {
            Ok(resolved) => self.commit(&task, resolved),
            Err(error) => self.fail(task, error),
        }
    }

    fn commit(&self, task: &FetchTask, resolved: ResolvedTile) {
        let key = task.key;
        let current = || task.generation == self.current_generation();

        // the generation check runs under the matrix write lock, never under `states`
        if !self.matrix.put_if(key.zoom, key.pos, resolved.tile, current) {
            self.drop_stale(task);
            return;
        }
        {
            let mut states = self.lock_states();
            if current() {
                states.remove(&key);
            }
        }

        self.ledger.clear(&key);
        LoaderStats::bump(&self.stats.succeeded);
        log::debug!(
            "tile {} loaded{}",
            key,
            if resolved.from_store { " from store" } else { "" }
        );
        self.emit(TileEvent::Loaded {
            key,
            from_store: resolved.from_store,
        });
        self.task_finished();
    }

    fn fail(self: &Arc<Self>, task: FetchTask, error: FetchError) {
        let key = task.key;
        let mut states = self.lock_states();
        if task.generation != self.current_generation() {
            drop(states);
            self.drop_stale(&task);
            return;
        }
        if error == FetchError::Cancelled {
            states.remove(&key);
            drop(states);
            self.task_finished();
            return;
        }

        let record = if error.is_terminal() {
            self.ledger.record_terminal(key, error.to_string())
        } else {
            self.ledger.record_failure(key, error.to_string())
        };

        if record.terminal {
            states.remove(&key);
            drop(states);
            LoaderStats::bump(&self.stats.failed);
            log::warn!(
                "tile {} failed after {} attempt(s), {} retries: {}",
                key,
                record.attempts,
                record.retries(),
                error
            );
            self.emit(TileEvent::LoadFailed { key, error });
            self.task_finished();
            return;
        }

        states.insert(key, FetchState::Failed { terminal: false });
        drop(states);
        LoaderStats::bump(&self.stats.retries);

        let delay = self.config.retry_delay(record.attempts);
        log::debug!(
            "tile {} failed ({}), retry {} of {} in {:?}",
            key,
            error,
            record.attempts,
            self.ledger.retry_cap(),
            delay
        );

        let retry = FetchTask {
            sequence: self.next_sequence(),
            attempt: task.attempt + 1,
            ..task
        };
        let shared = Arc::clone(self);
        spawn(self.spawner.as_ref(), async move {
            tokio::time::sleep(delay).await;
            shared.resubmit(retry);
        });
    }

    fn resubmit(&self, task: FetchTask) {
        let mut states = self.lock_states();
        if task.generation != self.current_generation() {
            drop(states);
            self.drop_stale(&task);
            return;
        }
        let key = task.key;
        states.insert(key, FetchState::Requested);
        if self.task_tx.send(task).is_err() {
            states.remove(&key);
            drop(states);
            self.task_finished();
        }
    }

    /// Base layer plus overlays; a failing overlay is left out of the tile
    async fn resolve(
        &self,
        provider: &Arc<dyn TileProvider>,
        key: TileKey,
    ) -> std::result::Result<ResolvedTile, FetchError> {
        let overlays = provider.overlays();
        let (base, overlay_results) = futures::join!(
            self.load_layer(provider.as_ref(), key),
            join_all(
                overlays
                    .iter()
                    .map(|overlay| self.load_layer(overlay.as_ref(), key))
            )
        );

        let (base_layer, mut from_store) = base?;
        let mut layers = Vec::with_capacity(1 + overlays.len());
        layers.push(base_layer);

        for (overlay, result) in overlays.iter().zip(overlay_results) {
            match result {
                Ok((layer, hit)) => {
                    from_store &= hit;
                    layers.push(layer);
                }
                Err(err) => log::warn!("overlay {} missing for tile {}: {}", overlay.id(), key, err),
            }
        }

        Ok(ResolvedTile {
            tile: Tile::with_layers(key, layers),
            from_store,
        })
    }

    async fn load_layer(
        &self,
        provider: &dyn TileProvider,
        key: TileKey,
    ) -> std::result::Result<(Layer, bool), FetchError> {
        let spec = provider.spec();
        spec.check_zoom(key.zoom)?;

        let id: Arc<str> = Arc::from(spec.id.as_str());
        let tile_size = provider.projection().tile_size();
        let mode = self.config.access_mode;

        if mode.reads_store() {
            if let Some(bytes) = self.read_store(&spec.id, key).await {
                match self.decode_layer(&id, &bytes, tile_size) {
                    Ok(layer) => {
                        LoaderStats::bump(&self.stats.store_hits);
                        return Ok((layer, true));
                    }
                    Err(err) => log::warn!(
                        "stored tile {} of {} is unreadable, fetching again: {}",
                        key,
                        spec.id,
                        err
                    ),
                }
            }
        }

        if !mode.uses_network() {
            return Err(FetchError::NotFound);
        }

        LoaderStats::bump(&self.stats.network_fetches);
        let timeout = self.config.fetch_timeout();
        let bytes = match tokio::time::timeout(timeout, provider.fetch_tile_bytes(key)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Transient(format!(
                    "no answer within {:?}",
                    timeout
                )))
            }
        };

        let layer = self.decode_layer(&id, &bytes, tile_size)?;
        if mode.writes_store() && !bytes.is_empty() {
            self.write_store(&spec.id, key, bytes).await;
        }
        Ok((layer, false))
    }

    fn decode_layer(
        &self,
        id: &Arc<str>,
        bytes: &[u8],
        tile_size: PixelSize,
    ) -> std::result::Result<Layer, FetchError> {
        if bytes.is_empty() {
            return Ok(Layer::blank(id.clone()));
        }
        let image = self.decoder.decode(bytes, tile_size)?;
        Ok(Layer::new(id.clone(), image))
    }

    /// Store failures are logged and count as a miss
    async fn read_store(&self, provider: &str, key: TileKey) -> Option<Vec<u8>> {
        let store = self.store.clone()?;
        let provider = provider.to_string();
        match tokio::task::spawn_blocking(move || store.get(&provider, &key)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(err)) => {
                log::warn!("tile store read failed for {}: {}", key, err);
                None
            }
            Err(err) => {
                log::warn!("tile store read task failed for {}: {}", key, err);
                None
            }
        }
    }

    async fn write_store(&self, provider: &str, key: TileKey, bytes: Vec<u8>) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let provider = provider.to_string();
        match tokio::task::spawn_blocking(move || store.put(&provider, &key, &bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("tile store write failed for {}: {}", key, err),
            Err(err) => log::warn!("tile store write task failed for {}: {}", key, err),
        }
    }
}

/// Background worker that feeds queued tasks to the fetch workers
struct Dispatcher {
    shared: Arc<LoaderShared>,
    task_rx: mpsc::UnboundedReceiver<FetchTask>,
    queue: BinaryHeap<FetchTask>,
    /// Bounds concurrent fetches
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    async fn run(mut self) {
        log::debug!(
            "tile dispatcher starting with concurrency {}",
            self.shared.config.concurrency
        );

        loop {
            tokio::select! {
                received = self.task_rx.recv() => match received {
                    Some(task) => {
                        self.queue.push(task);
                        while let Ok(task) = self.task_rx.try_recv() {
                            self.queue.push(task);
                        }
                    }
                    None => break,
                },
                permit = self.semaphore.clone().acquire_owned(), if !self.queue.is_empty() => {
                    let Ok(permit) = permit else { break };
                    if let Some(task) = self.queue.pop() {
                        self.dispatch(task, permit);
                    }
                }
            }
        }

        log::debug!("tile dispatcher exiting");
    }

    fn dispatch(&self, task: FetchTask, permit: OwnedSemaphorePermit) {
        if task.generation != self.shared.current_generation() {
            self.shared.drop_stale(&task);
            return;
        }
        let provider = self.shared.provider();
        let shared = self.shared.clone();
        log::trace!("starting fetch of tile {} (attempt {})", task.key, task.attempt + 1);
        spawn(self.shared.spawner.as_ref(), async move {
            shared.process(task, provider, permit).await;
        });
    }
}

/// Async tile loader with bounded concurrency and a priority queue
pub struct TileLoader {
    shared: Arc<LoaderShared>,
    dispatcher: Box<dyn AsyncHandle>,
}

impl TileLoader {
    /// Validates the config and starts the dispatcher on `parts.spawner`
    pub fn new(parts: LoaderParts) -> Result<Self> {
        parts.config.validate()?;

        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = bounded(parts.config.event_capacity);
        let concurrency = parts.config.concurrency;

        let shared = Arc::new(LoaderShared {
            config: parts.config,
            matrix: parts.matrix,
            ledger: parts.ledger,
            store: parts.store,
            decoder: parts.decoder,
            spawner: parts.spawner,
            provider: RwLock::new(parts.provider),
            generation: AtomicU64::new(0),
            states: Mutex::new(HashMap::default()),
            activity: Mutex::new(QueueActivity::default()),
            sequence: AtomicU64::new(0),
            task_tx,
            events: event_tx,
            event_rx,
            zoom_window: Mutex::new(None),
            stats: LoaderStats::default(),
        });

        let dispatcher = Dispatcher {
            shared: shared.clone(),
            task_rx,
            queue: BinaryHeap::new(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
        };
        let dispatcher = spawn(shared.spawner.as_ref(), dispatcher.run());

        Ok(Self { shared, dispatcher })
    }

    /// Enqueues `key` unless it is already pending, loaded, terminally
    /// failed or off the provider's grid. Returns whether work was queued.
    ///
    /// Only takes the matrix read lock recursively, so it may be called while
    /// a [`crate::tiles::matrix::MatrixView`] is held.
    pub fn request(&self, key: TileKey, priority: TilePriority) -> bool {
        let shared = &self.shared;
        LoaderStats::bump(&shared.stats.requested);

        if key.zoom > MAX_ZOOM {
            log::trace!("tile {} is past the deepest zoom level", key);
            return false;
        }
        if !shared.provider().projection().contains_tile(key.zoom, key.pos) {
            log::trace!("tile {} is off the grid", key);
            return false;
        }
        if shared.matrix.contains(&key) || shared.ledger.is_terminal(&key) {
            LoaderStats::bump(&shared.stats.deduplicated);
            return false;
        }

        let mut states = shared.lock_states();
        if states.contains_key(&key) {
            LoaderStats::bump(&shared.stats.deduplicated);
            return false;
        }

        let task = FetchTask {
            key,
            priority,
            sequence: shared.next_sequence(),
            generation: shared.current_generation(),
            attempt: 0,
        };
        states.insert(key, FetchState::Requested);
        shared.task_started();

        if shared.task_tx.send(task).is_err() {
            log::warn!("tile dispatcher is gone, dropping request for {}", key);
            states.remove(&key);
            drop(states);
            shared.task_finished();
            return false;
        }
        true
    }

    /// Queues keys in iteration order; returns how many were accepted
    pub fn request_many<I>(&self, keys: I, priority: TilePriority) -> usize
    where
        I: IntoIterator<Item = TileKey>,
    {
        keys.into_iter()
            .filter(|key| self.request(*key, priority))
            .count()
    }

    /// Receiver of loader notifications; clones share one bounded queue
    /// that drops its oldest entries once full
    pub fn events(&self) -> Receiver<TileEvent> {
        self.shared.event_rx.clone()
    }

    /// Makes `zoom` the active level and evicts levels outside the window
    /// around it. The window is applied again each time the queue drains, so
    /// tiles of other levels that land late do not linger. Returns the
    /// number of tiles dropped now.
    pub fn set_zoom_window(&self, zoom: u8, levels_to_keep: u8) -> usize {
        *self
            .shared
            .zoom_window
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((zoom, levels_to_keep));
        self.shared.matrix.evict_outside_window(zoom, levels_to_keep)
    }

    pub fn state(&self, key: &TileKey) -> Option<FetchState> {
        if let Some(state) = self.shared.lock_states().get(key) {
            return Some(*state);
        }
        if self.shared.ledger.is_terminal(key) {
            Some(FetchState::Failed { terminal: true })
        } else if self.shared.matrix.contains(key) {
            Some(FetchState::Succeeded)
        } else {
            None
        }
    }

    /// Requests not yet finished, retries and stale work included
    pub fn pending_count(&self) -> usize {
        self.shared
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .outstanding
    }

    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    pub fn stats(&self) -> LoaderStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn generation(&self) -> u64 {
        self.shared.current_generation()
    }

    pub fn provider(&self) -> Arc<dyn TileProvider> {
        self.shared.provider()
    }

    /// Drops every queued and in-flight request; their results are discarded
    pub fn cancel_pending(&self) -> u64 {
        self.bump_generation(|| {})
    }

    /// Forgets every loaded tile and failure, then starts a new generation
    pub fn reload(&self) -> u64 {
        self.bump_generation(|| {
            self.shared.matrix.clear();
            self.shared.ledger.clear_all();
        })
    }

    /// Switches the provider; everything loaded from the old one is dropped
    pub fn set_provider(&self, provider: Arc<dyn TileProvider>) -> u64 {
        log::info!("switching tile provider to {}", provider.id());
        self.bump_generation(|| {
            *self
                .shared
                .provider
                .write()
                .unwrap_or_else(PoisonError::into_inner) = provider;
            self.shared.matrix.clear();
            self.shared.ledger.clear_all();
        })
    }

    /// `reset` runs after `states` is released; commits re-check the
    /// generation under the matrix write lock, so nothing stale survives it.
    fn bump_generation(&self, reset: impl FnOnce()) -> u64 {
        let mut states = self.shared.lock_states();
        let generation = self.shared.generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let dropped = states.len();
        states.clear();
        drop(states);
        reset();

        log::debug!(
            "loader generation {} ({} pending requests discarded)",
            generation,
            dropped
        );
        generation
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.dispatcher.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AccessMode;
    use crate::runtime::TokioSpawner;
    use crate::tiles::decoder::RawDecoder;
    use crate::tiles::source::ProviderSpec;
    use crate::tiles::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    type Script = dyn Fn(TileKey, usize) -> std::result::Result<Vec<u8>, FetchError> + Send + Sync;

    struct ScriptedProvider {
        spec: ProviderSpec,
        calls: AtomicUsize,
        script: Box<Script>,
    }

    impl std::fmt::Debug for ScriptedProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptedProvider").field("spec", &self.spec).finish()
        }
    }

    impl ScriptedProvider {
        fn new(
            id: &str,
            script: impl Fn(TileKey, usize) -> std::result::Result<Vec<u8>, FetchError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                spec: ProviderSpec::new(id, id, "mock://{z}/{x}/{y}"),
                calls: AtomicUsize::new(0),
                script: Box::new(script),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl TileProvider for ScriptedProvider {
        fn spec(&self) -> &ProviderSpec {
            &self.spec
        }

        async fn fetch_tile_bytes(&self, key: TileKey) -> std::result::Result<Vec<u8>, FetchError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            (self.script)(key, call)
        }
    }

    fn loader_with(
        provider: Arc<dyn TileProvider>,
        store: Option<Arc<dyn TileStore>>,
        config: SessionConfig,
    ) -> (TileLoader, TileMatrix, Arc<FailureLedger>) {
        let matrix = TileMatrix::new();
        let ledger = Arc::new(FailureLedger::new(
            config.retry_cap,
            config.failure_ledger_capacity,
        ));
        let loader = TileLoader::new(LoaderParts {
            config,
            matrix: matrix.clone(),
            ledger: ledger.clone(),
            provider,
            store,
            decoder: Arc::new(RawDecoder),
            spawner: TokioSpawner::shared_current().unwrap(),
        })
        .unwrap();
        (loader, matrix, ledger)
    }

    /// Collects events until `done` matches one or the timeout expires
    async fn collect_until(
        events: &Receiver<TileEvent>,
        done: impl Fn(&TileEvent) -> bool,
    ) -> Vec<TileEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            while let Ok(event) = events.try_recv() {
                let finished = done(&event);
                seen.push(event);
                if finished {
                    return seen;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for tile events, got {:?}", seen);
    }

    fn drained(event: &TileEvent) -> bool {
        matches!(event, TileEvent::QueueDrained { .. })
    }

    #[test]
    fn test_task_ordering() {
        let task = |priority, sequence| FetchTask {
            key: TileKey::from_xyz(sequence as i64, 0, 3),
            priority,
            sequence,
            generation: 0,
            attempt: 0,
        };
        let mut heap = BinaryHeap::new();
        heap.push(task(TilePriority::Background, 0));
        heap.push(task(TilePriority::Visible, 3));
        heap.push(task(TilePriority::Visible, 1));
        heap.push(task(TilePriority::Adjacent, 2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.sequence)).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[tokio::test]
    async fn test_loads_and_writes_through() {
        let provider = ScriptedProvider::new("osm", |_, _| Ok(b"tile".to_vec()));
        let store = Arc::new(MemoryStore::new());
        let (loader, matrix, _) = loader_with(
            provider.clone(),
            Some(store.clone()),
            SessionConfig::for_testing(),
        );
        let events = loader.events();
        let key = TileKey::from_xyz(1, 1, 2);

        assert!(loader.request(key, TilePriority::Visible));
        let seen = collect_until(&events, drained).await;

        assert_eq!(seen.first(), Some(&TileEvent::QueueStarted));
        assert!(seen.contains(&TileEvent::Loaded {
            key,
            from_store: false
        }));
        assert!(matrix.contains(&key));
        assert_eq!(store.get("osm", &key).unwrap(), Some(b"tile".to_vec()));
        assert_eq!(loader.state(&key), Some(FetchState::Succeeded));
        assert_eq!(provider.calls(), 1);

        // already loaded, nothing to do
        assert!(!loader.request(key, TilePriority::Visible));
        assert_eq!(loader.stats().deduplicated, 1);
    }

    #[tokio::test]
    async fn test_store_hit_skips_network() {
        let provider = ScriptedProvider::new("osm", |_, _| Err(FetchError::NotFound));
        let store = Arc::new(MemoryStore::new());
        let key = TileKey::from_xyz(0, 0, 1);
        store.put("osm", &key, b"cached").unwrap();

        let (loader, matrix, _) =
            loader_with(provider.clone(), Some(store), SessionConfig::for_testing());
        let events = loader.events();

        loader.request(key, TilePriority::Visible);
        let seen = collect_until(&events, drained).await;

        assert!(seen.contains(&TileEvent::Loaded {
            key,
            from_store: true
        }));
        assert!(matrix.contains(&key));
        assert_eq!(provider.calls(), 0);
        assert_eq!(loader.stats().store_hits, 1);
    }

    #[tokio::test]
    async fn test_cache_only_mode_never_fetches() {
        let provider = ScriptedProvider::new("osm", |_, _| Ok(b"tile".to_vec()));
        let config = SessionConfig {
            access_mode: AccessMode::CacheOnly,
            ..SessionConfig::for_testing()
        };
        let (loader, matrix, ledger) = loader_with(provider.clone(), None, config);
        let events = loader.events();
        let key = TileKey::from_xyz(0, 0, 0);

        loader.request(key, TilePriority::Visible);
        let seen = collect_until(&events, drained).await;

        assert!(seen.contains(&TileEvent::LoadFailed {
            key,
            error: FetchError::NotFound
        }));
        assert!(!matrix.contains(&key));
        assert!(ledger.is_terminal(&key));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers() {
        let provider = ScriptedProvider::new("osm", |_, call| {
            if call == 0 {
                Err(FetchError::Transient("reset".into()))
            } else {
                Ok(b"tile".to_vec())
            }
        });
        let (loader, matrix, ledger) =
            loader_with(provider.clone(), None, SessionConfig::for_testing());
        let events = loader.events();
        let key = TileKey::from_xyz(3, 3, 3);

        loader.request(key, TilePriority::Visible);
        let seen = collect_until(&events, drained).await;

        assert!(seen.iter().any(|e| matches!(e, TileEvent::Loaded { .. })));
        assert!(!seen.iter().any(|e| matches!(e, TileEvent::LoadFailed { .. })));
        assert!(matrix.contains(&key));
        assert!(ledger.get(&key).is_none());
        assert_eq!(provider.calls(), 2);
        assert_eq!(loader.stats().retries, 1);
    }

    #[tokio::test]
    async fn test_decode_error_is_terminal() {
        #[derive(Debug)]
        struct Rejecting;
        impl TileDecoder for Rejecting {
            fn decode(
                &self,
                _: &[u8],
                _: PixelSize,
            ) -> std::result::Result<crate::tiles::tile::TileImage, FetchError> {
                Err(FetchError::Decode("corrupt".into()))
            }
        }

        let matrix = TileMatrix::new();
        let ledger = Arc::new(FailureLedger::new(3, 16));
        let loader = TileLoader::new(LoaderParts {
            config: SessionConfig::for_testing(),
            matrix: matrix.clone(),
            ledger: ledger.clone(),
            provider: ScriptedProvider::new("osm", |_, _| Ok(b"garbage".to_vec())),
            store: None,
            decoder: Arc::new(Rejecting),
            spawner: TokioSpawner::shared_current().unwrap(),
        })
        .unwrap();
        let events = loader.events();
        let key = TileKey::from_xyz(0, 1, 1);

        loader.request(key, TilePriority::Visible);
        collect_until(&events, drained).await;
        assert_eq!(ledger.get(&key).map(|r| (r.attempts, r.terminal)), Some((1, true)));
        assert!(!matrix.contains(&key));
    }

    #[tokio::test]
    async fn test_blank_payload_resolves_blank_tile() {
        let provider = ScriptedProvider::new("osm", |_, _| Ok(Vec::new()));
        let (loader, matrix, _) = loader_with(provider, None, SessionConfig::for_testing());
        let events = loader.events();
        let key = TileKey::from_xyz(1, 0, 1);

        loader.request(key, TilePriority::Visible);
        collect_until(&events, drained).await;

        let tile = matrix.get(key.zoom, key.pos);
        assert!(tile.not_empty());
        assert!(tile.is_blank());
    }

    #[tokio::test]
    async fn test_zoom_outside_provider_range() {
        let provider = Arc::new(ScriptedProvider {
            spec: ProviderSpec::new("osm", "osm", "mock://").with_zoom_range(0, 3),
            calls: AtomicUsize::new(0),
            script: Box::new(|_, _| Ok(b"tile".to_vec())),
        });
        let (loader, _, _) = loader_with(provider.clone(), None, SessionConfig::for_testing());
        let events = loader.events();
        let key = TileKey::from_xyz(0, 0, 5);

        loader.request(key, TilePriority::Visible);
        let seen = collect_until(&events, drained).await;

        assert!(seen.contains(&TileEvent::LoadFailed {
            key,
            error: FetchError::ZoomOutOfRange {
                zoom: 5,
                min: 0,
                max: 3
            }
        }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_off_grid_request_is_ignored() {
        let provider = ScriptedProvider::new("osm", |_, _| Ok(b"tile".to_vec()));
        let (loader, _, _) = loader_with(provider, None, SessionConfig::for_testing());
        assert!(!loader.request(TileKey::from_xyz(2, 0, 1), TilePriority::Visible));
        assert!(!loader.request(TileKey::from_xyz(-1, 0, 1), TilePriority::Visible));
        assert!(loader.is_idle());
    }

    #[tokio::test]
    async fn test_overlay_layers_composited() {
        #[derive(Debug)]
        struct WithOverlay {
            spec: ProviderSpec,
            overlay: Arc<dyn TileProvider>,
        }

        #[async_trait]
        impl TileProvider for WithOverlay {
            fn spec(&self) -> &ProviderSpec {
                &self.spec
            }

            async fn fetch_tile_bytes(
                &self,
                _: TileKey,
            ) -> std::result::Result<Vec<u8>, FetchError> {
                Ok(b"base".to_vec())
            }

            fn overlays(&self) -> Vec<Arc<dyn TileProvider>> {
                vec![self.overlay.clone()]
            }
        }

        let provider = Arc::new(WithOverlay {
            spec: ProviderSpec::new("base", "base", "mock://"),
            overlay: ScriptedProvider::new("labels", |_, _| Ok(b"labels".to_vec())),
        });
        let (loader, matrix, _) = loader_with(provider, None, SessionConfig::for_testing());
        let events = loader.events();
        let key = TileKey::from_xyz(0, 0, 0);

        loader.request(key, TilePriority::Visible);
        collect_until(&events, drained).await;

        let tile = matrix.get(0, key.pos);
        let ids: Vec<&str> = tile.layers().iter().map(|l| &*l.provider_id).collect();
        assert_eq!(ids, vec!["base", "labels"]);
    }
}
