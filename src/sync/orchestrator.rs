//! Orchestrates the cache, bundled snapshot and remote authority.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::result::Loaded;
use super::ttl::TtlPolicy;
use crate::cache::{CacheStorage, CacheStore};
use crate::content::{ContentPayload, ContentUpdate};
use crate::error::{Error, Result};
use crate::source::{BundledSource, RemoteSource};
use crate::version::is_newer;

/// Buffered update notifications per subscriber before it starts lagging
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// A remote fetch shared by every caller waiting on the same resource id.
type FetchOp = Shared<BoxFuture<'static, Result<Fetched>>>;

/// A settled fetch and whether settling it already broadcast an update.
#[derive(Debug, Clone)]
struct Fetched {
  payload: ContentPayload,
  announced: bool,
}

/// What happens to a successful fetch before it is handed to waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
  /// Last-resort load: persist, no notification
  Foreground,
  /// Stale-while-revalidate: persist, notify only when newer
  Revalidate,
  /// Explicit refresh: persist and always notify
  Forced,
}

struct InFlight {
  generation: u64,
  op: FetchOp,
}

/// Stale-while-revalidate loader for reference content.
///
/// Resolution order for `load`: fresh cache entry, bundled snapshot, then a
/// blocking remote fetch with the stale cache entry as the last resort. Every
/// cache or bundle hit also starts a background revalidation, which persists
/// the fetched payload and broadcasts a `ContentUpdate` when it is newer.
///
/// At most one fetch per resource id is in flight; later callers attach to it.
pub struct SyncOrchestrator<S: CacheStorage + 'static> {
  inner: Arc<Inner<S>>,
}

struct Inner<S: CacheStorage + 'static> {
  cache: CacheStore<S>,
  bundled: Arc<dyn BundledSource>,
  remote: Arc<dyn RemoteSource>,
  ttl: TtlPolicy,
  in_flight: Mutex<HashMap<String, InFlight>>,
  next_generation: AtomicU64,
  updates: broadcast::Sender<ContentUpdate>,
}

impl<S: CacheStorage + 'static> SyncOrchestrator<S> {
  pub fn new(
    cache: CacheStore<S>,
    bundled: Arc<dyn BundledSource>,
    remote: Arc<dyn RemoteSource>,
    ttl: TtlPolicy,
  ) -> Self {
    let (updates, _rx) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

    Self {
      inner: Arc::new(Inner {
        cache,
        bundled,
        remote,
        ttl,
        in_flight: Mutex::new(HashMap::new()),
        next_generation: AtomicU64::new(0),
        updates,
      }),
    }
  }

  /// Subscribe to update notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<ContentUpdate> {
    self.inner.updates.subscribe()
  }

  pub fn cache(&self) -> &CacheStore<S> {
    &self.inner.cache
  }

  /// Number of fetches currently outstanding.
  pub fn in_flight_count(&self) -> usize {
    self.inner.lock_in_flight().len()
  }

  /// Load content for `resource_id`.
  pub async fn load(&self, resource_id: &str) -> Result<ContentPayload> {
    Ok(self.load_with_source(resource_id).await?.payload)
  }

  /// Load content for `resource_id`, reporting which tier answered.
  pub async fn load_with_source(&self, resource_id: &str) -> Result<Loaded> {
    let cached = self.inner.cache.read(resource_id);

    if let Some(entry) = &cached {
      if entry.is_fresh() {
        debug!(resource_id, version = %entry.payload.version, "Serving fresh cache entry");
        self.schedule_revalidation(resource_id);
        return Ok(Loaded::from_cache(entry.payload.clone(), entry.fetched_at));
      }
      debug!(resource_id, expires_at = entry.expires_at, "Cache entry is stale");
    }

    match self.inner.bundled.get(resource_id) {
      Ok(Some(payload)) => {
        debug!(resource_id, version = %payload.version, "Serving bundled payload");
        self.schedule_revalidation(resource_id);
        return Ok(Loaded::bundled(payload));
      }
      Ok(None) => {}
      Err(e) => warn!(resource_id, error = %e, "Ignoring unreadable bundled payload"),
    }

    let (op, _) = self.start_or_join(resource_id, FetchMode::Foreground);
    match op.await {
      Ok(fetched) => Ok(Loaded::from_network(fetched.payload)),
      Err(e) => match cached {
        Some(entry) => {
          warn!(resource_id, error = %e, "Remote unavailable, serving stale cache entry");
          Ok(Loaded::offline(entry.payload, entry.fetched_at))
        }
        None => Err(Error::unavailable(resource_id, Some(e))),
      },
    }
  }

  /// Fetch from the authority regardless of freshness.
  ///
  /// On success the cache is overwritten without a version check and an
  /// update is broadcast. On failure `None` is returned and the cache is left
  /// as it was.
  pub async fn force_refresh(&self, resource_id: &str) -> Option<ContentPayload> {
    let (op, _) = self.start_or_join(resource_id, FetchMode::Forced);

    match op.await {
      Ok(fetched) => {
        // An attached fetch may have been settled without an announcement.
        if !fetched.announced {
          self.inner.commit_forced(resource_id, &fetched.payload);
        }
        Some(fetched.payload)
      }
      Err(e) => {
        warn!(resource_id, error = %e, "Forced refresh failed");
        None
      }
    }
  }

  /// Clear one cached resource, or everything when `resource_id` is `None`.
  pub fn clear_cache(&self, resource_id: Option<&str>) {
    match resource_id {
      Some(id) => self.inner.cache.invalidate(id),
      None => self.inner.cache.invalidate_all(),
    }
  }

  /// Wait until no fetch is outstanding, including ones started meanwhile.
  pub async fn wait_idle(&self) {
    loop {
      let ops: Vec<FetchOp> = self
        .inner
        .lock_in_flight()
        .values()
        .map(|f| f.op.clone())
        .collect();
      if ops.is_empty() {
        return;
      }
      futures::future::join_all(ops).await;
    }
  }

  fn schedule_revalidation(&self, resource_id: &str) {
    let (_, started) = self.start_or_join(resource_id, FetchMode::Revalidate);
    if !started {
      debug!(resource_id, "Revalidation attached to in-flight fetch");
    }
  }

  /// Join the outstanding fetch for `resource_id` or start a new one.
  ///
  /// New fetches run on their own task, so they complete and persist even
  /// if every caller goes away.
  fn start_or_join(&self, resource_id: &str, mode: FetchMode) -> (FetchOp, bool) {
    let mut in_flight = self.inner.lock_in_flight();

    if let Some(existing) = in_flight.get(resource_id) {
      return (existing.op.clone(), false);
    }

    let inner = Arc::clone(&self.inner);
    let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);
    let id = resource_id.to_string();

    let op = async move {
      let result = inner.remote.fetch(&id).await.map(|payload| {
        let announced = inner.settle(&id, mode, &payload);
        Fetched { payload, announced }
      });
      match &result {
        Ok(_) => {}
        Err(e) if mode == FetchMode::Revalidate => {
          warn!(resource_id = %id, error = %e, "Background revalidation failed, keeping existing content");
        }
        Err(e) => debug!(resource_id = %id, error = %e, ?mode, "Remote fetch failed"),
      }
      inner.finish(&id, generation);
      result
    }
    .boxed()
    .shared();

    in_flight.insert(
      resource_id.to_string(),
      InFlight {
        generation,
        op: op.clone(),
      },
    );
    drop(in_flight);

    debug!(resource_id, ?mode, "Started remote fetch");
    tokio::spawn(op.clone());

    (op, true)
  }
}

impl<S: CacheStorage + 'static> Clone for SyncOrchestrator<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<S: CacheStorage + 'static> Inner<S> {
  fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
    // The map holds no invariants a panicking holder could break.
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn finish(&self, resource_id: &str, generation: u64) {
    let mut in_flight = self.lock_in_flight();
    if in_flight.get(resource_id).map(|f| f.generation) == Some(generation) {
      in_flight.remove(resource_id);
    }
  }

  fn persist(&self, resource_id: &str, payload: &ContentPayload) {
    let ttl = self.ttl.ttl_for(resource_id);
    let location = self.remote.location(resource_id);
    self
      .cache
      .write_with_source(resource_id, payload, ttl, location.as_deref());
  }

  /// Persist a fetched payload per `mode`. Returns whether an update went out.
  fn settle(&self, resource_id: &str, mode: FetchMode, payload: &ContentPayload) -> bool {
    match mode {
      FetchMode::Foreground => {
        self.persist(resource_id, payload);
        false
      }
      FetchMode::Forced => {
        self.commit_forced(resource_id, payload);
        true
      }
      FetchMode::Revalidate => self.commit_revalidated(resource_id, payload),
    }
  }

  fn commit_forced(&self, resource_id: &str, payload: &ContentPayload) {
    self.persist(resource_id, payload);
    self.notify(resource_id, payload);
  }

  fn commit_revalidated(&self, resource_id: &str, payload: &ContentPayload) -> bool {
    let baseline = self
      .cache
      .read(resource_id)
      .map(|entry| entry.payload)
      .or_else(|| self.bundled.get(resource_id).ok().flatten());

    let changed = baseline
      .as_ref()
      .map_or(true, |current| is_newer(payload, current));

    // Persisted either way so the TTL window restarts.
    self.persist(resource_id, payload);

    if changed {
      self.notify(resource_id, payload);
    } else {
      debug!(resource_id, version = %payload.version, "Content unchanged, TTL refreshed");
    }
    changed
  }

  fn notify(&self, resource_id: &str, payload: &ContentPayload) {
    let update = ContentUpdate {
      resource_id: resource_id.to_string(),
      payload: payload.clone(),
    };
    match self.updates.send(update) {
      Ok(receivers) => info!(resource_id, version = %payload.version, receivers, "Content updated"),
      Err(_) => debug!(resource_id, "No subscribers for content update"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::source::StaticBundle;
  use crate::sync::LoadSource;
  use chrono::Duration as TtlDuration;
  use serde_json::json;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;
  use tokio::sync::broadcast::error::TryRecvError;

  /// Remote that counts calls and answers with a configurable result.
  struct StubRemote {
    calls: AtomicUsize,
    response: Mutex<Result<ContentPayload>>,
    delay: Duration,
  }

  impl StubRemote {
    fn ok(payload: ContentPayload) -> Arc<Self> {
      Self::with(Ok(payload), Duration::ZERO)
    }

    fn failing() -> Arc<Self> {
      Self::with(Err(Error::Transport("connection refused".into())), Duration::ZERO)
    }

    fn with(response: Result<ContentPayload>, delay: Duration) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        response: Mutex::new(response),
        delay,
      })
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  impl RemoteSource for StubRemote {
    fn fetch<'a>(&'a self, _resource_id: &'a str) -> BoxFuture<'a, Result<ContentPayload>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let response = self.response.lock().unwrap().clone();
      let delay = self.delay;
      async move {
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        response
      }
      .boxed()
    }

    fn location(&self, resource_id: &str) -> Option<String> {
      Some(format!("stub://{}", resource_id))
    }
  }

  fn payload(last_updated: i64) -> ContentPayload {
    ContentPayload::new(format!("rev-{}", last_updated), last_updated, json!({"perks": [last_updated]}))
  }

  fn orchestrator(
    bundle: StaticBundle,
    remote: Arc<StubRemote>,
  ) -> SyncOrchestrator<MemoryStorage> {
    SyncOrchestrator::new(
      CacheStore::new(MemoryStorage::new()),
      Arc::new(bundle),
      remote,
      TtlPolicy::uniform(TtlDuration::hours(24)),
    )
  }

  /// Write a cache entry that is already past its expiry.
  async fn write_stale(sync: &SyncOrchestrator<MemoryStorage>, id: &str, payload: &ContentPayload) {
    sync.cache().write(id, payload, TtlDuration::zero());
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(sync.cache().read(id).unwrap().is_stale());
  }

  #[tokio::test]
  async fn test_bundled_payload_returned_without_waiting_for_network() {
    let remote = StubRemote::with(Ok(payload(2)), Duration::from_secs(30));
    let sync = orchestrator(StaticBundle::new().with("perks", payload(1)), remote.clone());

    let loaded = tokio::time::timeout(Duration::from_millis(500), sync.load_with_source("perks"))
      .await
      .expect("load must not wait on the network")
      .unwrap();

    assert_eq!(loaded.payload, payload(1));
    assert_eq!(loaded.source, LoadSource::Bundled);
    assert_eq!(sync.in_flight_count(), 1);
  }

  #[tokio::test]
  async fn test_fresh_cache_hit_issues_one_background_fetch() {
    let remote = StubRemote::ok(payload(1));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));

    let loaded = sync.load_with_source("perks").await.unwrap();
    assert_eq!(loaded.payload, payload(1));
    assert_eq!(loaded.source, LoadSource::CacheFresh);

    sync.wait_idle().await;
    assert_eq!(remote.calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_cache_served_when_remote_fails() {
    let remote = StubRemote::failing();
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    write_stale(&sync, "perks", &payload(1)).await;

    let loaded = sync.load_with_source("perks").await.unwrap();
    assert_eq!(loaded.payload, payload(1));
    assert_eq!(loaded.source, LoadSource::Offline);
    assert_eq!(remote.calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_cache_prefers_bundle_over_network() {
    let remote = StubRemote::ok(payload(3));
    let sync = orchestrator(StaticBundle::new().with("perks", payload(2)), remote.clone());
    write_stale(&sync, "perks", &payload(1)).await;

    let loaded = sync.load_with_source("perks").await.unwrap();
    assert_eq!(loaded.source, LoadSource::Bundled);
    assert_eq!(loaded.payload, payload(2));
  }

  #[tokio::test]
  async fn test_nothing_available_is_content_unavailable() {
    let sync = orchestrator(StaticBundle::new(), StubRemote::failing());

    let err = sync.load("perks").await.unwrap_err();
    assert!(matches!(err, Error::ContentUnavailable { ref resource_id, .. } if resource_id == "perks"));
  }

  #[tokio::test]
  async fn test_foreground_fetch_is_persisted_without_notification() {
    let remote = StubRemote::ok(payload(4));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    let mut updates = sync.subscribe();

    let loaded = sync.load_with_source("perks").await.unwrap();
    assert_eq!(loaded.source, LoadSource::Network);

    let entry = sync.cache().read("perks").expect("fetched payload should be cached");
    assert_eq!(entry.payload, payload(4));
    assert_eq!(entry.source_url.as_deref(), Some("stub://perks"));
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_concurrent_loads_share_one_fetch() {
    let remote = StubRemote::with(Ok(payload(1)), Duration::from_millis(50));
    let sync = orchestrator(StaticBundle::new(), remote.clone());

    let (a, b) = tokio::join!(sync.load("perks"), sync.load("perks"));

    assert_eq!(a.unwrap(), payload(1));
    assert_eq!(b.unwrap(), payload(1));
    assert_eq!(remote.calls(), 1);
    assert_eq!(sync.in_flight_count(), 0);
  }

  #[tokio::test]
  async fn test_repeated_hits_attach_to_pending_revalidation() {
    let remote = StubRemote::with(Ok(payload(1)), Duration::from_millis(50));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));

    for _ in 0..3 {
      sync.load("perks").await.unwrap();
    }
    sync.wait_idle().await;

    assert_eq!(remote.calls(), 1);
  }

  #[tokio::test]
  async fn test_newer_revalidation_updates_cache_and_notifies() {
    let remote = StubRemote::ok(payload(2));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    let mut updates = sync.subscribe();

    assert_eq!(sync.load("perks").await.unwrap(), payload(1));
    sync.wait_idle().await;

    let update = updates.try_recv().expect("update should be broadcast");
    assert_eq!(update.resource_id, "perks");
    assert_eq!(update.payload, payload(2));
    assert_eq!(sync.cache().read("perks").unwrap().payload, payload(2));
  }

  #[tokio::test]
  async fn test_unchanged_revalidation_resets_ttl_silently() {
    let remote = StubRemote::ok(payload(1));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    let before = sync.cache().read("perks").unwrap();
    let mut updates = sync.subscribe();

    tokio::time::sleep(Duration::from_millis(5)).await;
    sync.load("perks").await.unwrap();
    sync.wait_idle().await;

    let after = sync.cache().read("perks").unwrap();
    assert!(after.fetched_at > before.fetched_at);
    assert_eq!(after.expires_at, after.fetched_at + TtlDuration::hours(24).num_milliseconds());
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_revalidation_against_bundle_baseline() {
    let remote = StubRemote::ok(payload(1));
    let sync = orchestrator(StaticBundle::new().with("perks", payload(1)), remote.clone());
    let mut updates = sync.subscribe();

    sync.load("perks").await.unwrap();
    sync.wait_idle().await;

    // Same lastUpdated as the bundle: cached, but not announced.
    assert_eq!(sync.cache().read("perks").unwrap().payload, payload(1));
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_failed_revalidation_keeps_cache() {
    let remote = StubRemote::failing();
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    let before = sync.cache().read("perks").unwrap();
    let mut updates = sync.subscribe();

    sync.load("perks").await.unwrap();
    sync.wait_idle().await;

    assert_eq!(remote.calls(), 1);
    assert_eq!(sync.cache().read("perks").unwrap(), before);
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_force_refresh_overwrites_even_when_older() {
    let remote = StubRemote::ok(payload(1));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(5), TtlDuration::hours(1));
    let mut updates = sync.subscribe();

    let refreshed = sync.force_refresh("perks").await;

    assert_eq!(refreshed, Some(payload(1)));
    assert_eq!(sync.cache().read("perks").unwrap().payload, payload(1));
    assert_eq!(updates.try_recv().unwrap().payload, payload(1));
  }

  #[tokio::test]
  async fn test_force_refresh_failure_leaves_cache_untouched() {
    let sync = orchestrator(StaticBundle::new(), StubRemote::failing());
    sync.cache().write("perks", &payload(5), TtlDuration::hours(1));
    let before = sync.cache().read("perks").unwrap();
    let mut updates = sync.subscribe();

    assert_eq!(sync.force_refresh("perks").await, None);
    assert_eq!(sync.cache().read("perks").unwrap(), before);
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_force_refresh_attached_to_revalidation_still_notifies() {
    let remote = StubRemote::with(Ok(payload(1)), Duration::from_millis(50));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    let mut updates = sync.subscribe();

    sync.load("perks").await.unwrap();
    assert_eq!(sync.force_refresh("perks").await, Some(payload(1)));

    assert_eq!(remote.calls(), 1);
    assert_eq!(updates.try_recv().unwrap().payload, payload(1));
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_force_refresh_attached_to_newer_revalidation_notifies_once() {
    let remote = StubRemote::with(Ok(payload(2)), Duration::from_millis(50));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    let mut updates = sync.subscribe();

    assert_eq!(sync.load("perks").await.unwrap(), payload(1));
    assert_eq!(sync.force_refresh("perks").await, Some(payload(2)));
    sync.wait_idle().await;

    assert_eq!(remote.calls(), 1);
    assert_eq!(sync.cache().read("perks").unwrap().payload, payload(2));
    assert_eq!(updates.try_recv().unwrap().payload, payload(2));
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_concurrent_force_refreshes_notify_once() {
    let remote = StubRemote::with(Ok(payload(3)), Duration::from_millis(50));
    let sync = orchestrator(StaticBundle::new(), remote.clone());
    let mut updates = sync.subscribe();

    let (a, b) = tokio::join!(sync.force_refresh("perks"), sync.force_refresh("perks"));

    assert_eq!(a, Some(payload(3)));
    assert_eq!(b, Some(payload(3)));
    assert_eq!(remote.calls(), 1);
    assert_eq!(updates.try_recv().unwrap().payload, payload(3));
    assert_eq!(updates.try_recv(), Err(TryRecvError::Empty));
  }

  #[tokio::test]
  async fn test_unreadable_bundle_falls_through_to_network() {
    struct BrokenBundle;
    impl BundledSource for BrokenBundle {
      fn get(&self, _resource_id: &str) -> Result<Option<ContentPayload>> {
        Err(Error::Parse("truncated file".into()))
      }
    }

    let remote = StubRemote::ok(payload(7));
    let sync = SyncOrchestrator::new(
      CacheStore::new(MemoryStorage::new()),
      Arc::new(BrokenBundle),
      remote.clone(),
      TtlPolicy::default(),
    );

    let loaded = sync.load_with_source("perks").await.unwrap();
    assert_eq!(loaded.source, LoadSource::Network);
    assert_eq!(loaded.payload, payload(7));
  }

  #[tokio::test]
  async fn test_clear_cache() {
    let sync = orchestrator(StaticBundle::new(), StubRemote::failing());
    sync.cache().write("perks", &payload(1), TtlDuration::hours(1));
    sync.cache().write("rules", &payload(1), TtlDuration::hours(1));

    sync.clear_cache(Some("perks"));
    assert!(sync.cache().read("perks").is_none());
    assert!(sync.cache().read("rules").is_some());

    sync.clear_cache(None);
    assert!(sync.cache().read("rules").is_none());
  }
}
