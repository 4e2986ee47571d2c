use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use ephemeral_paste_common::{CreatePasteRequest, PasteView};
use tokio::task;
use tracing::{debug, info, instrument};

use crate::backend::{Backend, Entry};
use crate::error::{PasteError, StorageError};
use crate::expiry;
use crate::paste::{self, storage_key, PasteRecord};
use crate::short_code::IdGenerator;
use crate::time::DEFAULT_STORAGE_TIMEOUT;

/// Try finding a free id; give up after this many attempts.
const MAX_ID_ATTEMPTS: usize = 1000;
/// Lost compare-and-swap races tolerated by a single consume.
const MAX_SWAP_ATTEMPTS: usize = 64;
/// Largest ttl for which `chrono::Duration::seconds` cannot overflow.
const MAX_TTL_SECONDS: i64 = i64::MAX / 1000;

enum Consumed {
    Missing,
    Expired,
    Granted(PasteRecord),
}

/// Sole owner of paste records. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct PasteStore {
    backend: Arc<dyn Backend>,
    ids: Arc<dyn IdGenerator>,
    timeout: StdDuration,
}

impl PasteStore {
    pub fn new(backend: Arc<dyn Backend>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            backend,
            ids,
            timeout: DEFAULT_STORAGE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a backend operation on the blocking pool, bounded by the storage
    /// timeout. A timed out call may still complete in the background.
    async fn run<T, F>(&self, op: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T, StorageError> + Send + 'static,
    {
        let backend = Arc::clone(&self.backend);
        let join_handle = task::spawn_blocking(move || op(backend.as_ref()));
        match tokio::time::timeout(self.timeout, join_handle).await {
            Ok(joined) => joined?,
            Err(_) => Err(StorageError::Timeout(self.timeout)),
        }
    }

    /// Validates a creation request and stores the paste it describes.
    #[instrument(skip(self, request), fields(ttl_seconds = ?request.ttl_seconds, max_views = ?request.max_views))]
    pub async fn create_paste(
        &self,
        request: CreatePasteRequest,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        let expires_at = match request.ttl_seconds {
            None => None,
            Some(ttl) if ttl < 1 => return Err(PasteError::validation("ttl_seconds must be >= 1")),
            Some(ttl) => Some(
                Some(ttl)
                    .filter(|ttl| *ttl <= MAX_TTL_SECONDS)
                    .and_then(|ttl| now.checked_add_signed(Duration::seconds(ttl)))
                    .ok_or_else(|| PasteError::validation("ttl_seconds is too large"))?,
            ),
        };

        let max_views = match request.max_views {
            None => None,
            Some(views) if views < 1 => {
                return Err(PasteError::validation("max_views must be >= 1"))
            }
            Some(views) => Some(
                u32::try_from(views)
                    .map_err(|_| PasteError::validation("max_views is too large"))?,
            ),
        };

        self.create(request.content, expires_at, max_views, now).await
    }

    /// Stores a new paste with no views yet and returns it, id included.
    #[instrument(skip(self, content))]
    pub async fn create(
        &self,
        content: String,
        expires_at: Option<DateTime<Utc>>,
        max_views: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<PasteRecord, PasteError> {
        if content.is_empty() {
            return Err(PasteError::validation("content cannot be empty"));
        }
        if max_views == Some(0) {
            return Err(PasteError::validation("max_views must be >= 1"));
        }

        let ids = Arc::clone(&self.ids);
        let record = self
            .run(move |backend| {
                for _ in 0..MAX_ID_ATTEMPTS {
                    let record =
                        PasteRecord::new(ids.new_id(), content.clone(), now, expires_at, max_views);
                    let entry = Entry::new(
                        paste::encode(&record)?,
                        expiry::backend_ttl(&record, now),
                    );
                    if backend.compare_and_swap(&storage_key(&record.id), None, Some(entry))? {
                        return Ok(record);
                    }
                }
                Err(StorageError::IdExhausted(MAX_ID_ATTEMPTS))
            })
            .await?;

        info!(id = %record.id, "created paste");
        Ok(record)
    }

    /// Raw lookup. Does not count as a view and does not filter expired
    /// records that are still physically stored.
    #[instrument(skip(self))]
    pub async fn fetch(&self, id: &str) -> Result<PasteRecord, PasteError> {
        let key = storage_key(id);
        let bytes = self.run(move |backend| Ok(backend.get(&key)?)).await?;
        match bytes {
            Some(bytes) => Ok(paste::decode(&bytes).map_err(StorageError::from)?),
            None => Err(PasteError::NotFound),
        }
    }

    /// Counts one view of the paste and returns what the viewer gets to see.
    ///
    /// Expired or exhausted pastes are deleted and reported as not found. The
    /// view that reaches the limit is still granted, and the paste is removed
    /// in the same write. Load, increment and write go through a single
    /// compare-and-swap, so racing viewers can never both take the last view.
    #[instrument(skip(self))]
    pub async fn consume(&self, id: &str, now: DateTime<Utc>) -> Result<PasteView, PasteError> {
        let key = storage_key(id);
        let consumed = self
            .run(move |backend| {
                for _ in 0..MAX_SWAP_ATTEMPTS {
                    let current = match backend.get(&key)? {
                        Some(current) => current,
                        None => return Ok(Consumed::Missing),
                    };
                    let mut record = paste::decode(&current)?;

                    if expiry::is_expired(&record, now) {
                        // A lost race here means someone else already removed it.
                        backend.compare_and_swap(&key, Some(current.as_slice()), None)?;
                        return Ok(Consumed::Expired);
                    }

                    record.view_count = record.view_count.saturating_add(1);
                    let next = if expiry::is_view_exhausted(&record) {
                        None
                    } else {
                        Some(Entry::new(
                            paste::encode(&record)?,
                            expiry::backend_ttl(&record, now),
                        ))
                    };

                    if backend.compare_and_swap(&key, Some(current.as_slice()), next)? {
                        return Ok(Consumed::Granted(record));
                    }
                }
                Err(StorageError::Contention(MAX_SWAP_ATTEMPTS))
            })
            .await?;

        match consumed {
            Consumed::Missing => Err(PasteError::NotFound),
            Consumed::Expired => {
                debug!("evicted expired paste");
                Err(PasteError::NotFound)
            }
            Consumed::Granted(record) => {
                if expiry::is_view_exhausted(&record) {
                    debug!(views = record.view_count, "burned after final view");
                }
                Ok(record.to_view())
            }
        }
    }

    /// Removes the paste. Deleting an absent paste is not an error.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<(), PasteError> {
        let key = storage_key(id);
        self.run(move |backend| Ok(backend.delete(&key)?)).await?;
        Ok(())
    }

    /// Physically drops whatever the backend's own TTL has lapsed.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        self.run(|backend| Ok(backend.purge_expired()?)).await
    }

    pub async fn health(&self) -> Result<(), StorageError> {
        self.run(|backend| Ok(backend.ping()?)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::thread;

    use chrono::TimeZone;
    use futures::future::join_all;

    use super::*;
    use crate::backend::{BackendError, MemoryBackend, RocksBackend};
    use crate::short_code::{ShortCodeGenerator, SHORT_CODE_SIZE};
    use crate::time::{Clock, ManualClock};

    pub fn memory_store() -> PasteStore {
        PasteStore::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(ShortCodeGenerator::<SHORT_CODE_SIZE>::from_entropy()),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp(1_700_000_000, 0)
    }

    fn request(content: &str, ttl_seconds: Option<i64>, max_views: Option<i64>) -> CreatePasteRequest {
        CreatePasteRequest {
            content: content.to_owned(),
            ttl_seconds,
            max_views,
        }
    }

    /// Hands out ids from a fixed list, repeating the last one forever.
    struct ScriptedIds(Mutex<Vec<&'static str>>);

    impl IdGenerator for ScriptedIds {
        fn new_id(&self) -> String {
            let mut ids = self.0.lock().unwrap();
            if ids.len() > 1 {
                ids.remove(0).to_owned()
            } else {
                ids[0].to_owned()
            }
        }
    }

    pub struct SlowBackend(pub MemoryBackend);

    impl Backend for SlowBackend {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            thread::sleep(StdDuration::from_millis(200));
            self.0.get(key)
        }

        fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<&[u8]>,
            new: Option<Entry>,
        ) -> Result<bool, BackendError> {
            self.0.compare_and_swap(key, expected, new)
        }

        fn delete(&self, key: &str) -> Result<(), BackendError> {
            self.0.delete(key)
        }

        fn purge_expired(&self) -> Result<usize, BackendError> {
            self.0.purge_expired()
        }

        fn ping(&self) -> Result<(), BackendError> {
            self.0.ping()
        }
    }

    /// Fails every call, like a backend whose server went away.
    pub struct BrokenBackend;

    impl Backend for BrokenBackend {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            Err(BackendError::Poisoned)
        }

        fn compare_and_swap(
            &self,
            _key: &str,
            _expected: Option<&[u8]>,
            _new: Option<Entry>,
        ) -> Result<bool, BackendError> {
            Err(BackendError::Poisoned)
        }

        fn delete(&self, _key: &str) -> Result<(), BackendError> {
            Err(BackendError::Poisoned)
        }

        fn purge_expired(&self) -> Result<usize, BackendError> {
            Err(BackendError::Poisoned)
        }

        fn ping(&self) -> Result<(), BackendError> {
            Err(BackendError::Poisoned)
        }
    }

    pub fn store_on(backend: impl Backend) -> PasteStore {
        PasteStore::new(
            Arc::new(backend),
            Arc::new(ShortCodeGenerator::<SHORT_CODE_SIZE>::from_entropy()),
        )
    }

    #[tokio::test]
    async fn fetch_returns_content_byte_for_byte() {
        let store = memory_store();
        let content = "a\r\nb\tc\0d\u{1b}[0m\u{7f}é🦀";
        let created = store
            .create_paste(request(content, None, None), t0())
            .await
            .unwrap();

        let fetched = store.fetch(&created.id).await.unwrap();
        assert_eq!(fetched.content.as_bytes(), content.as_bytes());
        assert_eq!(fetched.view_count, 0);
        assert_eq!(fetched.created_at, t0());
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn fetch_does_not_count_views() {
        let store = memory_store();
        let created = store
            .create_paste(request("x", None, Some(1)), t0())
            .await
            .unwrap();
        for _ in 0..3 {
            assert_eq!(store.fetch(&created.id).await.unwrap().view_count, 0);
        }
        assert_eq!(
            store.consume(&created.id, t0()).await.unwrap().remaining_views,
            Some(0)
        );
    }

    #[tokio::test]
    async fn exactly_max_views_are_granted() {
        let store = memory_store();
        let id = store
            .create_paste(request("limited", None, Some(4)), t0())
            .await
            .unwrap()
            .id;

        let mut remaining = Vec::new();
        for _ in 0..4 {
            let view = store.consume(&id, t0()).await.unwrap();
            assert_eq!(view.content, "limited");
            remaining.push(view.remaining_views);
        }
        assert_eq!(remaining, vec![Some(3), Some(2), Some(1), Some(0)]);

        assert!(matches!(store.consume(&id, t0()).await, Err(PasteError::NotFound)));
        assert!(matches!(store.fetch(&id).await, Err(PasteError::NotFound)));
    }

    #[tokio::test]
    async fn time_expiry_is_permanent() {
        let store = memory_store();
        let record = store
            .create_paste(request("short lived", Some(60), None), t0())
            .await
            .unwrap();
        let expires_at = record.expires_at.unwrap();
        assert_eq!(expires_at, t0() + Duration::seconds(60));

        let view = store
            .consume(&record.id, expires_at - Duration::milliseconds(1))
            .await
            .unwrap();
        assert_eq!(view.expires_at, Some(expires_at));
        assert_eq!(view.remaining_views, None);

        assert!(matches!(
            store.consume(&record.id, expires_at).await,
            Err(PasteError::NotFound)
        ));
        // Deleted, not re-derived: going back in time does not resurrect it.
        assert!(matches!(
            store.consume(&record.id, t0()).await,
            Err(PasteError::NotFound)
        ));
    }

    #[tokio::test]
    async fn ttl_and_view_limit_scenario() {
        let store = memory_store();
        let clock = ManualClock::new(t0());
        let id = store
            .create_paste(request("both limits", Some(1), Some(5)), clock.now())
            .await
            .unwrap()
            .id;

        assert_eq!(
            store.consume(&id, clock.now()).await.unwrap().remaining_views,
            Some(4)
        );
        assert_eq!(
            store.consume(&id, clock.now()).await.unwrap().remaining_views,
            Some(3)
        );

        clock.advance(Duration::seconds(2));
        assert!(matches!(
            store.consume(&id, clock.now()).await,
            Err(PasteError::NotFound)
        ));
    }

    #[tokio::test]
    async fn unlimited_paste_serves_forever() {
        let store = memory_store();
        let id = store
            .create_paste(request("forever", None, None), t0())
            .await
            .unwrap()
            .id;

        for i in 0..100 {
            let view = store
                .consume(&id, t0() + Duration::days(i))
                .await
                .unwrap();
            assert_eq!(view.content, "forever");
            assert_eq!(view.remaining_views, None);
            assert_eq!(view.expires_at, None);
        }
        assert_eq!(store.fetch(&id).await.unwrap().view_count, 100);
    }

    async fn assert_one_final_view(store: PasteStore) {
        let id = store
            .create_paste(request("once", None, Some(1)), t0())
            .await
            .unwrap()
            .id;

        let attempts = (0..32).map(|_| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.consume(&id, t0()).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let granted = results.iter().filter(|result| result.is_ok()).count();
        let not_found = results
            .iter()
            .filter(|result| matches!(result, Err(PasteError::NotFound)))
            .count();
        assert_eq!(granted, 1);
        assert_eq!(not_found, 31);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_final_views_grant_exactly_one() {
        assert_one_final_view(memory_store()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_final_views_grant_exactly_one_on_rocksdb() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_on(RocksBackend::open(dir.path().join("db")).unwrap());
        assert_one_final_view(store).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn racing_views_never_exceed_limit() {
        let store = memory_store();
        let id = store
            .create_paste(request("five", None, Some(5)), t0())
            .await
            .unwrap()
            .id;

        let attempts = (0..40).map(|_| {
            let store = store.clone();
            let id = id.clone();
            tokio::spawn(async move { store.consume(&id, t0()).await })
        });
        let mut remaining: Vec<u32> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|joined| joined.unwrap().ok())
            .filter_map(|view| view.remaining_views)
            .collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delete_twice_is_fine() {
        let store = memory_store();
        let id = store
            .create_paste(request("bye", None, None), t0())
            .await
            .unwrap()
            .id;
        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        store.delete("never-existed").await.unwrap();
        assert!(matches!(store.consume(&id, t0()).await, Err(PasteError::NotFound)));
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = memory_store();
        assert!(matches!(store.fetch("nope").await, Err(PasteError::NotFound)));
        assert!(matches!(
            store.consume("nope", t0()).await,
            Err(PasteError::NotFound)
        ));
    }

    #[tokio::test]
    async fn previously_exhausted_record_is_evicted() {
        let backend = Arc::new(MemoryBackend::new());
        let store = PasteStore::new(
            backend.clone(),
            Arc::new(ShortCodeGenerator::<SHORT_CODE_SIZE>::from_entropy()),
        );
        let mut record = PasteRecord::new("stale".to_owned(), "x".to_owned(), t0(), None, Some(2));
        record.view_count = 2;
        backend
            .compare_and_swap(
                &storage_key("stale"),
                None,
                Some(Entry::new(paste::encode(&record).unwrap(), None)),
            )
            .unwrap();

        // Raw fetch still sees it, consume does not, and then nothing does.
        assert_eq!(store.fetch("stale").await.unwrap().view_count, 2);
        assert!(matches!(
            store.consume("stale", t0()).await,
            Err(PasteError::NotFound)
        ));
        assert_eq!(backend.get(&storage_key("stale")).unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let store = memory_store();
        let cases = [
            request("", None, None),
            request("x", Some(0), None),
            request("x", Some(-5), None),
            request("x", None, Some(0)),
            request("x", None, Some(-1)),
            request("x", None, Some(i64::from(u32::MAX) + 1)),
            request("x", Some(i64::MAX), None),
        ];
        for case in cases {
            assert!(
                matches!(
                    store.create_paste(case.clone(), t0()).await,
                    Err(PasteError::Validation(_))
                ),
                "{:?} should be rejected",
                case
            );
        }
    }

    #[tokio::test]
    async fn whitespace_content_is_accepted() {
        let store = memory_store();
        let record = store
            .create_paste(request(" \n", None, None), t0())
            .await
            .unwrap();
        assert_eq!(store.fetch(&record.id).await.unwrap().content, " \n");
    }

    #[tokio::test]
    async fn retries_colliding_ids() {
        let store = PasteStore::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(ScriptedIds(Mutex::new(vec!["same", "same", "other"]))),
        );
        let first = store.create("a".to_owned(), None, None, t0()).await.unwrap();
        let second = store.create("b".to_owned(), None, None, t0()).await.unwrap();
        assert_eq!(first.id, "same");
        assert_eq!(second.id, "other");

        assert!(matches!(
            store.create("c".to_owned(), None, None, t0()).await,
            Err(PasteError::Storage(StorageError::IdExhausted(_)))
        ));
    }

    #[tokio::test]
    async fn backend_failures_surface_as_storage_errors() {
        let store = store_on(BrokenBackend);
        assert!(matches!(
            store.create_paste(request("x", None, None), t0()).await,
            Err(PasteError::Storage(StorageError::Backend(_)))
        ));
        assert!(matches!(
            store.consume("anything", t0()).await,
            Err(PasteError::Storage(StorageError::Backend(_)))
        ));
        assert!(store.health().await.is_err());
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let store = PasteStore::new(
            Arc::new(SlowBackend(MemoryBackend::new())),
            Arc::new(ShortCodeGenerator::<SHORT_CODE_SIZE>::from_entropy()),
        )
        .with_timeout(StdDuration::from_millis(20));

        assert!(matches!(
            store.fetch("anything").await,
            Err(PasteError::Storage(StorageError::Timeout(_)))
        ));
    }
}
