use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::bail;

use bookreserve_reservations::api::{BookId, ReservationId, ReservationStatus, ReservationView};

use crate::credential_store::CredentialStore;
use crate::reservations_api::ReservationsApi;

/// Synchronization state of the cache.
/// Moves Uninitialized -> Loading -> Ready on the first refresh and
/// Ready -> Loading -> Ready on every later one. A failed fetch still
/// resolves back to Ready; the cache never sticks in Loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Uninitialized,
    Loading,
    Ready,
}

struct Inner {
    reservations: Vec<ReservationView>,
    sync_state: SyncState,
    pending_refreshes: usize,
    applied_refresh: u64,
}

/// Local reflection of the signed-in user's reservations.
///
/// The collection is derived state: it holds the result of the most
/// recently applied refresh plus the caller's own completed mutations,
/// and is never authoritative. Mutations go to the server first; only a
/// successful response touches the local collection.
pub struct ReservationCache {
    api: Arc<dyn ReservationsApi>,
    credentials: Arc<dyn CredentialStore>,
    inner: parking_lot::Mutex<Inner>,
    refresh_counter: AtomicU64,
}

impl ReservationCache {
    pub fn new(api: Arc<dyn ReservationsApi>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            api,
            credentials,
            inner: parking_lot::Mutex::new(Inner {
                reservations: Vec::new(),
                sync_state: SyncState::Uninitialized,
                pending_refreshes: 0,
                applied_refresh: 0,
            }),
            refresh_counter: AtomicU64::new(0),
        }
    }

    /// Fetches the authoritative list and replaces the local collection.
    ///
    /// Without a credential this is the expected guest condition: the
    /// cache is left untouched and no request is made. Each refresh takes
    /// a ticket from a monotonic counter; a response only lands if no
    /// newer refresh has been applied in the meantime, so overlapping
    /// refreshes cannot roll the collection back to stale state.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let Some(token) = self.credentials.credential() else {
            return Ok(());
        };

        let ticket = self.refresh_counter.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut inner = self.inner.lock();
            inner.pending_refreshes += 1;
            inner.sync_state = SyncState::Loading;
        }

        let result = self.api.my_reservations(&token, None).await;

        let mut inner = self.inner.lock();
        inner.pending_refreshes -= 1;
        if inner.pending_refreshes == 0 {
            inner.sync_state = SyncState::Ready;
        }

        let reservations = result?;
        if ticket > inner.applied_refresh {
            inner.applied_refresh = ticket;
            inner.reservations = reservations;
        } else {
            tracing::debug!("Discarding stale refresh response");
        }
        Ok(())
    }

    /// Reserves the book and appends the canonical server-returned record
    /// to the local collection. No request is made without a credential.
    pub async fn add_reservation(&self, book_id: BookId) -> anyhow::Result<ReservationView> {
        let Some(token) = self.credentials.credential() else {
            bail!("Sign in to reserve books")
        };

        let view = self.api.create_reservation(&token, book_id).await?;

        self.inner.lock().reservations.push(view.clone());
        Ok(view)
    }

    /// Cancels the reservation and removes it from the local collection
    /// by identity. A failed cancel leaves the collection unchanged and
    /// carries the server's message.
    pub async fn remove_reservation(&self, reservation_id: ReservationId) -> anyhow::Result<()> {
        let Some(token) = self.credentials.credential() else {
            bail!("Sign in to cancel reservations")
        };

        self.api.cancel_reservation(&token, reservation_id).await?;

        self.inner
            .lock()
            .reservations
            .retain(|reservation| reservation.id != reservation_id);
        Ok(())
    }

    /// Empties the local collection, for logout. Purely local.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.reservations.clear();
        // A refresh already in flight at logout must not repopulate the list
        inner.applied_refresh = self.refresh_counter.load(Ordering::Relaxed);
    }

    pub fn reservations(&self) -> Vec<ReservationView> {
        self.inner.lock().reservations.clone()
    }

    /// The presentation-side filter: only reservations still holding a
    /// claim on their book.
    pub fn active_reservations(&self) -> Vec<ReservationView> {
        self.inner
            .lock()
            .reservations
            .iter()
            .filter(|reservation| reservation.status == ReservationStatus::Active)
            .cloned()
            .collect()
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.lock().sync_state
    }
}

#[cfg(test)]
mod reservation_cache_tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI32, AtomicUsize};

    use bookreserve_reservations::api::BookDetails;

    use super::*;
    use crate::credential_store::StoredCredential;

    fn book(title: &str) -> BookDetails {
        BookDetails {
            title: title.to_string(),
            author: "Author1".to_string(),
            genre: "Genre1".to_string(),
            cover: "/covers/1.png".to_string(),
        }
    }

    fn view(id: ReservationId, book_id: BookId, status: ReservationStatus) -> ReservationView {
        ReservationView {
            id,
            user_id: 1,
            book_id,
            reservation_date: 1_700_000_000,
            status,
            book: book("title"),
        }
    }

    fn signed_in() -> Arc<StoredCredential> {
        let credentials = Arc::new(StoredCredential::default());
        credentials.set("token".to_string());
        credentials
    }

    /// Test double behaving like the server: knows a set of books, keeps
    /// the authoritative reservation list, counts every request
    #[derive(Default)]
    struct ScriptedApi {
        calls: AtomicUsize,
        books: parking_lot::Mutex<HashMap<BookId, BookDetails>>,
        server_reservations: parking_lot::Mutex<Vec<ReservationView>>,
        reservation_sequence: AtomicI32,
    }

    impl ScriptedApi {
        fn with_books(book_ids: &[BookId]) -> Self {
            let api = Self::default();
            {
                let mut books = api.books.lock();
                for &book_id in book_ids {
                    books.insert(book_id, book(&format!("title{book_id}")));
                }
            }
            api
        }

        fn seed_reservation(&self, reservation: ReservationView) {
            self.server_reservations.lock().push(reservation);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait::async_trait]
    impl ReservationsApi for ScriptedApi {
        async fn create_reservation(
            &self,
            _token: &str,
            book_id: BookId,
        ) -> anyhow::Result<ReservationView> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let Some(details) = self.books.lock().get(&book_id).cloned() else {
                bail!("Book {book_id} not found")
            };
            let id = self.reservation_sequence.fetch_add(1, Ordering::Relaxed);
            let reservation = ReservationView {
                id,
                user_id: 1,
                book_id,
                reservation_date: 1_700_000_000,
                status: ReservationStatus::Active,
                book: details,
            };
            self.server_reservations.lock().push(reservation.clone());
            Ok(reservation)
        }

        async fn my_reservations(
            &self,
            _token: &str,
            status: Option<ReservationStatus>,
        ) -> anyhow::Result<Vec<ReservationView>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .server_reservations
                .lock()
                .iter()
                .filter(|reservation| status.map(|s| reservation.status == s).unwrap_or(true))
                .cloned()
                .collect())
        }

        async fn cancel_reservation(
            &self,
            _token: &str,
            reservation_id: ReservationId,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let mut reservations = self.server_reservations.lock();
            let Some(reservation) = reservations
                .iter_mut()
                .find(|reservation| reservation.id == reservation_id)
            else {
                bail!("Reservation {reservation_id} not found")
            };
            if reservation.status == ReservationStatus::Cancelled {
                bail!("Reservation {reservation_id} is already cancelled")
            }
            reservation.status = ReservationStatus::Cancelled;
            Ok(())
        }
    }

    #[tokio::test]
    /// Without a credential a refresh is the expected guest condition:
    /// no request, no error, cache untouched
    async fn test_guest_refresh_is_a_silent_noop() {
        let api = Arc::new(ScriptedApi::with_books(&[3]));
        let cache = ReservationCache::new(api.clone(), Arc::new(StoredCredential::default()));

        cache.refresh().await.expect("Guest refresh must not fail");

        assert_eq!(api.calls(), 0);
        assert_eq!(cache.reservations(), vec![]);
        assert_eq!(cache.sync_state(), SyncState::Uninitialized);
    }

    #[tokio::test]
    /// Reserving without a credential fails before any request is issued
    /// and leaves the collection unchanged
    async fn test_add_reservation_requires_credential() {
        let api = Arc::new(ScriptedApi::with_books(&[7]));
        let cache = ReservationCache::new(api.clone(), Arc::new(StoredCredential::default()));

        let result = cache.add_reservation(7).await;

        assert!(result.is_err());
        assert_eq!(api.calls(), 0);
        assert_eq!(cache.reservations(), vec![]);
    }

    #[tokio::test]
    /// A successful reservation appends exactly the canonical record the
    /// server returned, without refetching the whole list
    async fn test_add_reservation_appends_canonical_record() {
        let api = Arc::new(ScriptedApi::with_books(&[3]));
        let cache = ReservationCache::new(api.clone(), signed_in());

        let created = cache
            .add_reservation(3)
            .await
            .expect("Failed to add reservation");

        assert_eq!(created.book_id, 3);
        assert_eq!(created.status, ReservationStatus::Active);
        assert_eq!(cache.reservations(), vec![created]);
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    /// A rejected reservation carries the server message and leaves the
    /// collection unchanged
    async fn test_add_reservation_failure_leaves_collection_unchanged() {
        let api = Arc::new(ScriptedApi::with_books(&[3]));
        let cache = ReservationCache::new(api.clone(), signed_in());

        let result = cache.add_reservation(999).await;

        let error = result.expect_err("Unknown book must be rejected");
        assert!(error.to_string().contains("not found"));
        assert_eq!(cache.reservations(), vec![]);
    }

    #[tokio::test]
    /// Cancelling a reservation the server does not know (or that belongs
    /// to someone else) fails, surfaces the message and changes nothing
    async fn test_remove_reservation_failure_surfaces_server_message() {
        let api = Arc::new(ScriptedApi::with_books(&[3]));
        api.seed_reservation(view(1, 3, ReservationStatus::Active));
        let cache = ReservationCache::new(api.clone(), signed_in());
        cache.refresh().await.expect("Failed to refresh");

        let result = cache.remove_reservation(42).await;

        let error = result.expect_err("Foreign reservation must not cancel");
        assert!(error.to_string().contains("Reservation 42 not found"));
        assert_eq!(cache.reservations().len(), 1);
    }

    #[tokio::test]
    /// A successful cancel removes exactly the matching record
    async fn test_remove_reservation_removes_by_identity() {
        let api = Arc::new(ScriptedApi::with_books(&[3, 4]));
        api.seed_reservation(view(1, 3, ReservationStatus::Active));
        api.seed_reservation(view(2, 4, ReservationStatus::Active));
        let cache = ReservationCache::new(api.clone(), signed_in());
        cache.refresh().await.expect("Failed to refresh");

        cache
            .remove_reservation(1)
            .await
            .expect("Failed to remove reservation");

        let remaining = cache.reservations();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
    }

    #[tokio::test]
    /// Refreshing replaces the collection with server truth and is
    /// idempotent when nothing changed in between
    async fn test_refresh_replaces_collection_and_is_idempotent() {
        let api = Arc::new(ScriptedApi::with_books(&[3]));
        api.seed_reservation(view(1, 3, ReservationStatus::Active));
        let cache = ReservationCache::new(api.clone(), signed_in());

        cache.refresh().await.expect("Failed to refresh");
        let first = cache.reservations();
        cache.refresh().await.expect("Failed to refresh");
        assert_eq!(cache.reservations(), first);
        assert_eq!(cache.sync_state(), SyncState::Ready);

        // Another session adds a reservation server-side; the next refresh
        // replaces the local collection instead of merging
        api.seed_reservation(view(2, 3, ReservationStatus::Active));
        cache.refresh().await.expect("Failed to refresh");
        assert_eq!(cache.reservations().len(), 2);
    }

    #[tokio::test]
    /// Presentation filters on the local snapshot: of one active and one
    /// cancelled reservation exactly the active one is shown
    async fn test_active_reservations_filter() {
        let api = Arc::new(ScriptedApi::with_books(&[3, 4]));
        api.seed_reservation(view(1, 3, ReservationStatus::Active));
        api.seed_reservation(view(2, 4, ReservationStatus::Cancelled));
        let cache = ReservationCache::new(api.clone(), signed_in());
        cache.refresh().await.expect("Failed to refresh");

        assert_eq!(cache.reservations().len(), 2);
        let active = cache.active_reservations();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
    }

    #[tokio::test]
    /// A failed refresh reports the error, leaves the collection alone
    /// and resolves the state back to Ready
    async fn test_failed_refresh_resolves_back_to_ready() {
        struct FailingApi;

        #[async_trait::async_trait]
        impl ReservationsApi for FailingApi {
            async fn create_reservation(
                &self,
                _token: &str,
                _book_id: BookId,
            ) -> anyhow::Result<ReservationView> {
                bail!("Connection refused")
            }

            async fn my_reservations(
                &self,
                _token: &str,
                _status: Option<ReservationStatus>,
            ) -> anyhow::Result<Vec<ReservationView>> {
                bail!("Connection refused")
            }

            async fn cancel_reservation(
                &self,
                _token: &str,
                _reservation_id: ReservationId,
            ) -> anyhow::Result<()> {
                bail!("Connection refused")
            }
        }

        let cache = ReservationCache::new(Arc::new(FailingApi), signed_in());

        let result = cache.refresh().await;

        assert!(result.is_err());
        assert_eq!(cache.reservations(), vec![]);
        assert_eq!(cache.sync_state(), SyncState::Ready);
    }

    /// Test double that parks every list request until the test releases
    /// it, so response ordering can be forced
    #[derive(Default)]
    struct GatedApi {
        pending: parking_lot::Mutex<Vec<tokio::sync::oneshot::Sender<Vec<ReservationView>>>>,
    }

    #[async_trait::async_trait]
    impl ReservationsApi for GatedApi {
        async fn create_reservation(
            &self,
            _token: &str,
            _book_id: BookId,
        ) -> anyhow::Result<ReservationView> {
            bail!("Not scripted")
        }

        async fn my_reservations(
            &self,
            _token: &str,
            _status: Option<ReservationStatus>,
        ) -> anyhow::Result<Vec<ReservationView>> {
            let (sender, receiver) = tokio::sync::oneshot::channel();
            self.pending.lock().push(sender);
            Ok(receiver.await?)
        }

        async fn cancel_reservation(
            &self,
            _token: &str,
            _reservation_id: ReservationId,
        ) -> anyhow::Result<()> {
            bail!("Not scripted")
        }
    }

    async fn wait_for_pending(api: &GatedApi, count: usize) {
        for _ in 0..200 {
            if api.pending.lock().len() >= count {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("Gated api never received {count} list requests")
    }

    #[tokio::test]
    /// Two overlapping refreshes resolve out of order; the response of
    /// the older one arrives last and must be discarded
    async fn test_stale_refresh_response_is_discarded() {
        let api = Arc::new(GatedApi::default());
        let cache = Arc::new(ReservationCache::new(api.clone(), signed_in()));

        let first_refresh = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh().await }
        });
        wait_for_pending(&api, 1).await;

        let second_refresh = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh().await }
        });
        wait_for_pending(&api, 2).await;

        let (older, newer) = {
            let mut pending = api.pending.lock();
            let older = pending.remove(0);
            let newer = pending.remove(0);
            (older, newer)
        };

        newer
            .send(vec![view(2, 4, ReservationStatus::Active)])
            .unwrap();
        second_refresh.await.unwrap().expect("Failed to refresh");

        older
            .send(vec![view(1, 3, ReservationStatus::Active)])
            .unwrap();
        first_refresh.await.unwrap().expect("Failed to refresh");

        // The newer response stays; the stale one did not roll it back
        let reservations = cache.reservations();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].id, 2);
        assert_eq!(cache.sync_state(), SyncState::Ready);
    }

    #[tokio::test]
    /// clear() wipes the collection and an in-flight refresh started
    /// before logout cannot repopulate it
    async fn test_clear_discards_inflight_refresh() {
        let api = Arc::new(GatedApi::default());
        let cache = Arc::new(ReservationCache::new(api.clone(), signed_in()));

        let refresh = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh().await }
        });
        wait_for_pending(&api, 1).await;

        cache.clear();

        let sender = api.pending.lock().remove(0);
        sender
            .send(vec![view(1, 3, ReservationStatus::Active)])
            .unwrap();
        refresh.await.unwrap().expect("Failed to refresh");

        assert_eq!(cache.reservations(), vec![]);
    }
}
