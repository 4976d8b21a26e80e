use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::UNIX_EPOCH;

use crate::api::{BookSummary, Reservation, ReservationStatus};
use crate::reservations_store::{
    BookDetails, BookId, ReservationId, ReservationsStore, ReservationsStoreError, UserDetails,
    UserId,
};

pub struct InMemoryReservationsStore {
    users: parking_lot::RwLock<HashMap<UserId, UserDetails>>,
    books: parking_lot::RwLock<HashMap<BookId, BookDetails>>,
    // BTreeMap keeps reservations in id order, which is insertion order
    reservations: parking_lot::RwLock<BTreeMap<ReservationId, Reservation>>,
    user_sequence_generator: AtomicI32,
    book_sequence_generator: AtomicI32,
    reservation_sequence_generator: AtomicI32,
}

impl Default for InMemoryReservationsStore {
    fn default() -> Self {
        Self {
            users: Default::default(),
            books: Default::default(),
            reservations: Default::default(),
            user_sequence_generator: Default::default(),
            book_sequence_generator: Default::default(),
            reservation_sequence_generator: Default::default(),
        }
    }
}

fn now_unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[async_trait::async_trait]
impl ReservationsStore for InMemoryReservationsStore {
    async fn add_user(&self, details: UserDetails) -> Result<UserId, ReservationsStoreError> {
        let id = self.user_sequence_generator.fetch_add(1, Ordering::Relaxed);
        self.users.write().insert(id, details);
        Ok(id)
    }

    async fn get_user(&self, id: UserId) -> Result<UserDetails, ReservationsStoreError> {
        self.users
            .read()
            .get(&id)
            .cloned()
            .ok_or(ReservationsStoreError::UserNotFound(id))
    }

    async fn add_book(&self, details: BookDetails) -> Result<BookId, ReservationsStoreError> {
        let id = self.book_sequence_generator.fetch_add(1, Ordering::Relaxed);
        self.books.write().insert(id, details);
        Ok(id)
    }

    async fn get_book(&self, id: BookId) -> Result<BookDetails, ReservationsStoreError> {
        self.books
            .read()
            .get(&id)
            .cloned()
            .ok_or(ReservationsStoreError::BookNotFound(id))
    }

    async fn list_books(&self) -> Result<Vec<BookSummary>, ReservationsStoreError> {
        Ok(self
            .books
            .read()
            .iter()
            .map(|(&book_id, details)| BookSummary {
                book_id,
                title: details.title.clone(),
            })
            .collect())
    }

    async fn create_reservation(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Reservation, ReservationsStoreError> {
        if !self.users.read().contains_key(&user_id) {
            return Err(ReservationsStoreError::UserNotFound(user_id));
        }
        if !self.books.read().contains_key(&book_id) {
            return Err(ReservationsStoreError::BookNotFound(book_id));
        }

        let id = self
            .reservation_sequence_generator
            .fetch_add(1, Ordering::Relaxed);
        let reservation = Reservation {
            id,
            user_id,
            book_id,
            reservation_date: now_unix_seconds(),
            status: ReservationStatus::Active,
        };
        self.reservations.write().insert(id, reservation.clone());
        Ok(reservation)
    }

    async fn list_reservations(
        &self,
        user_id: UserId,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, ReservationsStoreError> {
        Ok(self
            .reservations
            .read()
            .values()
            .filter(|reservation| reservation.user_id == user_id)
            .filter(|reservation| status.map(|s| reservation.status == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<(), ReservationsStoreError> {
        let mut reservations_lock = self.reservations.write();

        // Ownership is not disclosed: a reservation held by someone else
        // looks the same as a missing one.
        match reservations_lock.get_mut(&reservation_id) {
            Some(reservation) if reservation.user_id != user_id => {
                Err(ReservationsStoreError::ReservationNotFound(reservation_id))
            }
            Some(reservation) if reservation.status == ReservationStatus::Cancelled => {
                Err(ReservationsStoreError::AlreadyCancelled(reservation_id))
            }
            Some(reservation) => {
                reservation.status = ReservationStatus::Cancelled;
                Ok(())
            }
            None => Err(ReservationsStoreError::ReservationNotFound(reservation_id)),
        }
    }
}
