pub use in_memory_reservations_store::InMemoryReservationsStore;
pub use postgres_reservations_store::{
    PostgresReservationsStore, PostgresReservationsStoreConfig,
};

use crate::api::{
    BookDetails, BookId, BookSummary, Reservation, ReservationId, ReservationStatus, UserDetails,
    UserId,
};

mod in_memory_reservations_store;
mod postgres_reservations_store;

#[derive(Debug, thiserror::Error)]
pub enum ReservationsStoreError {
    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("Reservation {0} not found")]
    ReservationNotFound(ReservationId),

    #[error("Reservation {0} is already cancelled")]
    AlreadyCancelled(ReservationId),

    #[error("Failed to deserialize record: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait ReservationsStore: Send + Sync {
    /// Adds a user, returns the id assigned by the store
    async fn add_user(&self, details: UserDetails) -> Result<UserId, ReservationsStoreError>;

    async fn get_user(&self, id: UserId) -> Result<UserDetails, ReservationsStoreError>;

    /// Adds a book, returns the id assigned by the store
    async fn add_book(&self, details: BookDetails) -> Result<BookId, ReservationsStoreError>;

    async fn get_book(&self, id: BookId) -> Result<BookDetails, ReservationsStoreError>;

    async fn list_books(&self) -> Result<Vec<BookSummary>, ReservationsStoreError>;

    /// Creates an active reservation of the book for the user.
    /// Both referenced entities must exist.
    async fn create_reservation(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Reservation, ReservationsStoreError>;

    /// Lists the user's reservations in insertion order, optionally
    /// narrowed to a single status.
    async fn list_reservations(
        &self,
        user_id: UserId,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, ReservationsStoreError>;

    /// Flips the reservation to cancelled iff it exists, belongs to the
    /// user and is still active. Cancelled rows stay in place; they are
    /// never deleted.
    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<(), ReservationsStoreError>;
}
