use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};

pub type UserId = i32;
pub type BookId = i32;
pub type ReservationId = i32;

/// Lifecycle status of a reservation.
/// The only permitted transition is Active -> Cancelled; Cancelled is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Active => "active",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct UserDetails {
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct BookDetails {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub cover: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct BookSummary {
    pub book_id: BookId,
    pub title: String,
}

/// Authoritative reservation record as held by the reservation store.
/// Identity, owner and book never change after creation.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub book_id: BookId,
    /// Unix timestamp in seconds, set once at creation.
    pub reservation_date: i64,
    pub status: ReservationStatus,
}

/// Canonical representation returned by the API: the reservation plus the
/// joined book fields used for display. The book data is assembled at
/// response time and never persisted on the reservation row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReservationView {
    pub id: ReservationId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub reservation_date: i64,
    pub status: ReservationStatus,
    pub book: BookDetails,
}

impl ReservationView {
    pub fn new(reservation: Reservation, book: BookDetails) -> Self {
        Self {
            id: reservation.id,
            user_id: reservation.user_id,
            book_id: reservation.book_id,
            reservation_date: reservation.reservation_date,
            status: reservation.status,
            book,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct CreateReservationRequest {
    pub book_id: BookId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ReservationsQuery {
    pub status: Option<ReservationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationResponse {
    pub id: ReservationId,
    pub status: ReservationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct TokenResponse {
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct GetAllBooksResponse {
    pub books: Vec<BookSummary>,
}
