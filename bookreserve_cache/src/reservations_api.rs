use bookreserve_reservations::api::{BookId, ReservationId, ReservationStatus, ReservationView};
use bookreserve_reservations::client::ReservationServiceClient;

/// The server operations the reservation cache synchronizes through.
///
/// Implemented by the HTTP client below; unit tests substitute doubles so
/// the cache logic is exercised without a network.
#[async_trait::async_trait]
pub trait ReservationsApi: Send + Sync {
    async fn create_reservation(
        &self,
        token: &str,
        book_id: BookId,
    ) -> anyhow::Result<ReservationView>;

    async fn my_reservations(
        &self,
        token: &str,
        status: Option<ReservationStatus>,
    ) -> anyhow::Result<Vec<ReservationView>>;

    async fn cancel_reservation(
        &self,
        token: &str,
        reservation_id: ReservationId,
    ) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
impl ReservationsApi for ReservationServiceClient {
    async fn create_reservation(
        &self,
        token: &str,
        book_id: BookId,
    ) -> anyhow::Result<ReservationView> {
        ReservationServiceClient::create_reservation(self, token, book_id).await
    }

    async fn my_reservations(
        &self,
        token: &str,
        status: Option<ReservationStatus>,
    ) -> anyhow::Result<Vec<ReservationView>> {
        ReservationServiceClient::my_reservations(self, token, status).await
    }

    async fn cancel_reservation(
        &self,
        token: &str,
        reservation_id: ReservationId,
    ) -> anyhow::Result<()> {
        ReservationServiceClient::cancel_reservation(self, token, reservation_id).await
    }
}
