use std::time::UNIX_EPOCH;

use anyhow::Context;
use serde_json::json;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Statement};

use crate::api::{BookSummary, Reservation, ReservationStatus};
use crate::reservations_store::{
    BookDetails, BookId, ReservationId, ReservationsStore, ReservationsStoreError, UserDetails,
    UserId,
};

pub struct PostgresReservationsStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresReservationsStore {
    client: Client,
}

impl PostgresReservationsStore {
    pub async fn init(config: PostgresReservationsStoreConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
        tracing::info!("Postgres connection_str: {}", connection_str);
        let (client, connection) = tokio_postgres::connect(&connection_str, NoTls)
            .await
            .context("Failed to start postgres")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("connection error: {}", e);
            }
        });

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS users (
            id              SERIAL PRIMARY KEY,
            params          JSONB
            )
        ",
            )
            .await
            .context("Failed to setup users table")?;

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS books (
            id              SERIAL PRIMARY KEY,
            params          JSONB
            )
        ",
            )
            .await
            .context("Failed to setup books table")?;

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS reservations (
            id                  SERIAL PRIMARY KEY,
            user_id             INTEGER NOT NULL REFERENCES users (id),
            book_id             INTEGER NOT NULL REFERENCES books (id),
            reservation_date    BIGINT NOT NULL,
            status              TEXT NOT NULL
            )
        ",
            )
            .await
            .context("Failed to setup reservations table")?;

        Ok(Self { client })
    }
}

fn now_unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

fn status_from_column(value: &str) -> Result<ReservationStatus, ReservationsStoreError> {
    match value {
        "active" => Ok(ReservationStatus::Active),
        "cancelled" => Ok(ReservationStatus::Cancelled),
        other => Err(ReservationsStoreError::Other(format!(
            "Unknown reservation status {other}"
        ))),
    }
}

fn reservation_from_row(row: &tokio_postgres::Row) -> Result<Reservation, ReservationsStoreError> {
    let status: String = row.try_get(4)?;
    Ok(Reservation {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        book_id: row.try_get(2)?,
        reservation_date: row.try_get(3)?,
        status: status_from_column(&status)?,
    })
}

#[async_trait::async_trait]
impl ReservationsStore for PostgresReservationsStore {
    async fn add_user(&self, details: UserDetails) -> Result<UserId, ReservationsStoreError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO users (params) VALUES ($1) RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&json!(details)]).await?;

        let user_id: UserId = rows
            .first()
            .ok_or_else(|| ReservationsStoreError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(user_id)
    }

    async fn get_user(&self, id: UserId) -> Result<UserDetails, ReservationsStoreError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT params FROM users WHERE id = ($1)")
            .await?;

        let rows = self.client.query(&stmt, &[&id]).await?;

        let details: serde_json::Value = rows
            .first()
            .ok_or(ReservationsStoreError::UserNotFound(id))?
            .try_get(0)?;

        Ok(serde_json::from_value(details)?)
    }

    async fn add_book(&self, details: BookDetails) -> Result<BookId, ReservationsStoreError> {
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO books (params) VALUES ($1) RETURNING id")
            .await?;

        let rows = self.client.query(&stmt, &[&json!(details)]).await?;

        let book_id: BookId = rows
            .first()
            .ok_or_else(|| ReservationsStoreError::Other("Id not returned".to_string()))?
            .try_get(0)?;

        Ok(book_id)
    }

    async fn get_book(&self, id: BookId) -> Result<BookDetails, ReservationsStoreError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT params FROM books WHERE id = ($1)")
            .await?;

        let rows = self.client.query(&stmt, &[&id]).await?;

        let details: serde_json::Value = rows
            .first()
            .ok_or(ReservationsStoreError::BookNotFound(id))?
            .try_get(0)?;

        Ok(serde_json::from_value(details)?)
    }

    async fn list_books(&self) -> Result<Vec<BookSummary>, ReservationsStoreError> {
        let stmt: Statement = self.client.prepare("SELECT id, params FROM books").await?;
        let rows = self.client.query(&stmt, &[]).await?;

        rows.iter()
            .map(|row| {
                let book_id: BookId = row.try_get(0)?;
                let details: serde_json::Value = row.try_get(1)?;
                let details: BookDetails = serde_json::from_value(details)?;
                Ok(BookSummary {
                    book_id,
                    title: details.title,
                })
            })
            .collect()
    }

    async fn create_reservation(
        &self,
        user_id: UserId,
        book_id: BookId,
    ) -> Result<Reservation, ReservationsStoreError> {
        let stmt: Statement = self
            .client
            .prepare(
                "INSERT INTO reservations (user_id, book_id, reservation_date, status) \
                 VALUES ($1, $2, $3, 'active') RETURNING id",
            )
            .await?;

        let reservation_date = now_unix_seconds();
        let rows = self
            .client
            .query(&stmt, &[&user_id, &book_id, &reservation_date])
            .await;

        match rows {
            Ok(rows) => {
                let id: ReservationId = rows
                    .first()
                    .ok_or_else(|| ReservationsStoreError::Other("Id not returned".to_string()))?
                    .try_get(0)?;
                Ok(Reservation {
                    id,
                    user_id,
                    book_id,
                    reservation_date,
                    status: ReservationStatus::Active,
                })
            }
            Err(err)
                if err
                    .as_db_error()
                    // This is a foreign key violation error - one of the
                    // referenced entities does not exist
                    .map(|db_err| db_err.code() == &SqlState::from_code("23503"))
                    .unwrap_or_default() =>
            {
                let constraint = err
                    .as_db_error()
                    .and_then(|db_err| db_err.constraint())
                    .unwrap_or_default();
                if constraint.contains("user_id") {
                    Err(ReservationsStoreError::UserNotFound(user_id))
                } else {
                    Err(ReservationsStoreError::BookNotFound(book_id))
                }
            }
            Err(other_err) => Err(other_err.into()),
        }
    }

    async fn list_reservations(
        &self,
        user_id: UserId,
        status: Option<ReservationStatus>,
    ) -> Result<Vec<Reservation>, ReservationsStoreError> {
        let rows = match status {
            Some(status) => {
                let stmt: Statement = self
                    .client
                    .prepare(
                        "SELECT id, user_id, book_id, reservation_date, status \
                         FROM reservations WHERE user_id = $1 AND status = $2 ORDER BY id",
                    )
                    .await?;
                self.client
                    .query(&stmt, &[&user_id, &status.as_str()])
                    .await?
            }
            None => {
                let stmt: Statement = self
                    .client
                    .prepare(
                        "SELECT id, user_id, book_id, reservation_date, status \
                         FROM reservations WHERE user_id = $1 ORDER BY id",
                    )
                    .await?;
                self.client.query(&stmt, &[&user_id]).await?
            }
        };

        rows.iter().map(reservation_from_row).collect()
    }

    async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<(), ReservationsStoreError> {
        // The transition is a single conditional update, so of two
        // concurrent cancels exactly one can match the active row.
        let stmt: Statement = self
            .client
            .prepare(
                "UPDATE reservations SET status = 'cancelled' \
                 WHERE id = $1 AND user_id = $2 AND status = 'active' RETURNING id",
            )
            .await?;

        let rows = self.client.query(&stmt, &[&reservation_id, &user_id]).await?;

        if !rows.is_empty() {
            return Ok(());
        }

        // Nothing matched: either the row is missing / owned by someone
        // else, or it is already in the terminal state.
        let stmt: Statement = self
            .client
            .prepare("SELECT status FROM reservations WHERE id = $1 AND user_id = $2")
            .await?;

        let rows = self.client.query(&stmt, &[&reservation_id, &user_id]).await?;

        match rows.first() {
            Some(_) => Err(ReservationsStoreError::AlreadyCancelled(reservation_id)),
            None => Err(ReservationsStoreError::ReservationNotFound(reservation_id)),
        }
    }
}

#[cfg(test)]
mod tests_postgres_reservations_store {
    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use super::*;

    async fn start_postgres_container_and_init_store(
    ) -> (ContainerAsync<GenericImage>, PostgresReservationsStore) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(store) =
                PostgresReservationsStore::init(PostgresReservationsStoreConfig {
                    hostname: "127.0.0.1".to_string(),
                    username: "postgres".to_string(),
                    password: "postgres".to_string(),
                })
                .await
            {
                return (_pg_container, store);
            }
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
    }

    fn user(username: &str) -> UserDetails {
        UserDetails {
            username: username.to_string(),
            email: format!("{username}@example.com"),
        }
    }

    fn book(title: &str) -> BookDetails {
        BookDetails {
            title: title.to_string(),
            author: "Author1".to_string(),
            genre: "Genre1".to_string(),
            cover: "/covers/1.png".to_string(),
        }
    }

    #[tokio::test]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Simple test to cover the full reservation lifecycle against postgres
    /// Combined into big unit test to avoid starting the container multiple times
    /// 1. Creates users and a book, checks they round-trip
    /// 2. Creates a reservation - expects active status
    /// 3. Creating against unknown references is rejected via FK checks
    /// 4. Lists reservations and checks the round-trip
    /// 5. Cancelling by the wrong user or with an unknown id is rejected
    /// 6. Cancels, then cancels again to get AlreadyCancelled
    /// 7. Checks the cancelled row is still listed, and the status filter
    async fn test_reservation_lifecycle() {
        let (_container, store) = start_postgres_container_and_init_store().await;

        let user_details = user("user1");
        let user_1_id = store.add_user(user_details.clone()).await.unwrap();
        let user_2_id = store.add_user(user("user2")).await.unwrap();
        assert_eq!(store.get_user(user_1_id).await.unwrap(), user_details);

        let get_unknown_user = store.get_user(user_2_id + 1).await;
        assert!(matches!(
            get_unknown_user,
            Err(ReservationsStoreError::UserNotFound(..))
        ));

        let book_details = book("title1");
        let book_id = store.add_book(book_details.clone()).await.unwrap();
        assert_eq!(store.get_book(book_id).await.unwrap(), book_details);

        let listed_books = store.list_books().await.unwrap();
        assert!(listed_books
            .iter()
            .any(|summary| summary.book_id == book_id && summary.title == "title1"));

        let reservation = store
            .create_reservation(user_1_id, book_id)
            .await
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Active);
        assert!(reservation.reservation_date > 0);

        let unknown_book = store.create_reservation(user_1_id, book_id + 1000).await;
        assert!(matches!(
            unknown_book,
            Err(ReservationsStoreError::BookNotFound(..))
        ));

        let unknown_user = store.create_reservation(user_2_id + 1000, book_id).await;
        assert!(matches!(
            unknown_user,
            Err(ReservationsStoreError::UserNotFound(..))
        ));

        let listed = store.list_reservations(user_1_id, None).await.unwrap();
        assert_eq!(listed, vec![reservation.clone()]);

        let cancel_by_other_user = store.cancel_reservation(reservation.id, user_2_id).await;
        assert!(matches!(
            cancel_by_other_user,
            Err(ReservationsStoreError::ReservationNotFound(..))
        ));

        let cancel_unknown = store.cancel_reservation(reservation.id + 1000, user_1_id).await;
        assert!(matches!(
            cancel_unknown,
            Err(ReservationsStoreError::ReservationNotFound(..))
        ));

        store
            .cancel_reservation(reservation.id, user_1_id)
            .await
            .unwrap();

        let cancel_again = store.cancel_reservation(reservation.id, user_1_id).await;
        assert!(matches!(
            cancel_again,
            Err(ReservationsStoreError::AlreadyCancelled(..))
        ));

        let listed = store.list_reservations(user_1_id, None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ReservationStatus::Cancelled);
        assert_eq!(listed[0].id, reservation.id);

        let active_only = store
            .list_reservations(user_1_id, Some(ReservationStatus::Active))
            .await
            .unwrap();
        assert_eq!(active_only, vec![]);

        let cancelled_only = store
            .list_reservations(user_1_id, Some(ReservationStatus::Cancelled))
            .await
            .unwrap();
        assert_eq!(cancelled_only.len(), 1);
    }
}
