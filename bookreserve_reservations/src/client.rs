use anyhow::{bail, Context};
use reqwest::header::LOCATION;
use reqwest::StatusCode;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;

use crate::api::{
    BookDetails, BookId, BookSummary, CreateReservationRequest, ErrorResponse,
    GetAllBooksResponse, ReservationId, ReservationStatus, ReservationView, TokenResponse,
    UserDetails, UserId,
};

pub struct ReservationServiceClient {
    url: String,
    client: ClientWithMiddleware,
}

impl ReservationServiceClient {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .build()
            .context("Failed to build reqwest client")?;
        let client = ClientBuilder::new(reqwest_client)
            // Insert the tracing middleware
            .with(TracingMiddleware::default())
            .build();

        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    async fn error_message(response: reqwest::Response) -> String {
        let error: ErrorResponse = response.json().await.unwrap_or_default();
        error.error
    }

    /// Calls POST /api/user endpoint
    /// Returns user_id of added user in response
    pub async fn add_user(&self, user_details: UserDetails) -> anyhow::Result<UserId> {
        let response = self
            .client
            .post(format!("{}/api/user", self.url))
            .json(&user_details)
            .send()
            .await?;

        if !response.status().is_success() {
            let error = Self::error_message(response).await;
            bail!("Failed to add user {}", error)
        }

        let location_header = response
            .headers()
            .get(LOCATION)
            .context("No location header")?;

        location_header
            .to_str()
            .context("Failed to convert header to str")?
            .strip_prefix("/api/user/")
            .context("Invalid location header")?
            .parse()
            .context("Failed to parse user id")
    }

    /// Calls GET /api/user/{user_id} endpoint
    /// Returns user details if user was present
    /// None if user was not in the store
    /// and error in case of any other failure
    pub async fn get_user(&self, user_id: UserId) -> anyhow::Result<Option<UserDetails>> {
        let response = self
            .client
            .get(format!("{}/api/user/{}", self.url, user_id))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            Ok(None)
        } else if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to get user {}", error)
        }
    }

    /// Calls POST /api/user/{user_id}/token endpoint
    /// Returns a fresh bearer token for the user
    pub async fn issue_token(&self, user_id: UserId) -> anyhow::Result<String> {
        let response = self
            .client
            .post(format!("{}/api/user/{}/token", self.url, user_id))
            .send()
            .await?;

        if response.status().is_success() {
            let token: TokenResponse = response.json().await?;
            Ok(token.token)
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to issue token {}", error)
        }
    }

    /// Calls POST /api/book endpoint
    /// Returns book_id of added book in response
    pub async fn add_book(&self, book_details: BookDetails) -> anyhow::Result<BookId> {
        let response = self
            .client
            .post(format!("{}/api/book", self.url))
            .json(&book_details)
            .send()
            .await?;

        if !response.status().is_success() {
            let error = Self::error_message(response).await;
            bail!("Failed to add book {}", error)
        }

        let location_header = response
            .headers()
            .get(LOCATION)
            .context("No location header")?;

        location_header
            .to_str()
            .context("Failed to convert header to str")?
            .strip_prefix("/api/book/")
            .context("Invalid location header")?
            .parse()
            .context("Failed to parse book id")
    }

    /// Calls GET /api/books endpoint
    pub async fn list_books(&self) -> anyhow::Result<Vec<BookSummary>> {
        let response = self
            .client
            .get(format!("{}/api/books", self.url))
            .send()
            .await?;
        if response.status().is_success() {
            let listing: GetAllBooksResponse = response.json().await?;
            Ok(listing.books)
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to list books {}", error)
        }
    }

    /// Calls POST /api/reservations endpoint with the bearer credential
    /// Returns the canonical reservation record, including the joined
    /// book fields
    pub async fn create_reservation(
        &self,
        token: &str,
        book_id: BookId,
    ) -> anyhow::Result<ReservationView> {
        let response = self
            .client
            .post(format!("{}/api/reservations", self.url))
            .bearer_auth(token)
            .json(&CreateReservationRequest { book_id })
            .send()
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to create reservation: {}", error)
        }
    }

    /// Calls GET /api/reservations/my-reservations endpoint with the
    /// bearer credential, optionally narrowed to a single status
    pub async fn my_reservations(
        &self,
        token: &str,
        status: Option<ReservationStatus>,
    ) -> anyhow::Result<Vec<ReservationView>> {
        let mut request = self
            .client
            .get(format!("{}/api/reservations/my-reservations", self.url))
            .bearer_auth(token);
        if let Some(status) = status {
            request = request.query(&[("status", status.as_str())]);
        }

        let response = request.send().await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to list reservations: {}", error)
        }
    }

    /// Calls PUT /api/reservations/{reservation_id}/cancel endpoint with
    /// the bearer credential
    pub async fn cancel_reservation(
        &self,
        token: &str,
        reservation_id: ReservationId,
    ) -> anyhow::Result<()> {
        let response = self
            .client
            .put(format!(
                "{}/api/reservations/{}/cancel",
                self.url, reservation_id
            ))
            .bearer_auth(token)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let error = Self::error_message(response).await;
            bail!("Failed to cancel reservation: {}", error)
        }
    }
}
