use std::collections::HashMap;

use actix_web::http::header::AUTHORIZATION;
use actix_web::HttpRequest;
use anyhow::Context;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio_postgres::{Client, NoTls, Statement};

use crate::api::UserId;

/// Pulls the bearer credential out of the Authorization header.
/// Its absence is the sole signal of an unauthenticated caller.
pub fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum AccessTokensError {
    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(#[from] tokio_postgres::Error),

    #[error("Other error {0}")]
    Other(String),
}

#[async_trait::async_trait]
pub trait AccessTokens: Send + Sync {
    /// Mints a fresh opaque bearer token for the user
    async fn issue(&self, user_id: UserId) -> Result<String, AccessTokensError>;

    /// Resolves a bearer token to the owning user, None if unknown
    async fn resolve(&self, token: &str) -> Result<Option<UserId>, AccessTokensError>;
}

#[derive(Default)]
pub struct InMemoryAccessTokens {
    tokens: parking_lot::RwLock<HashMap<String, UserId>>,
}

#[async_trait::async_trait]
impl AccessTokens for InMemoryAccessTokens {
    async fn issue(&self, user_id: UserId) -> Result<String, AccessTokensError> {
        let token = mint_token();
        self.tokens.write().insert(token.clone(), user_id);
        Ok(token)
    }

    async fn resolve(&self, token: &str) -> Result<Option<UserId>, AccessTokensError> {
        Ok(self.tokens.read().get(token).cloned())
    }
}

pub struct PostgresAccessTokensConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
}

pub struct PostgresAccessTokens {
    client: Client,
}

impl PostgresAccessTokens {
    pub async fn init(config: PostgresAccessTokensConfig) -> anyhow::Result<Self> {
        let connection_str = format!(
            "postgresql://{}:{}@{}",
            config.username, config.password, config.hostname
        );
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
        CREATE TABLE IF NOT EXISTS access_tokens (
            token           TEXT PRIMARY KEY,
            user_id         INTEGER NOT NULL
            )
        ",
            )
            .await
            .context("Failed to setup access_tokens table")?;

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AccessTokens for PostgresAccessTokens {
    async fn issue(&self, user_id: UserId) -> Result<String, AccessTokensError> {
        let token = mint_token();
        let stmt: Statement = self
            .client
            .prepare("INSERT INTO access_tokens (token, user_id) VALUES ($1, $2)")
            .await?;

        self.client.execute(&stmt, &[&token, &user_id]).await?;
        Ok(token)
    }

    async fn resolve(&self, token: &str) -> Result<Option<UserId>, AccessTokensError> {
        let stmt: Statement = self
            .client
            .prepare("SELECT user_id FROM access_tokens WHERE token = $1")
            .await?;

        let rows = self.client.query(&stmt, &[&token]).await?;

        match rows.first() {
            Some(row) => Ok(Some(row.try_get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests_access_tokens {
    use super::*;

    #[tokio::test]
    /// 1. Resolving an unknown token yields None
    /// 2. Issued tokens resolve to their user
    /// 3. Two tokens issued for the same user are distinct and both resolve
    async fn test_issue_and_resolve() {
        let tokens = InMemoryAccessTokens::default();

        assert_eq!(tokens.resolve("no-such-token").await.unwrap(), None);

        let token_1 = tokens.issue(7).await.unwrap();
        let token_2 = tokens.issue(7).await.unwrap();
        assert_ne!(token_1, token_2);

        assert_eq!(tokens.resolve(&token_1).await.unwrap(), Some(7));
        assert_eq!(tokens.resolve(&token_2).await.unwrap(), Some(7));

        let token_other = tokens.issue(8).await.unwrap();
        assert_eq!(tokens.resolve(&token_other).await.unwrap(), Some(8));
    }
}
