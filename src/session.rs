//! Durable portal session state: the bearer credential, the identity email
//! used to re-establish a session after a restart, and the last role claim
//! seen at login (kept for display/diagnostics). Everything lives in the
//! `session_state` table under fixed keys.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

const KEY_TOKEN: &str = "portal_token";
const KEY_TOKEN_TYPE: &str = "portal_token_type";
const KEY_IDENTITY_EMAIL: &str = "portal_identity_email";
const KEY_LAST_ROLE: &str = "portal_last_role";

/// Current bearer credential. Process-wide: one identity at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalCredential {
    pub token: String,
    pub token_type: String,
}

impl PortalCredential {
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.token)
    }
}

pub async fn load_credential(pool: &SqlitePool) -> Result<Option<PortalCredential>> {
    let token = get_value(pool, KEY_TOKEN).await?;
    let token_type = get_value(pool, KEY_TOKEN_TYPE).await?;
    Ok(match (token, token_type) {
        (Some(token), Some(token_type)) => Some(PortalCredential { token, token_type }),
        _ => None,
    })
}

pub async fn store_credential(pool: &SqlitePool, cred: &PortalCredential) -> Result<()> {
    set_value(pool, KEY_TOKEN, &cred.token).await?;
    set_value(pool, KEY_TOKEN_TYPE, &cred.token_type).await
}

pub async fn clear_credential(pool: &SqlitePool) -> Result<()> {
    delete_value(pool, KEY_TOKEN).await?;
    delete_value(pool, KEY_TOKEN_TYPE).await
}

pub async fn identity_email(pool: &SqlitePool) -> Result<Option<String>> {
    get_value(pool, KEY_IDENTITY_EMAIL).await
}

pub async fn remember_identity(pool: &SqlitePool, email: &str) -> Result<()> {
    set_value(pool, KEY_IDENTITY_EMAIL, email).await
}

pub async fn last_role(pool: &SqlitePool) -> Result<Option<String>> {
    get_value(pool, KEY_LAST_ROLE).await
}

pub async fn store_last_role(pool: &SqlitePool, role: &str) -> Result<()> {
    set_value(pool, KEY_LAST_ROLE, role).await
}

async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM session_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

async fn set_value(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO session_state (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

async fn delete_value(pool: &SqlitePool, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM session_state WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn credential_survives_round_trip() {
        let pool = setup_pool().await;
        assert!(load_credential(&pool).await.unwrap().is_none());

        let cred = PortalCredential {
            token: "abc123".into(),
            token_type: "Bearer".into(),
        };
        store_credential(&pool, &cred).await.unwrap();
        assert_eq!(load_credential(&pool).await.unwrap(), Some(cred.clone()));
        assert_eq!(cred.authorization_header(), "Bearer abc123");

        clear_credential(&pool).await.unwrap();
        assert!(load_credential(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn half_present_credential_counts_as_absent() {
        let pool = setup_pool().await;
        set_value(&pool, KEY_TOKEN, "orphan").await.unwrap();
        assert!(load_credential(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identity_and_role_keys() {
        let pool = setup_pool().await;
        assert!(identity_email(&pool).await.unwrap().is_none());

        remember_identity(&pool, "ana@example.com").await.unwrap();
        remember_identity(&pool, "bob@example.com").await.unwrap();
        assert_eq!(
            identity_email(&pool).await.unwrap().as_deref(),
            Some("bob@example.com")
        );

        store_last_role(&pool, "ADMINISTRADOR").await.unwrap();
        assert_eq!(
            last_role(&pool).await.unwrap().as_deref(),
            Some("ADMINISTRADOR")
        );
    }
}
