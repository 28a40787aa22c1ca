//! Portal session lifecycle: login, credential reuse, and the best-effort
//! role sync that keeps the two systems' notion of "who can do what"
//! aligned.

use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::UserProfileUpdate;
use crate::portal::PortalService;
use crate::session::{self, PortalCredential};
use crate::status;
use tracing::{info, instrument, warn};

/// Log in against the portal with the identity email, persist the returned
/// credential, and opportunistically re-derive the local user's role from
/// the role claim. An unknown role claim skips the role sync; login itself
/// still succeeds as long as a token came back.
#[instrument(skip_all)]
pub async fn login(
    pool: &Pool,
    portal: &dyn PortalService,
    email: &str,
) -> Result<PortalCredential, SyncError> {
    let claims = portal.login(email).await?;
    let cred = PortalCredential {
        token: claims.token,
        token_type: claims.token_type,
    };
    session::store_credential(pool, &cred)
        .await
        .map_err(SyncError::local)?;
    session::remember_identity(pool, email)
        .await
        .map_err(SyncError::local)?;

    if let Some(raw_role) = claims.role {
        if let Err(err) = session::store_last_role(pool, &raw_role).await {
            warn!(error = %err, "failed to record last portal role");
        }
        match status::role_from_portal(&raw_role) {
            Some(role) => {
                if let Err(err) = sync_local_role(pool, email, role).await {
                    warn!(error = %err, role, "role sync failed; continuing with login");
                }
            }
            None => {
                info!(role = %raw_role, "portal role has no local equivalent; skipping role sync")
            }
        }
    }

    Ok(cred)
}

/// Drop the persisted credential (sign-out).
pub async fn logout(pool: &Pool) -> Result<(), SyncError> {
    session::clear_credential(pool).await.map_err(SyncError::local)
}

async fn sync_local_role(pool: &Pool, email: &str, role: &str) -> anyhow::Result<()> {
    let Some(user_id) = db::find_user_by_email(pool, email).await? else {
        // No mirror row for this identity yet; nothing to align.
        return Ok(());
    };
    db::update_user_profile(
        pool,
        user_id,
        &UserProfileUpdate {
            role: Some(role.to_string()),
            ..Default::default()
        },
    )
    .await?;
    db::set_user_roles(pool, user_id, &[role]).await?;
    Ok(())
}

/// Guard invoked before anything that talks to the portal. Reuses the
/// persisted credential without a network call when one exists; otherwise
/// logs in with the given email, falling back to the identity remembered
/// from the last successful login (which is what heals a process restart).
#[instrument(skip_all)]
pub async fn ensure_auth(
    pool: &Pool,
    portal: &dyn PortalService,
    email: Option<&str>,
) -> Result<PortalCredential, SyncError> {
    if let Some(cred) = session::load_credential(pool).await.map_err(SyncError::local)? {
        return Ok(cred);
    }

    let remembered = session::identity_email(pool).await.map_err(SyncError::local)?;
    let email = match email.map(str::to_string).or(remembered) {
        Some(email) => email,
        None => {
            return Err(SyncError::Auth(
                "no credential and no identity email on record".into(),
            ))
        }
    };
    login(pool, portal, &email).await
}
