//! Dual-write orchestration. Every business operation writes the portal
//! first and mirrors locally second; whichever step fails, the remaining
//! work is parked on the durable queue and the caller sees a soft success.
//! The one hard failure is a missing portal mapping: retrying cannot
//! resolve it, so it surfaces immediately and nothing is queued.

use crate::auth;
use crate::db::{self, Pool};
use crate::error::SyncError;
use crate::model::{
    Incident, IncidentUpdate, NewIncident, NewPortalUser, NewReservation, Reservation, SyncJob,
    SyncOutcome, SyncTask,
};
use crate::portal::{self, PortalService};
use crate::session::PortalCredential;
use crate::status::{self, ReservationStatus};
use tracing::{info, instrument, warn};

#[instrument(skip_all)]
pub async fn create_reservation(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
    input: NewReservation,
) -> Result<SyncOutcome<Reservation>, SyncError> {
    let unit_portal = db::get_unit_portal_id(pool, input.unit_id)
        .await
        .map_err(SyncError::local)?
        .ok_or_else(|| SyncError::Mapping(format!("unit {} is not linked to the portal", input.unit_id)))?;
    let amenity_portal = db::get_amenity_portal_id(pool, input.amenity_id)
        .await
        .map_err(SyncError::local)?
        .ok_or_else(|| {
            SyncError::Mapping(format!(
                "amenity {} is not linked to the portal",
                input.amenity_id
            ))
        })?;
    let remote = portal::build_reservation_request(&unit_portal, &amenity_portal, &input);

    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => cred,
        Err(err) => {
            return park(pool, SyncTask::RemoteCreateReservation { remote, local: input }, &err)
                .await
        }
    };
    let record = match portal.create_reservation(&cred, &remote).await {
        Ok(record) => record,
        Err(err) => {
            return park(pool, SyncTask::RemoteCreateReservation { remote, local: input }, &err)
                .await
        }
    };
    info!(portal_id = ?record.id, "reservation accepted by portal");

    match mirror_create_reservation(pool, &input, record.id.as_deref()).await {
        Ok(row) => Ok(SyncOutcome::Synced(row)),
        Err(err) => {
            let cause = SyncError::local(&err);
            park(
                pool,
                SyncTask::LocalCreateReservation {
                    local: input,
                    portal_id: record.id,
                },
                &cause,
            )
            .await
        }
    }
}

#[instrument(skip_all)]
pub async fn create_incident(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
    input: NewIncident,
) -> Result<SyncOutcome<Incident>, SyncError> {
    let building_portal = db::get_building_portal_id(pool, input.building_id)
        .await
        .map_err(SyncError::local)?
        .ok_or_else(|| {
            SyncError::Mapping(format!(
                "building {} is not linked to the portal",
                input.building_id
            ))
        })?;
    let remote = portal::build_incident_request(&building_portal, &input);

    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => cred,
        Err(err) => {
            return park(pool, SyncTask::RemoteCreateIncident { remote, local: input }, &err).await
        }
    };
    let record = match portal.create_incident(&cred, &remote).await {
        Ok(record) => record,
        Err(err) => {
            return park(pool, SyncTask::RemoteCreateIncident { remote, local: input }, &err).await
        }
    };
    info!(portal_id = ?record.id, "incident accepted by portal");

    match mirror_create_incident(pool, &input, record.id.as_deref()).await {
        Ok(row) => Ok(SyncOutcome::Synced(row)),
        Err(err) => {
            let cause = SyncError::local(&err);
            park(
                pool,
                SyncTask::LocalCreateIncident {
                    local: input,
                    portal_id: record.id,
                },
                &cause,
            )
            .await
        }
    }
}

#[instrument(skip_all)]
pub async fn update_incident(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
    incident_id: i64,
    update: IncidentUpdate,
) -> Result<SyncOutcome<Incident>, SyncError> {
    let portal_id = db::get_incident_portal_id(pool, incident_id)
        .await
        .map_err(SyncError::local)?
        .ok_or_else(|| {
            SyncError::Mapping(format!("incident {incident_id} is not linked to the portal"))
        })?;
    let remote = portal::build_incident_update_request(&update);

    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => cred,
        Err(err) => {
            return park(
                pool,
                SyncTask::RemoteUpdateIncident { remote, incident_id, portal_id, update },
                &err,
            )
            .await
        }
    };
    let record = match portal.update_incident(&cred, &portal_id, &remote).await {
        Ok(record) => record,
        Err(err) => {
            return park(
                pool,
                SyncTask::RemoteUpdateIncident { remote, incident_id, portal_id, update },
                &err,
            )
            .await
        }
    };

    let mirror = localized_incident_update(&update, record.status.as_deref());
    match db::update_incident(pool, incident_id, &mirror).await {
        Ok(()) => Ok(SyncOutcome::Synced(
            db::get_incident(pool, incident_id).await.map_err(SyncError::local)?,
        )),
        Err(err) => {
            let cause = SyncError::local(&err);
            park(
                pool,
                SyncTask::LocalUpdateIncident { incident_id, update: mirror },
                &cause,
            )
            .await
        }
    }
}

#[instrument(skip_all)]
pub async fn approve_reservation(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
    reservation_id: i64,
    approve: bool,
) -> Result<SyncOutcome<Reservation>, SyncError> {
    let portal_id = db::get_reservation_portal_id(pool, reservation_id)
        .await
        .map_err(SyncError::local)?
        .ok_or_else(|| {
            SyncError::Mapping(format!(
                "reservation {reservation_id} is not linked to the portal"
            ))
        })?;
    let remote = portal::build_approval_request(approve);

    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => cred,
        Err(err) => {
            return park(
                pool,
                SyncTask::RemoteApproveReservation { remote, reservation_id, portal_id, approve },
                &err,
            )
            .await
        }
    };
    let record = match portal.approve_reservation(&cred, &portal_id, &remote).await {
        Ok(record) => record,
        Err(err) => {
            return park(
                pool,
                SyncTask::RemoteApproveReservation { remote, reservation_id, portal_id, approve },
                &err,
            )
            .await
        }
    };

    match approval_status(approve, record.status.as_deref()) {
        Some(status) => {
            if let Err(err) = db::update_reservation_status(pool, reservation_id, status).await {
                let cause = SyncError::local(&err);
                return park(
                    pool,
                    SyncTask::LocalUpdateReservationStatus { reservation_id, status },
                    &cause,
                )
                .await;
            }
        }
        None => {
            info!(status = ?record.status, "portal returned unknown reservation status; mirror untouched")
        }
    }
    Ok(SyncOutcome::Synced(
        db::get_reservation(pool, reservation_id)
            .await
            .map_err(SyncError::local)?,
    ))
}

/// Provisioning has no mirror half: the portal call is the whole write.
#[instrument(skip_all)]
pub async fn provision_user(
    pool: &Pool,
    portal: &dyn PortalService,
    identity: Option<&str>,
    input: NewPortalUser,
) -> Result<SyncOutcome<()>, SyncError> {
    let remote = portal::build_user_request(&input);

    let cred = match auth::ensure_auth(pool, portal, identity).await {
        Ok(cred) => cred,
        Err(err) => return park(pool, SyncTask::RemoteProvisionUser { remote }, &err).await,
    };
    match portal.provision_user(&cred, &remote).await {
        Ok(_) => {
            info!(email = %input.email, "portal account provisioned");
            Ok(SyncOutcome::Synced(()))
        }
        Err(err) => park(pool, SyncTask::RemoteProvisionUser { remote }, &err).await,
    }
}

/// Re-attempt one parked job; called by the drainer. `Ok(())` releases the
/// job from the queue. A remote success followed by a failing mirror write
/// hands the remainder to a fresh local job instead of failing; re-running
/// the original job would hit the portal a second time.
pub(crate) async fn replay(
    pool: &Pool,
    portal: &dyn PortalService,
    cred: Option<&PortalCredential>,
    task: &SyncTask,
) -> Result<(), SyncError> {
    match task {
        SyncTask::RemoteCreateReservation { remote, local } => {
            let cred = require_session(cred)?;
            let record = portal.create_reservation(cred, remote).await?;
            if let Err(err) = mirror_create_reservation(pool, local, record.id.as_deref()).await {
                hand_off(
                    pool,
                    SyncTask::LocalCreateReservation {
                        local: local.clone(),
                        portal_id: record.id,
                    },
                    &err,
                )
                .await?;
            }
            Ok(())
        }
        SyncTask::RemoteCreateIncident { remote, local } => {
            let cred = require_session(cred)?;
            let record = portal.create_incident(cred, remote).await?;
            if let Err(err) = mirror_create_incident(pool, local, record.id.as_deref()).await {
                hand_off(
                    pool,
                    SyncTask::LocalCreateIncident {
                        local: local.clone(),
                        portal_id: record.id,
                    },
                    &err,
                )
                .await?;
            }
            Ok(())
        }
        SyncTask::RemoteUpdateIncident { remote, incident_id, portal_id, update } => {
            let cred = require_session(cred)?;
            let record = portal.update_incident(cred, portal_id, remote).await?;
            let mirror = localized_incident_update(update, record.status.as_deref());
            if let Err(err) = db::update_incident(pool, *incident_id, &mirror).await {
                hand_off(
                    pool,
                    SyncTask::LocalUpdateIncident { incident_id: *incident_id, update: mirror },
                    &err,
                )
                .await?;
            }
            Ok(())
        }
        SyncTask::RemoteApproveReservation { remote, reservation_id, portal_id, approve } => {
            let cred = require_session(cred)?;
            let record = portal.approve_reservation(cred, portal_id, remote).await?;
            if let Some(status) = approval_status(*approve, record.status.as_deref()) {
                if let Err(err) =
                    db::update_reservation_status(pool, *reservation_id, status).await
                {
                    hand_off(
                        pool,
                        SyncTask::LocalUpdateReservationStatus {
                            reservation_id: *reservation_id,
                            status,
                        },
                        &err,
                    )
                    .await?;
                }
            }
            Ok(())
        }
        SyncTask::RemoteProvisionUser { remote } => {
            let cred = require_session(cred)?;
            portal.provision_user(cred, remote).await?;
            Ok(())
        }
        SyncTask::LocalCreateReservation { local, portal_id } => {
            mirror_create_reservation(pool, local, portal_id.as_deref())
                .await
                .map_err(SyncError::local)?;
            Ok(())
        }
        SyncTask::LocalCreateIncident { local, portal_id } => {
            mirror_create_incident(pool, local, portal_id.as_deref())
                .await
                .map_err(SyncError::local)?;
            Ok(())
        }
        SyncTask::LocalUpdateIncident { incident_id, update } => {
            db::update_incident(pool, *incident_id, update)
                .await
                .map_err(SyncError::local)?;
            Ok(())
        }
        SyncTask::LocalUpdateReservationStatus { reservation_id, status } => {
            db::update_reservation_status(pool, *reservation_id, *status)
                .await
                .map_err(SyncError::local)?;
            Ok(())
        }
    }
}

/// Park the remaining work for a later drain and report a soft success.
async fn park<T>(pool: &Pool, task: SyncTask, cause: &SyncError) -> Result<SyncOutcome<T>, SyncError> {
    let mut job = SyncJob::new(task);
    job.last_error = Some(cause.to_string());
    warn!(kind = job.task.kind(), error = %cause, "deferring write to sync queue");
    db::enqueue_job(pool, &job).await.map_err(SyncError::local)?;
    Ok(SyncOutcome::Queued { job_id: job.id })
}

/// Mirror failed after the portal accepted the write: queue the local
/// remainder so the next pass skips the remote call entirely.
async fn hand_off(pool: &Pool, task: SyncTask, cause: &anyhow::Error) -> Result<(), SyncError> {
    let mut job = SyncJob::new(task);
    job.last_error = Some(cause.to_string());
    warn!(kind = job.task.kind(), error = %cause, "mirror write failed after portal success; queuing local remainder");
    db::enqueue_job(pool, &job).await.map_err(SyncError::local)?;
    Ok(())
}

fn require_session(cred: Option<&PortalCredential>) -> Result<&PortalCredential, SyncError> {
    cred.ok_or_else(|| SyncError::Auth("no portal session for remote replay".into()))
}

/// Idempotent mirror insert: an existing row for the same portal id or the
/// same logical slot is reused, so a duplicate replay can never produce two
/// rows for one reservation.
async fn mirror_create_reservation(
    pool: &Pool,
    input: &NewReservation,
    portal_id: Option<&str>,
) -> anyhow::Result<Reservation> {
    if let Some(pid) = portal_id {
        if let Some(existing) = db::find_reservation_by_portal_id(pool, pid).await? {
            return Ok(existing);
        }
    }
    if let Some(existing) = db::find_reservation_by_slot(pool, input).await? {
        if existing.portal_id.is_none() {
            if let Some(pid) = portal_id {
                db::update_reservation_portal_id(pool, existing.id, pid).await?;
                return db::get_reservation(pool, existing.id).await;
            }
        }
        return Ok(existing);
    }
    let id = db::create_reservation(pool, input, portal_id).await?;
    db::get_reservation(pool, id).await
}

async fn mirror_create_incident(
    pool: &Pool,
    input: &NewIncident,
    portal_id: Option<&str>,
) -> anyhow::Result<Incident> {
    if let Some(pid) = portal_id {
        if let Some(existing) = db::find_incident_by_portal_id(pool, pid).await? {
            return Ok(existing);
        }
    }
    let id = db::create_incident(pool, input, portal_id).await?;
    db::get_incident(pool, id).await
}

/// The portal's echoed status wins over the one we sent; an unknown echo
/// drops the status change and leaves the other fields intact.
fn localized_incident_update(update: &IncidentUpdate, remote_status: Option<&str>) -> IncidentUpdate {
    let status = match remote_status {
        Some(raw) => status::incident_status_from_portal(raw),
        None => update.status,
    };
    IncidentUpdate {
        status,
        description: update.description.clone(),
        priority: update.priority.clone(),
    }
}

fn approval_status(approve: bool, remote_status: Option<&str>) -> Option<ReservationStatus> {
    match remote_status {
        Some(raw) => status::reservation_status_from_portal(raw),
        None => Some(if approve {
            ReservationStatus::Approved
        } else {
            ReservationStatus::Rejected
        }),
    }
}
