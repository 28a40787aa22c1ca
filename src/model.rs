use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::status::{IncidentStatus, ReservationStatus};

/// Input for a new reservation, in local vocabulary (local row ids). The
/// unit and amenity ids are resolved to portal ids before the remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewReservation {
    pub user_id: i64,
    pub unit_id: i64,
    pub amenity_id: i64,
    pub date: String,
    pub start: String,
    pub end: String,
    pub notes: Option<String>,
}

/// Input for a new incident report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIncident {
    pub user_id: i64,
    pub building_id: i64,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub priority: Option<String>,
}

/// Partial update applied to an incident. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentUpdate {
    pub status: Option<IncidentStatus>,
    pub description: Option<String>,
    pub priority: Option<String>,
}

/// Input for provisioning a portal account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPortalUser {
    pub email: String,
    pub full_name: String,
    pub role: String,
    pub unit_label: Option<String>,
}

/// Partial update applied to a local user row.
#[derive(Debug, Clone, Default)]
pub struct UserProfileUpdate {
    pub full_name: Option<String>,
    pub role: Option<String>,
    pub portal_id: Option<String>,
}

/// One unit of deferred reconciliation work. `Remote*` variants re-run the
/// portal call with the payload built at original call time; `Local*`
/// variants only retry the mirror write after the portal already accepted
/// the change. Remote create variants carry the local payload too, so a
/// late success can finish the mirror write without re-deriving input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SyncTask {
    RemoteCreateReservation {
        remote: Value,
        local: NewReservation,
    },
    RemoteCreateIncident {
        remote: Value,
        local: NewIncident,
    },
    RemoteUpdateIncident {
        remote: Value,
        incident_id: i64,
        portal_id: String,
        update: IncidentUpdate,
    },
    RemoteApproveReservation {
        remote: Value,
        reservation_id: i64,
        portal_id: String,
        approve: bool,
    },
    RemoteProvisionUser {
        remote: Value,
    },
    LocalCreateReservation {
        local: NewReservation,
        portal_id: Option<String>,
    },
    LocalCreateIncident {
        local: NewIncident,
        portal_id: Option<String>,
    },
    LocalUpdateIncident {
        incident_id: i64,
        update: IncidentUpdate,
    },
    LocalUpdateReservationStatus {
        reservation_id: i64,
        status: ReservationStatus,
    },
}

impl SyncTask {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncTask::RemoteCreateReservation { .. } => "remote-create-reservation",
            SyncTask::RemoteCreateIncident { .. } => "remote-create-incident",
            SyncTask::RemoteUpdateIncident { .. } => "remote-update-incident",
            SyncTask::RemoteApproveReservation { .. } => "remote-approve-reservation",
            SyncTask::RemoteProvisionUser { .. } => "remote-provision-user",
            SyncTask::LocalCreateReservation { .. } => "local-create-reservation",
            SyncTask::LocalCreateIncident { .. } => "local-create-incident",
            SyncTask::LocalUpdateIncident { .. } => "local-update-incident",
            SyncTask::LocalUpdateReservationStatus { .. } => "local-update-reservation-status",
        }
    }
}

/// A persisted sync job. `seq` is assigned by the queue on insert and is
/// what keeps replay order stable; `attempts` only ever grows, `last_error`
/// is overwritten on every failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub seq: i64,
    pub id: Uuid,
    pub task: SyncTask,
    pub created_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

impl SyncJob {
    pub fn new(task: SyncTask) -> Self {
        Self {
            seq: 0,
            id: Uuid::new_v4(),
            task,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// Result of a dual-write operation. `Queued` is a soft success: the write
/// was accepted and parked for a later drain, not rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    Synced(T),
    Queued { job_id: Uuid },
}

impl<T> SyncOutcome<T> {
    pub fn is_queued(&self) -> bool {
        matches!(self, SyncOutcome::Queued { .. })
    }
}

/// Local mirror row for a reservation.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: i64,
    pub user_id: i64,
    pub amenity_id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub notes: Option<String>,
    pub status: String,
    pub portal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Local mirror row for an incident.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Incident {
    pub id: i64,
    pub user_id: i64,
    pub building_id: i64,
    pub kind: String,
    pub title: String,
    pub description: String,
    pub location: Option<String>,
    pub priority: Option<String>,
    pub status: String,
    pub portal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_serializes_with_kind_tag() {
        let task = SyncTask::RemoteProvisionUser {
            remote: json!({ "correo": "a@b.c" }),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "remote-provision-user");
        assert_eq!(value["remote"]["correo"], "a@b.c");

        let back: SyncTask = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind(), "remote-provision-user");
    }

    #[test]
    fn kind_tags_match_wire_names() {
        let task = SyncTask::LocalUpdateReservationStatus {
            reservation_id: 1,
            status: crate::status::ReservationStatus::Approved,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], task.kind());
        assert_eq!(value["status"], "approved");
    }

    #[test]
    fn new_job_starts_clean() {
        let job = SyncJob::new(SyncTask::RemoteProvisionUser {
            remote: json!({}),
        });
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }
}
