//! Local mirror store and the durable sync queue, on SQLite. The mirror CRUD
//! surface here is the contract the sync core holds against the local store;
//! the queue functions are the persistence half of the retry machinery.

use crate::model::{
    Incident, IncidentUpdate, NewIncident, NewReservation, Reservation, SyncJob, SyncTask,
    UserProfileUpdate,
};
use crate::status::ReservationStatus;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus full sync: the queue is the only record of unconfirmed writes.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path = rest.trim_start_matches("//");
    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    if path.is_empty() {
        return url.to_string();
    }
    let expanded = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    match query {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- users -----------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_user(
    pool: &Pool,
    email: &str,
    full_name: Option<&str>,
    role: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO users (email, full_name, role) VALUES (?, ?, ?) RETURNING id")
        .bind(email)
        .bind(full_name)
        .bind(role)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn find_user_by_email(pool: &Pool, email: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn update_user_profile(pool: &Pool, user_id: i64, fields: &UserProfileUpdate) -> Result<()> {
    sqlx::query(
        "UPDATE users SET \
           full_name = COALESCE(?, full_name), \
           role = COALESCE(?, role), \
           portal_id = COALESCE(?, portal_id) \
         WHERE id = ?",
    )
    .bind(fields.full_name.as_deref())
    .bind(fields.role.as_deref())
    .bind(fields.portal_id.as_deref())
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the user's role list wholesale.
#[instrument(skip_all)]
pub async fn set_user_roles(pool: &Pool, user_id: i64, roles: &[&str]) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM user_roles WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    for role in roles {
        sqlx::query("INSERT INTO user_roles (user_id, role) VALUES (?, ?)")
            .bind(user_id)
            .bind(role)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn user_roles(pool: &Pool, user_id: i64) -> Result<Vec<String>> {
    let roles =
        sqlx::query_scalar::<_, String>("SELECT role FROM user_roles WHERE user_id = ? ORDER BY role")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
    Ok(roles)
}

pub async fn user_role(pool: &Pool, user_id: i64) -> Result<Option<String>> {
    let role = sqlx::query_scalar::<_, Option<String>>("SELECT role FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(role.flatten())
}

// ---- buildings / units / amenities -----------------------------------------

pub async fn create_building(pool: &Pool, name: &str, portal_id: Option<&str>) -> Result<i64> {
    let rec = sqlx::query("INSERT INTO buildings (name, portal_id) VALUES (?, ?) RETURNING id")
        .bind(name)
        .bind(portal_id)
        .fetch_one(pool)
        .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn create_unit(
    pool: &Pool,
    building_id: i64,
    label: &str,
    portal_id: Option<&str>,
) -> Result<i64> {
    let rec =
        sqlx::query("INSERT INTO units (building_id, label, portal_id) VALUES (?, ?, ?) RETURNING id")
            .bind(building_id)
            .bind(label)
            .bind(portal_id)
            .fetch_one(pool)
            .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn create_amenity(
    pool: &Pool,
    building_id: i64,
    name: &str,
    portal_id: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO amenities (building_id, name, portal_id) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(building_id)
    .bind(name)
    .bind(portal_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// `None` covers both a missing row and a row that was never linked.
pub async fn get_unit_portal_id(pool: &Pool, unit_id: i64) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, Option<String>>("SELECT portal_id FROM units WHERE id = ?")
        .bind(unit_id)
        .fetch_optional(pool)
        .await?;
    Ok(id.flatten())
}

pub async fn get_amenity_portal_id(pool: &Pool, amenity_id: i64) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, Option<String>>("SELECT portal_id FROM amenities WHERE id = ?")
        .bind(amenity_id)
        .fetch_optional(pool)
        .await?;
    Ok(id.flatten())
}

pub async fn get_building_portal_id(pool: &Pool, building_id: i64) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, Option<String>>("SELECT portal_id FROM buildings WHERE id = ?")
        .bind(building_id)
        .fetch_optional(pool)
        .await?;
    Ok(id.flatten())
}

// ---- reservations ----------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_reservation(
    pool: &Pool,
    input: &NewReservation,
    portal_id: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO reservations (user_id, amenity_id, date, start_time, end_time, notes, portal_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(input.user_id)
    .bind(input.amenity_id)
    .bind(&input.date)
    .bind(&input.start)
    .bind(&input.end)
    .bind(input.notes.as_deref())
    .bind(portal_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_reservation(pool: &Pool, id: i64) -> Result<Reservation> {
    let row = sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn find_reservation_by_portal_id(
    pool: &Pool,
    portal_id: &str,
) -> Result<Option<Reservation>> {
    let row = sqlx::query_as::<_, Reservation>("SELECT * FROM reservations WHERE portal_id = ?")
        .bind(portal_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Lookup by the logical reservation key; used to keep replays idempotent.
pub async fn find_reservation_by_slot(
    pool: &Pool,
    input: &NewReservation,
) -> Result<Option<Reservation>> {
    let row = sqlx::query_as::<_, Reservation>(
        "SELECT * FROM reservations \
         WHERE user_id = ? AND amenity_id = ? AND date = ? AND start_time = ? AND end_time = ?",
    )
    .bind(input.user_id)
    .bind(input.amenity_id)
    .bind(&input.date)
    .bind(&input.start)
    .bind(&input.end)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn update_reservation_status(
    pool: &Pool,
    id: i64,
    status: ReservationStatus,
) -> Result<()> {
    sqlx::query("UPDATE reservations SET status = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_reservation_portal_id(pool: &Pool, id: i64, portal_id: &str) -> Result<()> {
    sqlx::query("UPDATE reservations SET portal_id = ? WHERE id = ?")
        .bind(portal_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_reservation_portal_id(pool: &Pool, id: i64) -> Result<Option<String>> {
    let pid =
        sqlx::query_scalar::<_, Option<String>>("SELECT portal_id FROM reservations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(pid.flatten())
}

// ---- incidents -------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_incident(
    pool: &Pool,
    input: &NewIncident,
    portal_id: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO incidents (user_id, building_id, kind, title, description, location, priority, portal_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(input.user_id)
    .bind(input.building_id)
    .bind(&input.kind)
    .bind(&input.title)
    .bind(&input.description)
    .bind(input.location.as_deref())
    .bind(input.priority.as_deref())
    .bind(portal_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn get_incident(pool: &Pool, id: i64) -> Result<Incident> {
    let row = sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

pub async fn find_incident_by_portal_id(pool: &Pool, portal_id: &str) -> Result<Option<Incident>> {
    let row = sqlx::query_as::<_, Incident>("SELECT * FROM incidents WHERE portal_id = ?")
        .bind(portal_id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

#[instrument(skip_all)]
pub async fn update_incident(pool: &Pool, id: i64, update: &IncidentUpdate) -> Result<()> {
    sqlx::query(
        "UPDATE incidents SET \
           status = COALESCE(?, status), \
           description = COALESCE(?, description), \
           priority = COALESCE(?, priority) \
         WHERE id = ?",
    )
    .bind(update.status.map(|s| s.as_str()))
    .bind(update.description.as_deref())
    .bind(update.priority.as_deref())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn update_incident_portal_id(pool: &Pool, id: i64, portal_id: &str) -> Result<()> {
    sqlx::query("UPDATE incidents SET portal_id = ? WHERE id = ?")
        .bind(portal_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_incident_portal_id(pool: &Pool, id: i64) -> Result<Option<String>> {
    let pid = sqlx::query_scalar::<_, Option<String>>("SELECT portal_id FROM incidents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(pid.flatten())
}

// ---- sync queue ------------------------------------------------------------

/// Append a job. Enqueue is insert-only so that concurrent writers can never
/// clobber each other's jobs; removal happens exclusively in `replace_jobs`.
#[instrument(skip_all, fields(kind = job.task.kind()))]
pub async fn enqueue_job(pool: &Pool, job: &SyncJob) -> Result<i64> {
    let payload = serde_json::to_string(&job.task).context("serialize sync task")?;
    let rec = sqlx::query(
        "INSERT INTO sync_queue (id, kind, payload, created_at, attempts, last_error) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING seq",
    )
    .bind(job.id.to_string())
    .bind(job.task.kind())
    .bind(payload)
    .bind(job.created_at)
    .bind(job.attempts)
    .bind(job.last_error.as_deref())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("seq"))
}

/// Full queue snapshot in enqueue order.
#[instrument(skip_all)]
pub async fn all_jobs(pool: &Pool) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(
        "SELECT seq, id, payload, created_at, attempts, last_error FROM sync_queue ORDER BY seq",
    )
    .fetch_all(pool)
    .await?;
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let id: String = row.get("id");
        let payload: String = row.get("payload");
        let task: SyncTask =
            serde_json::from_str(&payload).context("deserialize sync task payload")?;
        jobs.push(SyncJob {
            seq: row.get("seq"),
            id: Uuid::parse_str(&id).context("parse sync job id")?,
            task,
            created_at: row.get::<DateTime<Utc>, _>("created_at"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
        });
    }
    Ok(jobs)
}

/// Replace the drained snapshot: delete exactly the visited rows, reinsert
/// the survivors under their original seq. Rows appended by other writers
/// while the drain ran are untouched, and survivors keep their relative
/// position ahead of them.
#[instrument(skip_all)]
pub async fn replace_jobs(pool: &Pool, visited: &[i64], remaining: &[SyncJob]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for seq in visited {
        sqlx::query("DELETE FROM sync_queue WHERE seq = ?")
            .bind(seq)
            .execute(&mut *tx)
            .await?;
    }
    for job in remaining {
        let payload = serde_json::to_string(&job.task).context("serialize sync task")?;
        sqlx::query(
            "INSERT INTO sync_queue (seq, id, kind, payload, created_at, attempts, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.seq)
        .bind(job.id.to_string())
        .bind(job.task.kind())
        .bind(&payload)
        .bind(job.created_at)
        .bind(job.attempts)
        .bind(job.last_error.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn count_jobs(pool: &Pool) -> Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn provision_task(email: &str) -> SyncTask {
        SyncTask::RemoteProvisionUser {
            remote: json!({ "correo": email }),
        }
    }

    #[tokio::test]
    async fn queue_keeps_enqueue_order() {
        let pool = setup_pool().await;
        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            enqueue_job(&pool, &SyncJob::new(provision_task(email))).await.unwrap();
        }
        let jobs = all_jobs(&pool).await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs[0].seq < jobs[1].seq && jobs[1].seq < jobs[2].seq);
    }

    #[tokio::test]
    async fn replace_preserves_survivor_position() {
        let pool = setup_pool().await;
        for email in ["a@x.com", "b@x.com", "c@x.com"] {
            enqueue_job(&pool, &SyncJob::new(provision_task(email))).await.unwrap();
        }
        let jobs = all_jobs(&pool).await.unwrap();
        let visited: Vec<i64> = jobs.iter().map(|j| j.seq).collect();

        // Middle job survives with its failure recorded.
        let mut survivor = jobs[1].clone();
        survivor.attempts += 1;
        survivor.last_error = Some("boom".into());
        replace_jobs(&pool, &visited, &[survivor.clone()]).await.unwrap();

        // A job appended after the drain must land behind the survivor.
        enqueue_job(&pool, &SyncJob::new(provision_task("d@x.com"))).await.unwrap();

        let after = all_jobs(&pool).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].id, survivor.id);
        assert_eq!(after[0].attempts, 1);
        assert_eq!(after[0].last_error.as_deref(), Some("boom"));
        assert!(after[0].seq < after[1].seq);
    }

    #[tokio::test]
    async fn reservation_slot_lookup() {
        let pool = setup_pool().await;
        let user_id = create_user(&pool, "r@x.com", Some("Res"), Some("resident"))
            .await
            .unwrap();
        let building_id = create_building(&pool, "Torre A", Some("b-1")).await.unwrap();
        let amenity_id = create_amenity(&pool, building_id, "Pool", Some("am-1"))
            .await
            .unwrap();

        let input = NewReservation {
            user_id,
            unit_id: 0,
            amenity_id,
            date: "2026-08-10".into(),
            start: "10:00".into(),
            end: "11:00".into(),
            notes: None,
        };
        assert!(find_reservation_by_slot(&pool, &input).await.unwrap().is_none());

        let id = create_reservation(&pool, &input, None).await.unwrap();
        let found = find_reservation_by_slot(&pool, &input).await.unwrap().unwrap();
        assert_eq!(found.id, id);
        assert!(found.portal_id.is_none());

        update_reservation_portal_id(&pool, id, "res-9").await.unwrap();
        let by_portal = find_reservation_by_portal_id(&pool, "res-9").await.unwrap();
        assert_eq!(by_portal.map(|r| r.id), Some(id));
    }

    #[tokio::test]
    async fn incident_update_is_partial() {
        let pool = setup_pool().await;
        let user_id = create_user(&pool, "i@x.com", None, None).await.unwrap();
        let building_id = create_building(&pool, "Torre B", Some("b-2")).await.unwrap();
        let input = NewIncident {
            user_id,
            building_id,
            kind: "plumbing".into(),
            title: "Leak".into(),
            description: "Water on floor 3".into(),
            location: Some("3F hallway".into()),
            priority: Some("high".into()),
        };
        let id = create_incident(&pool, &input, Some("inc-5")).await.unwrap();

        update_incident(
            &pool,
            id,
            &IncidentUpdate {
                status: Some(crate::status::IncidentStatus::InProgress),
                description: None,
                priority: None,
            },
        )
        .await
        .unwrap();

        let row = get_incident(&pool, id).await.unwrap();
        assert_eq!(row.status, "in_progress");
        assert_eq!(row.description, "Water on floor 3");
        assert_eq!(row.priority.as_deref(), Some("high"));
        assert_eq!(row.portal_id.as_deref(), Some("inc-5"));
    }

    #[tokio::test]
    async fn role_list_is_replaced_wholesale() {
        let pool = setup_pool().await;
        let user_id = create_user(&pool, "roles@x.com", None, Some("resident"))
            .await
            .unwrap();
        set_user_roles(&pool, user_id, &["resident", "guard"]).await.unwrap();
        set_user_roles(&pool, user_id, &["admin"]).await.unwrap();
        assert_eq!(user_roles(&pool, user_id).await.unwrap(), vec!["admin"]);
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_sqlite_url("postgres://db/x"),
            "postgres://db/x"
        );
        assert!(prepare_sqlite_url("sqlite:///tmp/portal-sync-test.db?mode=rwc")
            .ends_with("/tmp/portal-sync-test.db?mode=rwc"));
    }
}
