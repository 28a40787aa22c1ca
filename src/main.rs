use anyhow::Result;
use clap::{Parser, Subcommand};
use portal_sync::model::{NewIncident, NewPortalUser, NewReservation, SyncOutcome};
use portal_sync::portal::{PortalClient, PortalService};
use portal_sync::{auth, config, db, drain, sync};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drain the sync queue on a fixed interval until interrupted
    Run,
    /// Run a single drain pass and exit
    Drain,
    /// Establish a portal session for the configured identity
    Login {
        /// Override the identity email from the config
        #[arg(long)]
        email: Option<String>,
    },
    /// Drop the stored portal session
    Logout,
    /// Create a reservation through the dual-write path
    Reserve {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        unit_id: i64,
        #[arg(long)]
        amenity_id: i64,
        #[arg(long)]
        date: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Report an incident through the dual-write path
    Incident {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        building_id: i64,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        priority: Option<String>,
    },
    /// Provision a portal account
    ProvisionUser {
        #[arg(long)]
        email: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        role: String,
        #[arg(long)]
        unit: Option<String>,
    },
    /// List reservations straight from the portal
    Reservations {
        /// Filter by portal status literal (e.g. PENDIENTE)
        #[arg(long)]
        status: Option<String>,
    },
    /// List incidents straight from the portal
    Incidents {
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/portal-sync.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let portal = PortalClient::new(
        cfg.portal_base_url()?,
        Duration::from_secs(cfg.app.request_timeout_secs),
    );
    let identity = cfg.portal.identity_email.clone();

    match args.command {
        Command::Run => {
            let interval = Duration::from_millis(cfg.app.drain_interval_ms);
            info!(interval_ms = cfg.app.drain_interval_ms, "starting drain loop");
            loop {
                match drain::drain(&pool, &portal, Some(&identity)).await {
                    Ok(report) if report.processed > 0 || report.remaining > 0 => {
                        info!(
                            processed = report.processed,
                            remaining = report.remaining,
                            "drain pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(err) => error!(?err, "drain pass failed"),
                }
                tokio::time::sleep(interval).await;
            }
        }
        Command::Drain => {
            let report = drain::drain(&pool, &portal, Some(&identity)).await?;
            info!(
                processed = report.processed,
                remaining = report.remaining,
                "drain finished"
            );
        }
        Command::Login { email } => {
            let email = email.as_deref().unwrap_or(&identity);
            let cred = auth::login(&pool, &portal, email).await?;
            info!(token_type = %cred.token_type, "portal session established");
        }
        Command::Logout => {
            auth::logout(&pool).await?;
            info!("portal session cleared");
        }
        Command::Reserve {
            user_id,
            unit_id,
            amenity_id,
            date,
            start,
            end,
            notes,
        } => {
            let outcome = sync::create_reservation(
                &pool,
                &portal,
                Some(&identity),
                NewReservation { user_id, unit_id, amenity_id, date, start, end, notes },
            )
            .await?;
            report_outcome(outcome, |row| format!("reservation {} (portal {:?})", row.id, row.portal_id));
        }
        Command::Incident {
            user_id,
            building_id,
            kind,
            title,
            description,
            location,
            priority,
        } => {
            let outcome = sync::create_incident(
                &pool,
                &portal,
                Some(&identity),
                NewIncident { user_id, building_id, kind, title, description, location, priority },
            )
            .await?;
            report_outcome(outcome, |row| format!("incident {} (portal {:?})", row.id, row.portal_id));
        }
        Command::ProvisionUser { email, full_name, role, unit } => {
            let outcome = sync::provision_user(
                &pool,
                &portal,
                Some(&identity),
                NewPortalUser { email, full_name, role, unit_label: unit },
            )
            .await?;
            report_outcome(outcome, |_| "portal account".to_string());
        }
        Command::Reservations { status } => {
            let cred = auth::ensure_auth(&pool, &portal, Some(&identity)).await?;
            let filters = status_filter(status);
            let rows = portal.list_reservations(&cred, &filters).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::Incidents { status } => {
            let cred = auth::ensure_auth(&pool, &portal, Some(&identity)).await?;
            let filters = status_filter(status);
            let rows = portal.list_incidents(&cred, &filters).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

fn status_filter(status: Option<String>) -> Vec<(String, String)> {
    match status {
        Some(status) => vec![("estado".to_string(), status)],
        None => Vec::new(),
    }
}

fn report_outcome<T>(outcome: SyncOutcome<T>, describe: impl Fn(&T) -> String) {
    match outcome {
        SyncOutcome::Synced(row) => info!("synced: {}", describe(&row)),
        SyncOutcome::Queued { job_id } => {
            info!(%job_id, "portal unreachable; write queued for sync")
        }
    }
}
