//! Pure translation tables between the portal's freeform, language-specific
//! vocabulary and the local canonical enumerations. Lookups are case-sensitive
//! on the portal side (role claims are the exception) and return `None` on no
//! match; callers treat a miss as "no change", never as an error.

use serde::{Deserialize, Serialize};

/// Canonical incident lifecycle used by the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::InProgress => "in_progress",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }

    /// Literal the portal expects on outbound incident updates.
    pub fn portal_literal(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "ABIERTA",
            IncidentStatus::InProgress => "EN_PROCESO",
            IncidentStatus::Resolved => "RESUELTA",
            IncidentStatus::Closed => "CERRADA",
        }
    }
}

/// Canonical reservation lifecycle used by the local mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Rejected => "rejected",
            ReservationStatus::Cancelled => "cancelled",
        }
    }

    pub fn portal_literal(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDIENTE",
            ReservationStatus::Approved => "APROBADA",
            ReservationStatus::Rejected => "RECHAZADA",
            ReservationStatus::Cancelled => "CANCELADA",
        }
    }
}

pub fn incident_status_from_portal(raw: &str) -> Option<IncidentStatus> {
    match raw {
        "ABIERTA" => Some(IncidentStatus::Open),
        "EN_PROCESO" => Some(IncidentStatus::InProgress),
        "RESUELTA" => Some(IncidentStatus::Resolved),
        "CERRADA" | "RECHAZADA" => Some(IncidentStatus::Closed),
        _ => None,
    }
}

pub fn reservation_status_from_portal(raw: &str) -> Option<ReservationStatus> {
    match raw {
        "PENDIENTE" => Some(ReservationStatus::Pending),
        "APROBADA" | "CONFIRMADA" => Some(ReservationStatus::Approved),
        "RECHAZADA" => Some(ReservationStatus::Rejected),
        "CANCELADA" => Some(ReservationStatus::Cancelled),
        _ => None,
    }
}

/// Map a portal role claim to the local canonical role. The portal is
/// freeform here, so the table covers the synonyms seen in practice and
/// ignores case.
pub fn role_from_portal(raw: &str) -> Option<&'static str> {
    match raw.trim().to_uppercase().as_str() {
        "ADMIN" | "ADMINISTRADOR" | "ADMINISTRATOR" => Some("admin"),
        "RESIDENTE" | "RESIDENT" | "INQUILINO" => Some("resident"),
        "GUARDIA" | "VIGILANTE" | "GUARD" | "SEGURIDAD" => Some("guard"),
        "MANTENIMIENTO" | "MAINTENANCE" | "TECNICO" => Some("maintenance"),
        _ => None,
    }
}
