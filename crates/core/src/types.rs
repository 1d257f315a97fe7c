use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role carried by every registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Applicant,
    Client,
}

impl Role {
    /// Returns the canonical database/claim representation of the role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applicant => "Applicant",
            Self::Client => "Client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Applicant" => Ok(Self::Applicant),
            "Client" => Ok(Self::Client),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Authenticated caller, produced once per request by the token collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub role: Role,
}

/// Lifecycle status of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
    Withdrawn,
}

impl ApplicationStatus {
    /// Returns the canonical database representation for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Withdrawn => "Withdrawn",
        }
    }

    /// Every state except `Pending` is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn can_transition_to(self, next: ApplicationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Withdrawn)
        )
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Pending" => Ok(Self::Pending),
            "Approved" => Ok(Self::Approved),
            "Rejected" => Ok(Self::Rejected),
            "Withdrawn" => Ok(Self::Withdrawn),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Raised when a persisted enum column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// Public projection of a user embedded in other aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Registered user without credential material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// An applicant's request to be hired for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub job_id: Uuid,
    pub applicant_id: Uuid,
    pub status: ApplicationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applicant: Option<UserSummary>,
    pub created_at: DateTime<Utc>,
}

/// Job posting aggregate. `applications` is only populated by single-job reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub salary: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub closed: bool,
    pub client_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<CategorySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<UserSummary>,
    #[serde(default)]
    pub applications: Vec<Application>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Number of applications currently holding `Approved`.
    pub fn approved_count(&self) -> usize {
        self.applications
            .iter()
            .filter(|application| application.status == ApplicationStatus::Approved)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_database_representation() {
        for status in [
            ApplicationStatus::Pending,
            ApplicationStatus::Approved,
            ApplicationStatus::Rejected,
            ApplicationStatus::Withdrawn,
        ] {
            assert_eq!(status.as_str().parse::<ApplicationStatus>(), Ok(status));
        }
        assert!("approved".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn only_pending_has_outgoing_transitions() {
        use ApplicationStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Withdrawn));
        for terminal in [Approved, Rejected, Withdrawn] {
            assert!(terminal.is_terminal());
            for next in [Pending, Approved, Rejected, Withdrawn] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn role_parses_claim_values() {
        assert_eq!("Client".parse::<Role>(), Ok(Role::Client));
        assert_eq!(
            "admin".parse::<Role>(),
            Err(UnknownVariant("admin".to_string()))
        );
    }

    #[test]
    fn job_serializes_without_empty_optionals() {
        let job = Job {
            id: Uuid::nil(),
            title: "Rust engineer".to_string(),
            description: None,
            company: None,
            logo: None,
            status: None,
            salary: 0.0,
            location: None,
            closed: false,
            client_id: Uuid::nil(),
            category: None,
            client: None,
            applications: Vec::new(),
            created_at: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch"),
        };
        let value = serde_json::to_value(&job).expect("serialize");
        assert!(value.get("description").is_none());
        assert_eq!(value["closed"], false);
        let decoded: Job = serde_json::from_value(value).expect("deserialize");
        assert_eq!(decoded, job);
    }
}
