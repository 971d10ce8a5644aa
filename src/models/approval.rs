use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::operation::Operation;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub token_id: String,
    pub operation: Operation,
    pub summary: String,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// The two outcomes a human may choose.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[serde(alias = "approve")]
    Approved,
    #[serde(alias = "rejected", alias = "reject", alias = "deny")]
    Denied,
}

impl From<Decision> for ApprovalStatus {
    fn from(d: Decision) -> Self {
        match d {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Denied => ApprovalStatus::Denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_accepts_rejected_alias() {
        let d: Decision = serde_json::from_str("\"rejected\"").unwrap();
        assert_eq!(d, Decision::Denied);
        let d: Decision = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(ApprovalStatus::from(d), ApprovalStatus::Approved);
        assert!(serde_json::from_str::<Decision>("\"expired\"").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Approved.is_terminal());
        assert!(ApprovalStatus::Denied.is_terminal());
        assert!(ApprovalStatus::Expired.is_terminal());
    }
}
