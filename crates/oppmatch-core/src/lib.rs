//! Core domain model for the Opportunity Match Server.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oppmatch-core";

/// Generated identifier for an ingested opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpportunityId(pub Uuid);

impl OpportunityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for OpportunityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Externally supplied user identifier.
///
/// Callers send ids as JSON strings or integers; both normalize to the same
/// string form, and every comparison downstream (user filters, keyword user
/// maps) is a string comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl de::Visitor<'_> for IdVisitor {
            type Value = UserId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or integer user id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<UserId, E> {
                Ok(UserId(v.to_string()))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<UserId, E> {
                Ok(UserId(v.to_string()))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<UserId, E> {
                Ok(UserId(v.to_string()))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// Organization identity key. Organizations are keyed by their free-text
/// name; there is no separate external identifier in the ingestion format.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgName(pub String);

impl fmt::Display for OrgName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Organization record, created lazily on first referencing opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: OrgName,
    pub opportunity_ids: Vec<OpportunityId>,
}

/// Stored opportunity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Opportunity {
    pub id: OpportunityId,
    pub role: String,
    pub email: Option<String>,
    pub organization: OrgName,
    pub created_at: DateTime<Utc>,
}

/// Stored user. Re-ingesting the same id overwrites the whole record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub interested_in: Vec<String>,
    pub ingested_at: DateTime<Utc>,
}

impl User {
    /// First and last name space-joined; blank parts are tolerated.
    pub fn display_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        )
    }
}

/// Best qualifying approximate match between one user and one keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRecord {
    pub user_name: String,
    pub interest: String,
    pub score: u8,
}

/// An opportunity linked under a keyword, with the owning organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeywordOpportunity {
    pub opportunity_id: OpportunityId,
    pub org_name: OrgName,
}

/// Canonical role string with everything registered under it. A keyword
/// exists iff at least one opportunity was ever added with that role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Keyword {
    pub name: String,
    pub opportunities: Vec<KeywordOpportunity>,
    pub users: BTreeMap<UserId, MatchRecord>,
}

impl Keyword {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            opportunities: Vec::new(),
            users: BTreeMap::new(),
        }
    }
}

/// One row of the derived (keyword x opportunity x user) match relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchRow {
    pub keyword: String,
    pub opp_id: OpportunityId,
    pub user_id: UserId,
    pub org_name: OrgName,
    pub user_name: String,
    pub interest: String,
    pub match_level: u8,
}

/// Batch ingestion input for opportunities. One record may fan out into
/// several stored opportunities, one per role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpportunityInput {
    pub organization: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Batch ingestion input for users. The id is required but modeled as an
/// Option so a missing id rejects only the offending record, not the batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub id: Option<UserId>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub interested_in: Vec<String>,
}

/// Per-record ingestion failure. Local data-quality issues only; nothing in
/// the engine aborts a whole batch.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("user record is missing the required id field")]
    MissingUserId,
    #[error("role name is blank")]
    BlankRole,
    #[error("organization name is blank")]
    BlankOrganization,
}

/// A rejected batch element, reported back to the caller by input index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub reason: String,
}

impl RejectedRecord {
    pub fn new(index: usize, error: &IngestError) -> Self {
        Self {
            index,
            reason: error.to_string(),
        }
    }
}

/// Result of a batch ingestion call: how many records landed, and which
/// were rejected and why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub created: usize,
    pub rejected: Vec<RejectedRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_accepts_strings_and_integers() {
        let from_str: UserId = serde_json::from_str("\"u-17\"").unwrap();
        let from_int: UserId = serde_json::from_str("17").unwrap();
        assert_eq!(from_str, UserId("u-17".into()));
        assert_eq!(from_int, UserId("17".into()));
    }

    #[test]
    fn display_name_tolerates_blank_parts() {
        let user = User {
            id: UserId("1".into()),
            first_name: Some("Jane".into()),
            last_name: None,
            email: None,
            interested_in: vec![],
            ingested_at: Utc::now(),
        };
        assert_eq!(user.display_name(), "Jane ");
    }

    #[test]
    fn user_input_defaults_optional_fields() {
        let input: UserInput = serde_json::from_str(r#"{"id": 4}"#).unwrap();
        assert_eq!(input.id, Some(UserId("4".into())));
        assert!(input.interested_in.is_empty());
        assert!(input.first_name.is_none());
    }
}
