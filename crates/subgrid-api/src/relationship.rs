use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse reliability label attached to a discovered relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// How a relationship was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoverySource {
    Schema,
    Pattern,
    RecordAnalysis,
    Manual,
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoverySource::Schema => write!(f, "schema"),
            DiscoverySource::Pattern => write!(f, "pattern"),
            DiscoverySource::RecordAnalysis => write!(f, "record-analysis"),
            DiscoverySource::Manual => write!(f, "manual"),
        }
    }
}

/// The lookup column linking a child entity back to its parent.
///
/// Keyed by the ordered pair `(parent_entity, child_entity)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredRelationship {
    pub parent_entity: String,
    pub child_entity: String,
    pub lookup_column: String,
    pub relationship_label: String,
    pub discovered_at: DateTime<Utc>,
    pub confidence: Confidence,
    pub source: DiscoverySource,
}

impl DiscoveredRelationship {
    pub fn new(
        parent_entity: impl Into<String>,
        child_entity: impl Into<String>,
        lookup_column: impl Into<String>,
        relationship_label: impl Into<String>,
        confidence: Confidence,
        source: DiscoverySource,
    ) -> Self {
        Self {
            parent_entity: parent_entity.into(),
            child_entity: child_entity.into(),
            lookup_column: lookup_column.into(),
            relationship_label: relationship_label.into(),
            discovered_at: Utc::now(),
            confidence,
            source,
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.parent_entity.clone(), self.child_entity.clone())
    }
}
