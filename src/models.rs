use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// Content id, issued by the system-of-record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

// User id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// The liked item. Title and text are mirrored into the cache as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: EntityId,
    pub title: String,
    pub text: String,
}

// Admission outcome of a like at creation time.
// Encoded as 1/2 in the system-of-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionState {
    Accepted,
    RateLimited,
}

impl AdmissionState {
    pub fn code(self) -> i32 {
        match self {
            AdmissionState::Accepted => 1,
            AdmissionState::RateLimited => 2,
        }
    }
}

// One actor's like of one content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub content_id: EntityId,
    pub actor_id: ActorId,
    pub value: i16,
    pub state: AdmissionState,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

// Inclusive bounds for a like value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationRange {
    pub min: i16,
    pub max: i16,
}

impl Default for ObservationRange {
    fn default() -> Self {
        Self { min: 0, max: 5 }
    }
}

impl ObservationRange {
    pub fn contains(&self, value: i16) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

// One row of the rebuild query: a content plus its accepted likes folded up.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityAggregate {
    pub content: Content,
    pub count: u64,
    pub sum: i64,
}

impl EntityAggregate {
    pub fn mean(&self) -> f64 {
        mean_of(self.sum, self.count)
    }
}

// Mean over zero likes is 0, never NaN.
pub fn mean_of(sum: i64, count: u64) -> f64 {
    if count == 0 {
        return 0.0;
    }
    sum as f64 / count as f64
}

// Result of asking the rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        self == Admission::Accepted
    }
}
