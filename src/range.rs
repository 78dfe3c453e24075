use crate::models::EntityId;

// How many ids a listing covers when the caller does not say
pub const DEFAULT_SPAN: u64 = 10;

// Half-open run of content ids, [from, to)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub from: u64,
    pub to: u64,
}

impl IdRange {
    /// Explicit bounds win when both are given. Otherwise the range ends just
    /// past the newest content id (but never before 11) and spans ten ids.
    pub fn resolve(from: Option<u64>, to: Option<u64>, max_id: u64) -> Self {
        match (from, to) {
            (Some(from), Some(to)) => Self { from, to },
            _ => {
                let to = max_id.saturating_add(1).max(DEFAULT_SPAN + 1);
                let from = to.saturating_sub(DEFAULT_SPAN).max(1);
                Self { from, to }
            }
        }
    }

    pub fn ids(&self) -> Vec<EntityId> {
        (self.from..self.to).map(EntityId).collect()
    }
}
