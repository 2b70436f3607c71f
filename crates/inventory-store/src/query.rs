use chrono::{DateTime, Utc};
use common::Sku;

use crate::model::{MovementType, StockMovement};

/// Builder for filtering the movement ledger.
#[derive(Debug, Clone, Default)]
pub struct MovementQuery {
    /// Filter by SKU.
    pub sku: Option<Sku>,

    /// Filter by movement types (any of these types).
    pub movement_types: Option<Vec<MovementType>>,

    /// Filter by the order, reservation or receipt the movement references.
    pub reference_id: Option<String>,

    /// Filter by movements recorded at or after this timestamp.
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by movements recorded at or before this timestamp.
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of movements to return.
    pub limit: Option<usize>,

    /// Number of movements to skip.
    pub offset: Option<usize>,
}

impl MovementQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for the full history of one SKU.
    pub fn for_sku(sku: Sku) -> Self {
        Self {
            sku: Some(sku),
            ..Default::default()
        }
    }

    /// Creates a query for every movement that references `reference_id`.
    pub fn for_reference(reference_id: impl Into<String>) -> Self {
        Self {
            reference_id: Some(reference_id.into()),
            ..Default::default()
        }
    }

    /// Filters by movement type.
    pub fn movement_type(mut self, movement_type: MovementType) -> Self {
        self.movement_types = Some(vec![movement_type]);
        self
    }

    /// Filters by multiple movement types (any of these).
    pub fn movement_types(mut self, movement_types: Vec<MovementType>) -> Self {
        self.movement_types = Some(movement_types);
        self
    }

    /// Filters to movements after this timestamp (inclusive).
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to movements before this timestamp (inclusive).
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of movements returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many movements before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if `movement` passes every filter except limit/offset.
    pub fn matches(&self, movement: &StockMovement) -> bool {
        if let Some(ref sku) = self.sku
            && &movement.sku != sku
        {
            return false;
        }
        if let Some(ref types) = self.movement_types
            && !types.contains(&movement.movement_type)
        {
            return false;
        }
        if let Some(ref reference) = self.reference_id
            && &movement.reference_id != reference
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && movement.recorded_at < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && movement.recorded_at > to
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_for_sku() {
        let query = MovementQuery::for_sku(Sku::new("SKU-1"));

        assert_eq!(query.sku, Some(Sku::new("SKU-1")));
        assert!(query.movement_types.is_none());
    }

    #[test]
    fn query_builder_chain() {
        let query = MovementQuery::for_reference("RES-1")
            .movement_type(MovementType::Release)
            .limit(100)
            .offset(0);

        assert_eq!(query.reference_id.as_deref(), Some("RES-1"));
        assert_eq!(query.movement_types, Some(vec![MovementType::Release]));
        assert_eq!(query.limit, Some(100));
        assert_eq!(query.offset, Some(0));
    }

    #[test]
    fn matches_filters_by_type() {
        let movement = StockMovement {
            id: 1,
            sku: Sku::new("SKU-1"),
            movement_type: MovementType::Reserve,
            quantity: 2,
            available_delta: -2,
            reserved_delta: 2,
            available_after: 3,
            reserved_after: 2,
            reference_id: "RES-1".into(),
            reason: None,
            recorded_at: Utc::now(),
        };
        assert!(MovementQuery::for_sku(Sku::new("SKU-1")).matches(&movement));
        assert!(!MovementQuery::new()
            .movement_type(MovementType::Release)
            .matches(&movement));
    }
}
