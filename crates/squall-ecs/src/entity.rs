//! Entity and match identifiers, and their numeric cell encoding.
//!
//! An [`EntityId`] is a 64-bit handle assigned monotonically by the pool.
//! Ids are never reused for the lifetime of a container -- only the row slot
//! behind a destroyed entity is recycled. This makes a stale id immediately
//! detectable (the row map no longer contains it) without generation bits.
//!
//! Ids also travel through component cells (`MATCH_ID`, `OWNER_ID`, ...), so
//! they must round-trip exactly through an `f64`. That bounds them to the
//! 53-bit mantissa; [`encode_cell_id`] enforces the bound.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::StoreError;

/// Largest integer that an `f64` represents exactly (2^53).
pub const MAX_CELL_ID: u64 = 1 << 53;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A stable, container-scoped entity identifier.
///
/// Assigned monotonically on spawn; never reused after destruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Construct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Encode this id as a component cell value.
    ///
    /// Fails with [`StoreError::Overflow`] if the id exceeds the exact-integer
    /// range of an `f64`.
    pub fn to_cell(self) -> Result<f64, StoreError> {
        encode_cell_id(self.0)
    }

    /// Decode an id from a component cell value.
    ///
    /// Fails with [`StoreError::InvalidValue`] if the cell does not hold a
    /// whole non-negative number in range.
    pub fn from_cell(value: f64) -> Result<Self, StoreError> {
        decode_cell_id(value).map(Self)
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MatchId
// ---------------------------------------------------------------------------

/// Identifier of a simulation match within a container.
///
/// Every entity that belongs to a match carries the match id in its
/// `MATCH_ID` cell; deleting a match cascades to those entities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(u32);

impl MatchId {
    /// Construct from a raw `u32`.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw `u32` representation.
    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Encode this id as a component cell value. A `u32` always fits.
    #[inline]
    pub fn to_cell(self) -> f64 {
        self.0 as f64
    }

    /// Decode a match id from a component cell value.
    pub fn from_cell(value: f64) -> Result<Self, StoreError> {
        let raw = decode_cell_id(value)?;
        u32::try_from(raw)
            .map(Self)
            .map_err(|_| StoreError::InvalidValue)
    }
}

impl fmt::Debug for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MatchId({})", self.0)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Cell encoding helpers
// ---------------------------------------------------------------------------

/// Encode an integer id as an exact whole `f64`.
///
/// Ids above 2^53 would be silently rounded by the float representation, so
/// they are rejected with [`StoreError::Overflow`] instead.
pub fn encode_cell_id(raw: u64) -> Result<f64, StoreError> {
    if raw > MAX_CELL_ID {
        return Err(StoreError::Overflow { value: raw });
    }
    Ok(raw as f64)
}

/// Decode an integer id from a cell value.
///
/// The cell must hold a finite, non-negative whole number within the exact
/// `f64` integer range.
pub fn decode_cell_id(value: f64) -> Result<u64, StoreError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > MAX_CELL_ID as f64 {
        return Err(StoreError::InvalidValue);
    }
    Ok(value as u64)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_roundtrips_through_cell() {
        let e = EntityId::from_raw(123_456);
        let cell = e.to_cell().unwrap();
        assert_eq!(EntityId::from_cell(cell).unwrap(), e);
    }

    #[test]
    fn oversized_id_is_rejected_not_truncated() {
        let e = EntityId::from_raw(MAX_CELL_ID + 1);
        assert!(matches!(e.to_cell(), Err(StoreError::Overflow { .. })));
    }

    #[test]
    fn boundary_id_is_exact() {
        assert_eq!(encode_cell_id(MAX_CELL_ID).unwrap(), MAX_CELL_ID as f64);
        assert_eq!(decode_cell_id(MAX_CELL_ID as f64).unwrap(), MAX_CELL_ID);
    }

    #[test]
    fn fractional_and_negative_cells_do_not_decode() {
        assert!(decode_cell_id(1.5).is_err());
        assert!(decode_cell_id(-1.0).is_err());
        assert!(decode_cell_id(f64::NAN).is_err());
        assert!(decode_cell_id(f64::INFINITY).is_err());
    }

    #[test]
    fn match_id_roundtrips_through_cell() {
        let m = MatchId::from_raw(7);
        assert_eq!(MatchId::from_cell(m.to_cell()).unwrap(), m);
    }

    #[test]
    fn match_id_rejects_out_of_range_cell() {
        assert!(MatchId::from_cell(u32::MAX as f64 + 1.0).is_err());
    }
}
