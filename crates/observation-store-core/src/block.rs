//! The reusable block accumulator.
//!
//! A [`Block`] is one pivoted output row under construction. It is a single
//! owned buffer that is reset and reopened for every grouping key, following
//! the lifecycle
//!
//! ```text
//! NEW --open--> ACCUMULATING --close--> CLOSED --reset--> NEW
//!                                          \
//!                                           `-- (end of stream) TERMINAL
//! ```
//!
//! A closed block is handed to a [`BlockSink`](crate::results::BlockSink) and
//! never reopened; the next key starts from `reset`. Blocks are fixed width:
//! every working field has a slot, pre-filled with a per-type sentinel (NaN
//! for quantities, NULL otherwise) until a row writes it.
use chrono::{DateTime, Utc};

use crate::{
    catalog::{Field, FieldType},
    cursor::CellValue,
};

/// Lifecycle state of a [`Block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Empty, ready to open.
    New,
    /// Open; rows of the current key are being written.
    Accumulating,
    /// Flushed; must be reset before reuse.
    Closed,
}

/// Value of the main (grouping) field.
///
/// Equality groups rows, so a NaN depth equals another NaN depth.
#[derive(Debug, Clone, Copy)]
pub enum MainValue {
    /// Time series and trajectories.
    Time(DateTime<Utc>),
    /// Profiles (depth / altitude).
    Number(f64),
}

impl MainValue {
    /// Position on the main field's numeric axis (epoch milliseconds for instants).
    pub fn as_f64(&self) -> f64 {
        match self {
            MainValue::Time(t) => t.timestamp_millis() as f64,
            MainValue::Number(v) => *v,
        }
    }

    /// Cell written in the main column.
    pub fn to_cell(&self) -> CellValue {
        match self {
            MainValue::Time(t) => CellValue::Timestamp(*t),
            MainValue::Number(v) => CellValue::Double(*v),
        }
    }
}

impl PartialEq for MainValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MainValue::Time(a), MainValue::Time(b)) => a == b,
            (MainValue::Number(a), MainValue::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => false,
        }
    }
}

impl Eq for MainValue {}

/// Grouping key of a block: the main value, plus the cast time for profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupKey {
    /// Cast timestamp (profiles only).
    pub time: Option<DateTime<Utc>>,
    /// Main field value.
    pub main: MainValue,
}

impl GroupKey {
    /// Instant the block describes: the cast time for profiles, the main value otherwise.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match (self.time, self.main) {
            (Some(t), _) => Some(t),
            (None, MainValue::Time(t)) => Some(t),
            (None, MainValue::Number(_)) => None,
        }
    }
}

/// Missing-value marker for a field type.
pub fn sentinel(data_type: FieldType) -> CellValue {
    match data_type {
        FieldType::Quantity => CellValue::Double(f64::NAN),
        FieldType::Time | FieldType::Text | FieldType::Boolean => CellValue::Null,
    }
}

/// One pivoted row under construction.
#[derive(Debug, Clone)]
pub struct Block {
    state: BlockState,
    key: Option<GroupKey>,
    measurement_id: i64,
    id: Option<String>,
    time_column: Option<DateTime<Utc>>,
    sentinels: Vec<CellValue>,
    values: Vec<CellValue>,
    observed: Vec<bool>,
}

impl Block {
    /// Create an empty block with one slot per field.
    pub fn for_fields(fields: &[Field]) -> Self {
        let sentinels: Vec<CellValue> = fields.iter().map(|f| sentinel(f.data_type)).collect();
        Block {
            state: BlockState::New,
            key: None,
            measurement_id: 0,
            id: None,
            time_column: None,
            values: sentinels.clone(),
            observed: vec![false; sentinels.len()],
            sentinels,
        }
    }

    /// Open the block for `key`, writing identity and time metadata once.
    pub(crate) fn open(
        &mut self,
        key: GroupKey,
        measurement_id: i64,
        id: Option<String>,
        time_column: Option<DateTime<Utc>>,
    ) {
        debug_assert_eq!(self.state, BlockState::New, "open requires a fresh block");
        self.key = Some(key);
        self.measurement_id = measurement_id;
        self.id = id;
        self.time_column = time_column;
        self.state = BlockState::Accumulating;
    }

    /// Store a field value; the last write for a slot wins.
    pub(crate) fn set(&mut self, position: usize, value: CellValue) {
        debug_assert_eq!(self.state, BlockState::Accumulating);
        self.values[position] = value;
        self.observed[position] = true;
    }

    /// Take over the identity of `other` and every slot `other` observed.
    ///
    /// Used by decimation buckets, which keep the last observed raw values.
    pub(crate) fn absorb(&mut self, other: &Block) {
        debug_assert_eq!(self.state, BlockState::Accumulating);
        self.key = other.key;
        self.measurement_id = other.measurement_id;
        self.id.clone_from(&other.id);
        self.time_column = other.time_column;
        for (pos, seen) in other.observed.iter().enumerate() {
            if *seen {
                self.values[pos].clone_from(&other.values[pos]);
                self.observed[pos] = true;
            }
        }
    }

    /// Close the block; it is now ready to flush.
    pub(crate) fn close(&mut self) {
        debug_assert_eq!(self.state, BlockState::Accumulating);
        self.state = BlockState::Closed;
    }

    /// Clear the buffer for the next key.
    pub(crate) fn reset(&mut self) {
        self.state = BlockState::New;
        self.key = None;
        self.measurement_id = 0;
        self.id = None;
        self.time_column = None;
        self.values.clone_from(&self.sentinels);
        self.observed.iter_mut().for_each(|o| *o = false);
    }

    /// Lifecycle state.
    pub fn state(&self) -> BlockState {
        self.state
    }

    /// Grouping key (set once opened).
    pub fn key(&self) -> Option<&GroupKey> {
        self.key.as_ref()
    }

    /// Measurement identifier of the block.
    pub fn measurement_id(&self) -> i64 {
        self.measurement_id
    }

    /// Identity column value, when ids are requested.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Time column value, when profile times are requested.
    pub fn time_column(&self) -> Option<DateTime<Utc>> {
        self.time_column
    }

    /// Main column value.
    pub fn main(&self) -> Option<CellValue> {
        self.key.map(|k| k.main.to_cell())
    }

    /// Instant described by the block.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        self.key.and_then(|k| k.instant())
    }

    /// Field values in working-set order, sentinel-filled.
    pub fn values(&self) -> &[CellValue] {
        &self.values
    }

    /// Whether the slot at `position` was written since the last reset.
    pub fn is_observed(&self, position: usize) -> bool {
        self.observed.get(position).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;

    fn fields() -> Vec<Field> {
        vec![
            Field::new("A", FieldType::Quantity, 1),
            Field::new("B", FieldType::Text, 2),
        ]
    }

    fn key(ms: i64) -> GroupKey {
        GroupKey {
            time: None,
            main: MainValue::Time(utc_millis(ms)),
        }
    }

    #[test]
    fn fresh_block_is_sentinel_filled() {
        let block = Block::for_fields(&fields());
        assert_eq!(block.state(), BlockState::New);
        assert!(matches!(block.values()[0], CellValue::Double(v) if v.is_nan()));
        assert_eq!(block.values()[1], CellValue::Null);
        assert!(block.main().is_none());
    }

    #[test]
    fn lifecycle_open_set_close_reset() {
        let mut block = Block::for_fields(&fields());
        block.open(key(1_000), 42, Some("obs-42".into()), None);
        block.set(0, CellValue::Double(1.0));
        block.set(0, CellValue::Double(2.0));
        block.close();

        assert_eq!(block.state(), BlockState::Closed);
        assert_eq!(block.values()[0], CellValue::Double(2.0));
        assert!(block.is_observed(0));
        assert!(!block.is_observed(1));
        assert_eq!(block.id(), Some("obs-42"));
        assert_eq!(block.instant(), Some(utc_millis(1_000)));

        block.reset();
        assert_eq!(block.state(), BlockState::New);
        assert!(block.key().is_none());
        assert!(!block.is_observed(0));
        assert!(matches!(block.values()[0], CellValue::Double(v) if v.is_nan()));
    }

    #[test]
    fn absorb_keeps_last_observed_values() {
        let mut a = Block::for_fields(&fields());
        a.open(key(1_000), 1, None, None);
        a.set(0, CellValue::Double(1.0));
        a.set(1, CellValue::Text("x".into()));
        a.close();

        let mut b = Block::for_fields(&fields());
        b.open(key(2_000), 2, None, None);
        b.set(0, CellValue::Double(5.0));
        b.close();

        let mut bucket = Block::for_fields(&fields());
        bucket.open(key(1_000), 1, None, None);
        bucket.absorb(&a);
        bucket.absorb(&b);
        bucket.close();

        assert_eq!(bucket.values()[0], CellValue::Double(5.0));
        assert_eq!(bucket.values()[1], CellValue::Text("x".into()));
        assert_eq!(bucket.measurement_id(), 2);
        assert_eq!(bucket.instant(), Some(utc_millis(2_000)));
    }

    #[test]
    fn profile_key_instant_is_cast_time() {
        let k = GroupKey {
            time: Some(utc_millis(5_000)),
            main: MainValue::Number(12.5),
        };
        assert_eq!(k.instant(), Some(utc_millis(5_000)));
        assert_eq!(k.main.as_f64(), 12.5);
    }
}
