//! Ordered fan-in of per-table cursors.
//!
//! A logical field set spread over several physical measure tables is read
//! through one cursor per table. Each of those cursors is ordered by grouping
//! key, so a k-way merge on the key columns yields a single stream in which all
//! rows of a key are contiguous, which is all the pivot requires.
//!
//! Children are consumed sequentially on the caller's thread. On equal keys the
//! lowest table number wins, so rows of one key come table by table.
use std::cmp::Ordering;

use snafu::prelude::*;

use super::{CellValue, CursorError, NoCurrentRowSnafu, ResultCursor, UnknownTableSnafu};

struct Child {
    table_number: usize,
    cursor: Box<dyn ResultCursor>,
    has_row: bool,
}

/// Merging cursor over one child cursor per measure table.
pub struct MergedCursor {
    children: Vec<Child>,
    leading_keys: Vec<String>,
    current: Option<usize>,
    started: bool,
}

impl MergedCursor {
    /// Merge `cursors`, each tagged with the table number it reads.
    pub fn new(cursors: Vec<(usize, Box<dyn ResultCursor>)>) -> Self {
        let mut children: Vec<Child> = cursors
            .into_iter()
            .map(|(table_number, cursor)| Child {
                table_number,
                cursor,
                has_row: false,
            })
            .collect();
        children.sort_by_key(|c| c.table_number);
        MergedCursor {
            children,
            leading_keys: Vec::new(),
            current: None,
            started: false,
        }
    }

    /// Compare on `column` before the field passed to `next_on_field`.
    ///
    /// Profiles merge on `(time, depth)`.
    pub fn with_leading_key(mut self, column: impl Into<String>) -> Self {
        self.leading_keys.push(column.into());
        self
    }

    /// Number of child cursors.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when no child cursor was supplied.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn key_of(&self, child: &Child, field: &str) -> Result<Vec<CellValue>, CursorError> {
        let mut key = Vec::with_capacity(self.leading_keys.len() + 1);
        for column in &self.leading_keys {
            key.push(child.cursor.value(column)?);
        }
        key.push(child.cursor.value(field)?);
        Ok(key)
    }

    fn pick_smallest(&self, field: &str) -> Result<Option<usize>, CursorError> {
        let mut best: Option<(usize, Vec<CellValue>)> = None;
        for (idx, child) in self.children.iter().enumerate() {
            if !child.has_row {
                continue;
            }
            let key = self.key_of(child, field)?;
            let better = match &best {
                None => true,
                Some((_, best_key)) => cmp_keys(&key, best_key) == Ordering::Less,
            };
            if better {
                best = Some((idx, key));
            }
        }
        Ok(best.map(|(idx, _)| idx))
    }

    fn current_child(&self) -> Result<&Child, CursorError> {
        self.current
            .and_then(|idx| self.children.get(idx))
            .context(NoCurrentRowSnafu)
    }
}

fn cmp_keys(a: &[CellValue], b: &[CellValue]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.cmp_key(y))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

impl ResultCursor for MergedCursor {
    fn next_on_field(&mut self, field: &str) -> Result<bool, CursorError> {
        if !self.started {
            self.started = true;
            for child in &mut self.children {
                child.has_row = child.cursor.next_on_field(field)?;
            }
        } else if let Some(idx) = self.current {
            let child = &mut self.children[idx];
            child.has_row = child.cursor.next_on_field(field)?;
        }

        self.current = self.pick_smallest(field)?;
        Ok(self.current.is_some())
    }

    fn has_column(&self, column: &str) -> bool {
        !self.children.is_empty() && self.children.iter().all(|c| c.cursor.has_column(column))
    }

    fn value(&self, column: &str) -> Result<CellValue, CursorError> {
        self.current_child()?.cursor.value(column)
    }

    fn value_in_table(&self, column: &str, table_number: usize) -> Result<CellValue, CursorError> {
        let child = self
            .children
            .iter()
            .find(|c| c.table_number == table_number)
            .context(UnknownTableSnafu { table_number })?;
        ensure!(child.has_row, NoCurrentRowSnafu);
        child.cursor.value(column)
    }

    fn current_table(&self) -> usize {
        self.current_child()
            .map(|c| c.table_number)
            .unwrap_or(crate::catalog::FIRST_TABLE)
    }
}
