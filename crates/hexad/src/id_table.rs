//! Row-major tables of [`ValueId`] and the shared memory budget every
//! intermediate result is charged against.

use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{Result, UserError, ValueId};

/// A process-wide byte budget for intermediate results. Exceeding it is a
/// recoverable error: the query aborts, the server keeps running.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryBudget {
    pub fn new(limit: usize) -> Arc<MemoryBudget> {
        Arc::new(MemoryBudget { limit, used: AtomicUsize::new(0) })
    }

    pub fn unlimited() -> Arc<MemoryBudget> {
        MemoryBudget::new(usize::MAX)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn try_reserve(&self, bytes: usize) -> Result<()> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let requested = used.checked_add(bytes).unwrap_or(usize::MAX);
            if requested > self.limit {
                return Err(UserError::MemoryBudgetExceeded {
                    requested: bytes,
                    used,
                    budget: self.limit,
                }
                .into());
            }
            match self.used.compare_exchange_weak(
                used,
                requested,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(current) => used = current,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }
}

/// A row-major table of ids with a fixed column count. Rows are immutable
/// once written; cloning is explicit via [`IdTable::try_clone`].
#[derive(Debug)]
pub struct IdTable {
    data: Vec<ValueId>,
    num_columns: usize,
    budget: Arc<MemoryBudget>,
    reserved: usize,
}

impl IdTable {
    pub fn new(num_columns: usize, budget: Arc<MemoryBudget>) -> IdTable {
        IdTable { data: Vec::new(), num_columns, budget, reserved: 0 }
    }

    pub fn with_row_capacity(
        num_columns: usize,
        rows: usize,
        budget: Arc<MemoryBudget>,
    ) -> Result<IdTable> {
        let mut table = IdTable::new(num_columns, budget);
        table.reserve_rows(rows)?;
        Ok(table)
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn num_rows(&self) -> usize {
        if self.num_columns == 0 {
            0
        } else {
            self.data.len() / self.num_columns
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn reserve_rows(&mut self, rows: usize) -> Result<()> {
        let needed = rows * self.num_columns.max(1);
        if self.data.capacity() - self.data.len() >= needed {
            return Ok(());
        }
        let new_capacity = (self.data.len() + needed).max(self.data.capacity() * 2);
        let additional_bytes = (new_capacity - self.data.capacity()) * size_of::<ValueId>();
        self.budget.try_reserve(additional_bytes)?;
        self.reserved += additional_bytes;
        self.data.reserve_exact(new_capacity - self.data.len());
        Ok(())
    }

    pub fn push_row(&mut self, row: &[ValueId]) -> Result<()> {
        debug_assert_eq!(row.len(), self.num_columns);
        self.reserve_rows(1)?;
        self.data.extend_from_slice(row);
        Ok(())
    }

    pub fn row(&self, index: usize) -> &[ValueId] {
        &self.data[index * self.num_columns..(index + 1) * self.num_columns]
    }

    pub fn at(&self, row: usize, column: usize) -> ValueId {
        debug_assert!(column < self.num_columns);
        self.data[row * self.num_columns + column]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[ValueId]> + '_ {
        self.data.chunks_exact(self.num_columns.max(1))
    }

    pub fn column(&self, column: usize) -> impl Iterator<Item = ValueId> + '_ {
        debug_assert!(column < self.num_columns);
        self.data.iter().copied().skip(column).step_by(self.num_columns)
    }

    /// Sorts rows lexicographically by the given columns. Stable, so ties
    /// keep their input order.
    pub fn sort_by_columns(&mut self, columns: &[usize]) {
        let num_columns = self.num_columns;
        let mut indices: Vec<usize> = (0..self.num_rows()).collect();
        indices.sort_by(|&a, &b| {
            let ra = &self.data[a * num_columns..(a + 1) * num_columns];
            let rb = &self.data[b * num_columns..(b + 1) * num_columns];
            columns.iter().map(|&c| ra[c].cmp(&rb[c])).find(|o| !o.is_eq()).unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut sorted = Vec::with_capacity(self.data.len());
        for index in indices {
            sorted.extend_from_slice(&self.data[index * num_columns..(index + 1) * num_columns]);
        }
        self.data = sorted;
    }

    pub fn try_clone(&self) -> Result<IdTable> {
        let mut clone =
            IdTable::with_row_capacity(self.num_columns, self.num_rows(), self.budget.clone())?;
        clone.data.extend_from_slice(&self.data);
        Ok(clone)
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }
}

impl Drop for IdTable {
    fn drop(&mut self) {
        self.budget.release(self.reserved);
    }
}

impl PartialEq for IdTable {
    fn eq(&self, other: &Self) -> bool {
        self.num_columns == other.num_columns && self.data == other.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueId;

    fn int_row(values: &[i64]) -> Vec<ValueId> {
        values.iter().map(|&i| ValueId::from_int(i)).collect()
    }

    #[test]
    fn push_and_read_rows() {
        let mut table = IdTable::new(2, MemoryBudget::unlimited());
        table.push_row(&int_row(&[1, 2])).unwrap();
        table.push_row(&int_row(&[3, 4])).unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.row(1), int_row(&[3, 4]).as_slice());
        assert_eq!(table.column(1).collect::<Vec<_>>(), int_row(&[2, 4]));
    }

    #[test]
    fn budget_is_charged_and_released() {
        let budget = MemoryBudget::new(1 << 20);
        {
            let mut table = IdTable::new(3, budget.clone());
            for i in 0..100 {
                table.push_row(&int_row(&[i, i + 1, i + 2])).unwrap();
            }
            assert!(budget.used() >= 100 * 3 * size_of::<ValueId>());
        }
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn exceeding_the_budget_is_a_recoverable_error() {
        let budget = MemoryBudget::new(64);
        let mut table = IdTable::new(2, budget.clone());
        let mut failed = false;
        for i in 0..100 {
            if table.push_row(&int_row(&[i, i])).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        drop(table);
        // The budget is whole again afterwards.
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn sort_by_columns() {
        let mut table = IdTable::new(2, MemoryBudget::unlimited());
        table.push_row(&int_row(&[3, 0])).unwrap();
        table.push_row(&int_row(&[1, 2])).unwrap();
        table.push_row(&int_row(&[3, -1])).unwrap();
        table.sort_by_columns(&[0, 1]);
        assert_eq!(table.row(0), int_row(&[1, 2]).as_slice());
        assert_eq!(table.row(1), int_row(&[3, -1]).as_slice());
        assert_eq!(table.row(2), int_row(&[3, 0]).as_slice());
    }
}
