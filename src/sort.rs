use crate::model::{Operation, SortDirection};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct SortIndex {
    direction: SortDirection,
}

impl SortIndex {
    pub fn new(direction: SortDirection) -> Self {
        Self { direction }
    }

    pub fn direction(&self) -> SortDirection {
        self.direction
    }

    pub fn toggle(&mut self) -> SortDirection {
        self.direction = self.direction.toggled();
        self.direction
    }

    pub fn sort(&self, operations: Vec<Operation>) -> Vec<Operation> {
        sort_by_elapsed(operations, self.direction)
    }
}

/// Stable: rows with equal elapsed time keep the order the server reported them in.
pub fn sort_by_elapsed(mut operations: Vec<Operation>, direction: SortDirection) -> Vec<Operation> {
    match direction {
        SortDirection::Ascending => {
            operations.sort_by(|left, right| left.elapsed_secs.cmp(&right.elapsed_secs))
        }
        SortDirection::Descending => {
            operations.sort_by(|left, right| right.elapsed_secs.cmp(&left.elapsed_secs))
        }
    }
    operations
}
