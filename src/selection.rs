use crate::model::{BatchKillResult, OpId, Snapshot};
use std::collections::BTreeSet;
use tracing::debug;

pub type SelectionSet = BTreeSet<OpId>;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Reconciliation {
    pub selected: SelectionSet,
    pub dropped: SelectionSet,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionLedger {
    selected: SelectionSet,
    pending: SelectionSet,
}

impl SelectionLedger {
    pub fn toggle(&mut self, id: &OpId) -> bool {
        if self.selected.remove(id) {
            false
        } else {
            self.selected.insert(id.clone());
            true
        }
    }

    pub fn select_all(&mut self, snapshot: &Snapshot) -> usize {
        self.selected.extend(snapshot.ids().cloned());
        self.selected.len()
    }

    pub fn deselect_all(&mut self) -> usize {
        let count = self.selected.len();
        self.selected.clear();
        count
    }

    pub fn reconcile(&mut self, snapshot: &Snapshot) -> Reconciliation {
        let (kept, dropped): (SelectionSet, SelectionSet) = std::mem::take(&mut self.selected)
            .into_iter()
            .partition(|id| snapshot.contains(id));
        self.selected = kept;

        if !dropped.is_empty() {
            debug!(
                "selection reconcile dropped {} id(s): {:?}",
                dropped.len(),
                dropped
            );
        }

        Reconciliation {
            selected: self.selected.clone(),
            dropped,
        }
    }

    pub fn selected(&self) -> &SelectionSet {
        &self.selected
    }

    pub fn is_selected(&self, id: &OpId) -> bool {
        self.selected.contains(id)
    }

    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn selected_in_order(&self, snapshot: &Snapshot) -> Vec<OpId> {
        let mut ordered = snapshot
            .ids()
            .filter(|id| self.selected.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        ordered.extend(
            self.selected
                .iter()
                .filter(|id| !snapshot.contains(id))
                .cloned(),
        );
        ordered
    }

    pub fn mark_pending(&mut self, ids: &[OpId]) {
        self.pending.extend(ids.iter().cloned());
    }

    pub fn is_pending(&self, id: &OpId) -> bool {
        self.pending.contains(id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Applies a finished batch: successes leave the selection, failures stay selected.
    pub fn settle(&mut self, result: &BatchKillResult) {
        for (id, outcome) in &result.entries {
            self.pending.remove(id);
            if outcome.is_success() {
                self.selected.remove(id);
            }
        }
    }
}
