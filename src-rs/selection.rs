use crate::model::ResultRecord;
use std::sync::Arc;

/// Index of the result currently shown to the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSelection {
    index: Option<usize>,
}

impl ActiveSelection {
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn clear(&mut self) {
        self.index = None;
    }

    /// Called after every append. The first record of a batch becomes active
    /// when nothing is selected yet; later appends leave the choice alone.
    pub fn on_appended(&mut self, results_len: usize) {
        if self.index.is_none() && results_len == 1 {
            self.index = Some(0);
        }
    }

    /// Out-of-range indices are ignored. Returns whether the selection moved.
    pub fn select(&mut self, index: usize, results_len: usize) -> bool {
        if index >= results_len {
            return false;
        }
        let changed = self.index != Some(index);
        self.index = Some(index);
        changed
    }

    pub fn resolve<'a>(&self, results: &'a [Arc<ResultRecord>]) -> Option<&'a Arc<ResultRecord>> {
        self.index.and_then(|i| results.get(i))
    }
}
