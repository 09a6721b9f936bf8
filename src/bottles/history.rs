use serde::{Deserialize, Serialize};

use super::domain::BottleId;

/// Ordered set of bottle ids a user has retrieved, most recent last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetrievalHistory(Vec<BottleId>);

impl RetrievalHistory {
    pub fn from_ids(ids: Vec<BottleId>) -> Self {
        let mut history = Self::default();
        for id in ids {
            history.touch(id);
        }
        history
    }

    pub fn contains(&self, id: BottleId) -> bool {
        self.0.contains(&id)
    }

    /// Move `id` to the end, inserting it if absent. Returns true when newly added.
    pub fn touch(&mut self, id: BottleId) -> bool {
        match self.0.iter().position(|&existing| existing == id) {
            Some(pos) => {
                let existing = self.0.remove(pos);
                self.0.push(existing);
                false
            }
            None => {
                self.0.push(id);
                true
            }
        }
    }

    pub fn ids(&self) -> &[BottleId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
