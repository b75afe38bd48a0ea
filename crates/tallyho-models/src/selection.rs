use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("option {index} does not exist (poll has {option_count} options)")]
    OutOfRange { index: u32, option_count: usize },
    #[error("option {0} selected more than once")]
    Duplicate(u32),
    #[error("{count} options selected, at most {max} allowed")]
    TooMany { count: usize, max: usize },
}

/// What a toggle did to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Removed,
    Added { evicted: Option<u32> },
}

/// A participant's selected option indices, oldest first.
///
/// Indices are unique. Insertion order is kept so that a full set evicts the
/// oldest selection when a new one is toggled on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SelectionSet(Vec<u32>);

impl SelectionSet {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a set from caller-supplied indices, rejecting anything that
    /// cannot be a valid selection for a poll with `option_count` options.
    pub fn try_from_indices(
        indices: &[u32],
        option_count: usize,
        max: usize,
    ) -> Result<Self, SelectionError> {
        let mut set = Vec::with_capacity(indices.len());
        for &index in indices {
            if index as usize >= option_count {
                return Err(SelectionError::OutOfRange {
                    index,
                    option_count,
                });
            }
            if set.contains(&index) {
                return Err(SelectionError::Duplicate(index));
            }
            set.push(index);
        }
        if set.len() > max {
            return Err(SelectionError::TooMany {
                count: set.len(),
                max,
            });
        }
        Ok(Self(set))
    }

    /// Build a set from stored indices, dropping repeats.
    pub fn from_unordered(indices: &[u32]) -> Self {
        let mut set = Vec::with_capacity(indices.len());
        for &index in indices {
            if !set.contains(&index) {
                set.push(index);
            }
        }
        Self(set)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.0
    }

    /// Remove `index` if selected, otherwise add it. When the set already
    /// holds `max` entries the oldest ones are evicted first.
    pub fn toggle(&mut self, index: u32, max: usize) -> Toggle {
        if let Some(pos) = self.0.iter().position(|&i| i == index) {
            self.0.remove(pos);
            return Toggle::Removed;
        }

        let max = max.max(1);
        let mut evicted = None;
        while self.0.len() >= max {
            evicted = Some(self.0.remove(0));
        }
        self.0.push(index);
        Toggle::Added { evicted }
    }

    /// Number of selected indices that also appear in `other`.
    pub fn overlap(&self, other: &SelectionSet) -> usize {
        self.0.iter().filter(|i| other.contains(**i)).count()
    }
}
