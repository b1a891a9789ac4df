//! Conversation State
//!
//! The mutable half of a session: which questions have been answered, which
//! remain, and which one is awaiting an answer. The state is plain data so
//! that request/response deployments can persist it between turns and
//! rehydrate it with [`ConversationState::restore`].

use crate::error::FlowError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tracks used and unused question indices for one session.
///
/// `used` and `unused` always partition `0..bank_size`. An index moves from
/// `unused` to `used` exactly once and never moves back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateSnapshot", into = "StateSnapshot")]
pub struct ConversationState {
    bank_size: usize,
    used: BTreeSet<usize>,
    unused: BTreeSet<usize>,
    current: Option<usize>,
    started: bool,
    ready: bool,
}

/// Usage statistics for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub used: usize,
    pub unused: usize,
    pub total: usize,
    pub percentage: f64,
    pub exhausted: bool,
}

impl ConversationState {
    /// A fresh state with every question unused.
    pub fn initialize(bank_size: usize) -> Self {
        Self {
            bank_size,
            used: BTreeSet::new(),
            unused: (0..bank_size).collect(),
            current: None,
            started: false,
            ready: false,
        }
    }

    /// Rebuilds a state from externally held values.
    ///
    /// The unused set is always recomputed as the complement of `used`; any
    /// unused set the caller may also hold is advisory only. `current` may
    /// already be in `used` (a repeated submission), in which case marking it
    /// answered is a no-op.
    pub fn restore(
        used: impl IntoIterator<Item = usize>,
        current: Option<usize>,
        bank_size: usize,
    ) -> Result<Self, FlowError> {
        let used: BTreeSet<usize> = used.into_iter().collect();
        if let Some(bad) = used.iter().find(|&&i| i >= bank_size) {
            return Err(FlowError::InvalidState(format!(
                "used index {bad} is outside the bank of {bank_size} questions"
            )));
        }
        if let Some(bad) = current.filter(|&i| i >= bank_size) {
            return Err(FlowError::InvalidState(format!(
                "current index {bad} is outside the bank of {bank_size} questions"
            )));
        }

        let unused = (0..bank_size).filter(|i| !used.contains(i)).collect();
        let started = current.is_some() || !used.is_empty();
        Ok(Self {
            bank_size,
            used,
            unused,
            current,
            started,
            ready: started,
        })
    }

    /// Moves the current question into the used set.
    ///
    /// Returns `false` without changing anything when there is no current
    /// question or it was already answered.
    pub fn mark_current_answered(&mut self) -> bool {
        match self.current {
            Some(index) if self.unused.remove(&index) => {
                self.used.insert(index);
                true
            }
            _ => false,
        }
    }

    /// Makes `index` the question awaiting an answer.
    pub fn set_current(&mut self, index: usize) -> Result<(), FlowError> {
        if !self.unused.contains(&index) {
            return Err(FlowError::InvalidSelection { index });
        }
        self.current = Some(index);
        Ok(())
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    pub fn mark_started(&mut self) {
        self.started = true;
        self.ready = true;
    }

    pub fn mark_ended(&mut self) {
        self.started = false;
    }

    pub fn progress(&self) -> Progress {
        let used = self.used.len();
        let total = self.bank_size;
        Progress {
            used,
            unused: self.unused.len(),
            total,
            percentage: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64 * 100.0
            },
            exhausted: self.unused.is_empty(),
        }
    }

    pub fn used(&self) -> &BTreeSet<usize> {
        &self.used
    }

    pub fn unused(&self) -> &BTreeSet<usize> {
        &self.unused
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn bank_size(&self) -> usize {
        self.bank_size
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// True when `used` and `unused` partition the full index range.
    pub fn is_consistent(&self) -> bool {
        self.used.is_disjoint(&self.unused)
            && self.used.len() + self.unused.len() == self.bank_size
            && self
                .used
                .iter()
                .chain(self.unused.iter())
                .all(|&i| i < self.bank_size)
    }
}

/// Wire form of [`ConversationState`]; the unused set is derived on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub bank_size: usize,
    pub used_indices: Vec<usize>,
    pub current_index: Option<usize>,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub ready: bool,
}

impl TryFrom<StateSnapshot> for ConversationState {
    type Error = FlowError;

    fn try_from(snapshot: StateSnapshot) -> Result<Self, Self::Error> {
        let mut state = Self::restore(
            snapshot.used_indices,
            snapshot.current_index,
            snapshot.bank_size,
        )?;
        state.started = snapshot.started;
        state.ready = snapshot.ready;
        Ok(state)
    }
}

impl From<ConversationState> for StateSnapshot {
    fn from(state: ConversationState) -> Self {
        Self {
            bank_size: state.bank_size,
            used_indices: state.used.into_iter().collect(),
            current_index: state.current,
            started: state.started,
            ready: state.ready,
        }
    }
}
