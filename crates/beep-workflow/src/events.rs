use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one action instance within a process.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(String);

impl ActionId {
    #[must_use]
    pub fn next() -> Self {
        Self(format!(
            "act-{}",
            NEXT_ACTION_ID.fetch_add(1, AtomicOrdering::SeqCst)
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identity carried in every event payload.
#[derive(Clone, Debug)]
pub struct ActionDescriptor {
    pub id: ActionId,
    pub type_name: String,
    pub name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionEventKind {
    Started,
    Running,
    Ended,
}

#[derive(Clone, Debug)]
pub struct ActionProgress {
    pub percent: Option<u8>,
    pub message: String,
}

/// Payload delivered to subscribers on `Started`, `Running`, and `Ended`.
#[derive(Clone, Debug)]
pub struct ActionEvent {
    pub kind: ActionEventKind,
    pub action: ActionDescriptor,
    pub progress: ActionProgress,
}

pub type ActionObserver = Arc<dyn Fn(&ActionEvent) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_ids_are_unique_within_the_process() {
        let first = ActionId::next();
        let second = ActionId::next();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("act-"));
    }
}
