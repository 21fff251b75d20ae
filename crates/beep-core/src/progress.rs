use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// One structured progress report. Every long-running operation in the
/// host funnels through this shape so callers can render phases, byte
/// counts, and per-package counters without knowing which component is
/// talking.
#[derive(Clone, Debug)]
pub enum ProgressUpdate {
    /// A named phase with a 0..=100 percentage; percentages within one
    /// operation are monotonic.
    Phase { label: String, percent: u8 },
    /// Raw byte progress for downloads.
    Bytes { done: u64, total: Option<u64> },
    /// Per-package progress during profile installs.
    Package {
        current: usize,
        total: usize,
        name: String,
    },
    /// Free-form line, e.g. streamed installer output.
    Message { text: String },
}

/// Callback-shaped progress channel. Cloning shares the callback.
#[derive(Clone, Default)]
pub struct ProgressSink {
    inner: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
}

impl ProgressSink {
    pub fn new(callback: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(callback)),
        }
    }

    /// A sink that drops every update.
    #[must_use]
    pub fn null() -> Self {
        Self { inner: None }
    }

    pub fn emit(&self, update: ProgressUpdate) {
        if let Some(callback) = &self.inner {
            callback(update);
        }
    }

    pub fn phase(&self, label: impl Into<String>, percent: u8) {
        self.emit(ProgressUpdate::Phase {
            label: label.into(),
            percent: percent.min(100),
        });
    }

    pub fn bytes(&self, done: u64, total: Option<u64>) {
        self.emit(ProgressUpdate::Bytes { done, total });
    }

    pub fn package(&self, current: usize, total: usize, name: impl Into<String>) {
        self.emit(ProgressUpdate::Package {
            current,
            total,
            name: name.into(),
        });
    }

    pub fn message(&self, text: impl Into<String>) {
        self.emit(ProgressUpdate::Message { text: text.into() });
    }
}

/// Cooperative cancellation flag, checked at every suspension point.
///
/// `linked` tokens observe their parent: cancelling the parent cancels
/// every child, while a child's own `cancel` leaves the parent alone.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    own: Arc<AtomicBool>,
    parents: Vec<Arc<AtomicBool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parents: Vec::new(),
        }
    }

    #[must_use]
    pub fn linked(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.own));
        Self {
            own: Arc::new(AtomicBool::new(false)),
            parents,
        }
    }

    /// A token that observes this token and `other`; firing either parent
    /// cancels the child.
    #[must_use]
    pub fn linked_with(&self, other: &Self) -> Self {
        let mut merged = self.linked();
        merged.parents.push(Arc::clone(&other.own));
        merged.parents.extend(other.parents.iter().map(Arc::clone));
        merged
    }

    pub fn cancel(&self) {
        self.own.store(true, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.own.load(AtomicOrdering::SeqCst)
            || self
                .parents
                .iter()
                .any(|flag| flag.load(AtomicOrdering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sink_forwards_updates_and_clamps_percent() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            ProgressSink::new(move |update| seen.lock().expect("seen lock").push(update))
        };
        sink.phase("Download", 250);
        sink.package(1, 3, "numpy");
        let seen = seen.lock().expect("seen lock");
        assert_eq!(seen.len(), 2);
        match &seen[0] {
            ProgressUpdate::Phase { label, percent } => {
                assert_eq!(label, "Download");
                assert_eq!(*percent, 100);
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn linked_tokens_observe_the_parent_but_not_vice_versa() {
        let parent = CancellationToken::new();
        let child = parent.linked();
        assert!(!child.is_cancelled());

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let second_child = parent.linked();
        parent.cancel();
        assert!(second_child.is_cancelled());
    }
}
