//! Append-only chain of filters sharing the listener argument signature but
//! returning a veto/continue decision.

use std::sync::{Arc, RwLock};

pub(crate) type FilterFn<A> = dyn Fn(&mut A) -> bool + Send + Sync;

/// Guarded by its own lock, independent of the key map and any listener
/// list. A dispatch takes a snapshot of the chain under the lock, then runs
/// it without holding the lock, so appending a filter is safe concurrent
/// with dispatches — filters appended mid-dispatch simply aren't part of
/// that dispatch's snapshot.
pub(crate) struct FilterChain<A> {
    filters: RwLock<Vec<Arc<FilterFn<A>>>>,
}

impl<A> FilterChain<A> {
    pub(crate) fn new() -> Self {
        FilterChain {
            filters: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn append(&self, filter: Arc<FilterFn<A>>) {
        self.filters
            .write()
            .expect("filter chain lock poisoned")
            .push(filter);
    }

    /// Runs the chain against `args` in insertion order, short-circuiting on
    /// the first veto. Returns `true` iff every filter passed, i.e. the
    /// dispatcher should go on to invoke listeners.
    pub(crate) fn run(&self, args: &mut A) -> bool {
        let snapshot: Vec<_> = self
            .filters
            .read()
            .expect("filter chain lock poisoned")
            .clone();
        for filter in &snapshot {
            if !filter(args) {
                return false;
            }
        }
        true
    }
}
