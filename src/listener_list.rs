//! Per-key ordered listener storage with re-entrancy-safe traversal.
//!
//! This is the hard part of the crate. A [`ListenerList`] must tolerate a
//! listener removing itself, removing a different listener, or appending a
//! new one, all from within its own invocation during an in-progress
//! traversal — on the same thread, and (independently) from other threads
//! running their own traversals or mutations concurrently.
//!
//! # Why not just snapshot the list per dispatch?
//!
//! Cloning the listener vector at the start of every dispatch would make
//! traversal trivial, but it changes the observable semantics: a listener
//! that removes a later listener would no longer suppress that listener's
//! invocation for the dispatch in progress, only for subsequent ones. It
//! also allocates on every dispatch. Instead each node carries its own
//! liveness flag, cleared immediately on removal, and physical unlinking is
//! deferred for as long as any traversal is in progress. This is the single
//! most important mechanism in the crate.
//!
//! # Representation
//!
//! Nodes live in a slab (`Vec<Option<Node<L>>>`) rather than behind raw
//! pointers, so the whole module is safe Rust. A node's position is named by
//! its slab index plus the `Arc<AtomicBool>` liveness cell shared with every
//! [`Handle`] that refers to it; comparing that `Arc`'s identity (not the
//! index alone) is what stops a [`Handle`] from silently re-binding to a
//! different node after its original slot is freed and reused — the safe
//! equivalent of a pointer-plus-generation-counter scheme, without unsafe
//! code or a manually managed counter.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::error::{Error, Result};

/// A weak, comparable reference to a single registered listener.
///
/// A `Handle` never keeps its listener alive and never owns anything beyond
/// a liveness flag shared with the node it names. It is cheap to clone and
/// safe to hold onto past the listener's removal: [`Handle::is_valid`]
/// simply reports false from that point on.
#[derive(Clone)]
pub struct Handle {
    index: usize,
    alive: Arc<AtomicBool>,
}

impl Handle {
    fn new(index: usize, alive: Arc<AtomicBool>) -> Self {
        Handle { index, alive }
    }

    /// True while the listener this handle names is still registered.
    ///
    /// This goes false the instant `remove` clears the node's liveness
    /// flag, not only once the node is physically reclaimed — callers have
    /// no way to observe the deferred-reclaim window, nor should they need
    /// to.
    pub fn is_valid(&self) -> bool {
        self.index != usize::MAX && self.alive.load(Ordering::Acquire)
    }
}

impl Default for Handle {
    /// Yields an always-invalid handle, matching no listener in any list.
    fn default() -> Self {
        Handle {
            index: usize::MAX,
            alive: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        if self.index == usize::MAX && other.index == usize::MAX {
            return true;
        }
        self.index == other.index && Arc::ptr_eq(&self.alive, &other.alive)
    }
}

impl Eq for Handle {}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("valid", &self.is_valid())
            .finish()
    }
}

struct Node<L> {
    listener: L,
    alive: Arc<AtomicBool>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Inner<L> {
    slots: Vec<Option<Node<L>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    active_iterations: usize,
    pending_reclaim: Vec<usize>,
}

impl<L> Inner<L> {
    fn new() -> Self {
        Inner {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            active_iterations: 0,
            pending_reclaim: Vec::new(),
        }
    }

    fn alloc(&mut self, node: Node<L>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.slots[idx] = Some(node);
            idx
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        }
    }

    /// Resolves a handle to a slot index, but only if that slot still holds
    /// the exact node the handle was issued for (not a node that reused the
    /// slot after reclaim).
    fn resolve(&self, handle: &Handle) -> Option<usize> {
        if handle.index == usize::MAX {
            return None;
        }
        match self.slots.get(handle.index) {
            Some(Some(node)) if Arc::ptr_eq(&node.alive, &handle.alive) => Some(handle.index),
            _ => None,
        }
    }

    fn link_append(&mut self, idx: usize) {
        let old_tail = self.tail;
        self.slots[idx].as_mut().unwrap().prev = old_tail;
        match old_tail {
            Some(t) => self.slots[t].as_mut().unwrap().next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn link_prepend(&mut self, idx: usize) {
        let old_head = self.head;
        self.slots[idx].as_mut().unwrap().next = old_head;
        match old_head {
            Some(h) => self.slots[h].as_mut().unwrap().prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn link_before(&mut self, idx: usize, before: usize) {
        let prev = self.slots[before].as_ref().unwrap().prev;
        self.slots[idx].as_mut().unwrap().prev = prev;
        self.slots[idx].as_mut().unwrap().next = Some(before);
        self.slots[before].as_mut().unwrap().prev = Some(idx);
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = Some(idx),
            None => self.head = Some(idx),
        }
    }

    /// Physically unlinks and frees `idx`. The caller must already know the
    /// node is not alive; this never runs while a traversal could still read
    /// `idx`'s links.
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slots[idx].as_ref().unwrap();
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx] = None;
        self.free.push(idx);
    }

    /// Drains the pending-reclaim set. Only called once `active_iterations`
    /// has dropped to zero.
    fn drain_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending_reclaim);
        if !pending.is_empty() {
            trace!(count = pending.len(), "reclaiming pending-removal listener nodes");
        }
        for idx in pending {
            if self.slots[idx].is_some() {
                self.unlink(idx);
            }
        }
    }
}

/// Decrements the list's in-flight traversal count on drop, including on
/// unwind through a panicking listener, so a panic can never leave the list
/// permanently unable to reclaim.
struct IterGuard<'a, L> {
    list: &'a ListenerList<L>,
}

impl<'a, L> Drop for IterGuard<'a, L> {
    fn drop(&mut self) {
        let mut inner = self.list.lock();
        inner.active_iterations -= 1;
        if inner.active_iterations == 0 {
            inner.drain_pending();
        }
    }
}

/// An ordered, per-key collection of listeners, safe to mutate and traverse
/// concurrently — including self-mutation from within a listener invoked by
/// an in-progress traversal of this very list.
pub(crate) struct ListenerList<L> {
    inner: Mutex<Inner<L>>,
}

impl<L: Clone> ListenerList<L> {
    pub(crate) fn new() -> Self {
        ListenerList {
            inner: Mutex::new(Inner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<L>> {
        self.inner.lock().expect("listener list mutex poisoned")
    }

    pub(crate) fn append(&self, listener: L) -> Handle {
        let alive = Arc::new(AtomicBool::new(true));
        let mut inner = self.lock();
        let idx = inner.alloc(Node {
            listener,
            alive: alive.clone(),
            prev: None,
            next: None,
        });
        inner.link_append(idx);
        Handle::new(idx, alive)
    }

    pub(crate) fn prepend(&self, listener: L) -> Handle {
        let alive = Arc::new(AtomicBool::new(true));
        let mut inner = self.lock();
        let idx = inner.alloc(Node {
            listener,
            alive: alive.clone(),
            prev: None,
            next: None,
        });
        inner.link_prepend(idx);
        Handle::new(idx, alive)
    }

    /// Inserts `listener` immediately before `before` in this list. Fails
    /// with [`Error::InvalidHandle`] if `before` does not name a currently
    /// alive node in this list — including the case where it names a node
    /// that belongs to a *different* key's list, which would otherwise
    /// cross-link two lists and violate the key map invariant.
    pub(crate) fn insert_before(&self, listener: L, before: &Handle) -> Result<Handle> {
        let alive = Arc::new(AtomicBool::new(true));
        let mut inner = self.lock();
        let before_idx = inner.resolve(before).ok_or(Error::InvalidHandle)?;
        if !inner.slots[before_idx]
            .as_ref()
            .unwrap()
            .alive
            .load(Ordering::Acquire)
        {
            return Err(Error::InvalidHandle);
        }
        let idx = inner.alloc(Node {
            listener,
            alive: alive.clone(),
            prev: None,
            next: None,
        });
        inner.link_before(idx, before_idx);
        Ok(Handle::new(idx, alive))
    }

    /// Clears the node's liveness flag so no traversal invokes it again,
    /// idempotently. Physically unlinks immediately if no traversal is in
    /// progress, otherwise defers to the next drain. Returns whether the
    /// handle named a node that was still alive.
    pub(crate) fn remove(&self, handle: &Handle) -> bool {
        let mut inner = self.lock();
        let idx = match inner.resolve(handle) {
            Some(idx) => idx,
            None => {
                debug!("removing a handle that no longer resolves to any node");
                return false;
            }
        };
        let was_alive = inner.slots[idx]
            .as_ref()
            .unwrap()
            .alive
            .swap(false, Ordering::AcqRel);
        if !was_alive {
            debug!("removing a handle whose node was already removed");
            return false;
        }
        if inner.active_iterations == 0 {
            inner.unlink(idx);
        } else {
            inner.pending_reclaim.push(idx);
        }
        true
    }

    pub(crate) fn has_any(&self) -> bool {
        let inner = self.lock();
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            match inner.slots[idx].as_ref() {
                Some(node) if node.alive.load(Ordering::Acquire) => return true,
                Some(node) => cursor = node.next,
                None => break,
            }
        }
        false
    }

    /// Forward traversal tolerant of concurrent append/remove, including
    /// self-removal from within `f` and re-entrant dispatch that appends to
    /// or removes from this same list.
    ///
    /// The traversal snapshots the current tail as its endpoint before
    /// starting. It stops right after processing the node at that endpoint,
    /// regardless of what that node's `next` link has since become — which
    /// is how nodes appended during the traversal end up invisible to it
    /// without requiring a full snapshot copy.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&L)) {
        // head and tail must be captured together with the active_iterations
        // bump, under one lock acquisition: if head were re-read afterwards,
        // a concurrent prepend landing in the gap would let this traversal
        // start at a node that didn't exist when it began.
        let (mut cursor, endpoint) = {
            let mut inner = self.lock();
            let endpoint = inner.tail;
            if endpoint.is_some() {
                inner.active_iterations += 1;
            }
            (inner.head, endpoint)
        };
        let endpoint = match endpoint {
            Some(e) => e,
            None => return,
        };
        let _guard = IterGuard { list: self };

        while let Some(idx) = cursor {
            let (listener, next) = {
                let inner = self.lock();
                let node = inner.slots[idx]
                    .as_ref()
                    .expect("node observed by an active traversal must not be reclaimed");
                let listener = node.alive.load(Ordering::Acquire).then(|| node.listener.clone());
                (listener, node.next)
            };
            if let Some(listener) = listener {
                f(&listener);
            }
            if idx == endpoint {
                break;
            }
            cursor = next;
        }
    }
}
