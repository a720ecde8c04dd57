//! The dispatcher itself: binds the key map, filter chain, and per-key
//! listener lists together and coordinates the locking and re-entrancy
//! discipline described in the crate's concurrency model.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::error::Result;
use crate::filter::{FilterChain, FilterFn};
use crate::key::{DirectKey, ExtractedKey};
use crate::listener_list::{Handle, ListenerList};

pub(crate) type ListenerFn<A> = dyn Fn(&mut A) + Send + Sync;

/// A keyed, re-entrancy-safe event dispatcher.
///
/// `K` is the event key type, `A` is the argument bundle every listener and
/// filter receives, and `P` is the key policy bound at construction —
/// [`DirectKey`] (the default) or [`ExtractedKey`]. Use [`Dispatcher::new`]
/// for direct-key dispatch, where the caller passes the key to `dispatch`
/// explicitly, or [`Dispatcher::with_key_extractor`] for extracted-key
/// dispatch, where the key is computed from `args` itself.
///
/// Locks are acquired key-map-then-listener-list, never the reverse, and the
/// filter chain's lock is independent of both; none of the three locks are
/// ever held across a listener or filter invocation. This is what makes
/// re-entrant `dispatch` calls from within a listener — for the same key,
/// a different key, or even back into the same dispatcher the listener
/// itself was registered on — well-defined rather than merely "happens to
/// work".
pub struct Dispatcher<K, A, P = DirectKey> {
    policy: P,
    listeners: RwLock<HashMap<K, Arc<ListenerList<Arc<ListenerFn<A>>>>>>,
    filters: FilterChain<A>,
}

impl<K, A> Dispatcher<K, A, DirectKey>
where
    K: Eq + Hash + Clone,
{
    /// Creates an empty direct-key dispatcher.
    pub fn new() -> Self {
        Dispatcher {
            policy: DirectKey,
            listeners: RwLock::new(HashMap::new()),
            filters: FilterChain::new(),
        }
    }

    /// Runs the filter chain for `args`, then — unless a filter vetoed the
    /// dispatch — invokes every listener registered for `key`, in
    /// registration order, passing `args`.
    ///
    /// If a listener or filter panics, the panic propagates to this call's
    /// caller and any listeners after it in traversal order are not
    /// invoked. The list being traversed is not left unusable: the mutex
    /// guarding it is never held across an invocation, so a panic cannot
    /// poison it, and the in-flight traversal count is decremented by a
    /// drop guard regardless of how the call unwinds.
    pub fn dispatch(&self, key: K, args: &mut A) {
        self.dispatch_inner(key, args);
    }
}

impl<K, A> Default for Dispatcher<K, A, DirectKey>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, A, F> Dispatcher<K, A, ExtractedKey<K, A, F>>
where
    K: Eq + Hash + Clone,
    F: Fn(&A) -> K + Send + Sync + 'static,
{
    /// Creates an empty extracted-key dispatcher bound to `extract`.
    pub fn with_key_extractor(extract: F) -> Self {
        Dispatcher {
            policy: ExtractedKey::new(extract),
            listeners: RwLock::new(HashMap::new()),
            filters: FilterChain::new(),
        }
    }

    /// Derives the key from `args` via the bound extractor (called exactly
    /// once), then dispatches exactly as [`Dispatcher::dispatch`] does for a
    /// direct-key dispatcher.
    pub fn dispatch(&self, args: &mut A) {
        let key = (self.policy.extract)(args);
        self.dispatch_inner(key, args);
    }
}

impl<K, A, P> Dispatcher<K, A, P>
where
    K: Eq + Hash + Clone,
{
    fn dispatch_inner(&self, key: K, args: &mut A) {
        if !self.filters.run(args) {
            debug!("dispatch vetoed by filter chain");
            return;
        }
        if let Some(list) = self.list_for(&key) {
            list.for_each(|listener| listener(args));
        }
    }

    fn list_for(&self, key: &K) -> Option<Arc<ListenerList<Arc<ListenerFn<A>>>>> {
        self.listeners
            .read()
            .expect("key map lock poisoned")
            .get(key)
            .cloned()
    }

    fn list_for_or_create(&self, key: K) -> Arc<ListenerList<Arc<ListenerFn<A>>>> {
        if let Some(list) = self.list_for(&key) {
            return list;
        }
        self.listeners
            .write()
            .expect("key map lock poisoned")
            .entry(key)
            .or_insert_with(|| {
                debug!("creating listener list for new key");
                Arc::new(ListenerList::new())
            })
            .clone()
    }

    /// Registers `listener` at the end of `key`'s list.
    pub fn append_listener(
        &self,
        key: K,
        listener: impl Fn(&mut A) + Send + Sync + 'static,
    ) -> Handle {
        self.list_for_or_create(key).append(Arc::new(listener))
    }

    /// Registers `listener` at the front of `key`'s list.
    pub fn prepend_listener(
        &self,
        key: K,
        listener: impl Fn(&mut A) + Send + Sync + 'static,
    ) -> Handle {
        self.list_for_or_create(key).prepend(Arc::new(listener))
    }

    /// Registers `listener` immediately before `before` in `key`'s list.
    /// Fails with [`crate::Error::InvalidHandle`] if `before` is not a
    /// currently alive handle in that list — including a handle that is
    /// alive, but in a *different* key's list, which would otherwise
    /// cross-link two lists and violate the key map invariant.
    pub fn insert_listener_before(
        &self,
        key: K,
        listener: impl Fn(&mut A) + Send + Sync + 'static,
        before: &Handle,
    ) -> Result<Handle> {
        match self.list_for(&key) {
            Some(list) => list.insert_before(Arc::new(listener), before),
            None => Err(crate::Error::InvalidHandle),
        }
    }

    /// Clears `handle`'s liveness for `key`'s list, idempotently. Returns
    /// whether the listener was still alive beforehand. Safe to call from
    /// within the listener's own invocation (self-removal) or from another
    /// thread while a traversal of this list is in progress elsewhere.
    pub fn remove_listener(&self, key: &K, handle: &Handle) -> bool {
        match self.list_for(key) {
            Some(list) => list.remove(handle),
            None => false,
        }
    }

    /// Whether `key` currently has at least one alive listener.
    pub fn has_any_listener(&self, key: &K) -> bool {
        match self.list_for(key) {
            Some(list) => list.has_any(),
            None => false,
        }
    }

    /// Appends `filter` to the end of the filter chain. Filters cannot be
    /// removed: the chain has the same lifetime as the dispatcher.
    pub fn append_filter(&self, filter: impl Fn(&mut A) -> bool + Send + Sync + 'static) {
        self.filters.append(Arc::new(filter) as Arc<FilterFn<A>>);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Args {
        a: i32,
        b: i32,
    }

    // Scenario 1: basic fan-out.
    #[test]
    fn basic_fan_out() {
        let d: Dispatcher<i32, Args> = Dispatcher::new();
        d.append_listener(3, |args: &mut Args| args.a = 2);
        d.append_listener(3, |args: &mut Args| args.b = 8);

        let mut args = Args { a: 0, b: 0 };
        d.dispatch(3, &mut args);
        assert_eq!(args.a, 2);
        assert_eq!(args.b, 8);
    }

    // Scenario 2: self-removing chain, also removing a peer's handle.
    #[test]
    fn self_removing_chain() {
        let d: Arc<Dispatcher<i32, Args>> = Arc::new(Dispatcher::new());
        let d1 = d.clone();
        let handles: Arc<std::sync::Mutex<(Handle, Handle)>> =
            Arc::new(std::sync::Mutex::new((Handle::default(), Handle::default())));
        let handles_for_l1 = handles.clone();

        let h1 = d.append_listener(3, move |args: &mut Args| {
            args.a = 2;
            let (ha, hb) = handles_for_l1.lock().unwrap().clone();
            d1.remove_listener(&3, &hb);
            d1.remove_listener(&3, &ha);
        });
        let h2 = d.append_listener(3, |args: &mut Args| args.b = 8);
        *handles.lock().unwrap() = (h1.clone(), h2.clone());

        let mut args = Args { a: 0, b: 0 };
        d.dispatch(3, &mut args);
        assert_eq!(args.a, 2);
        assert_eq!(args.b, 0);
        assert!(!h1.is_valid());
        assert!(!h2.is_valid());

        args.a = 0;
        d.dispatch(3, &mut args);
        assert_eq!(args.a, 0);
        assert_eq!(args.b, 0);
    }

    // Scenario 3: append during dispatch is not observed until the next dispatch.
    #[test]
    fn append_during_dispatch_deferred() {
        let d: Arc<Dispatcher<i32, Args>> = Arc::new(Dispatcher::new());
        let d1 = d.clone();
        d.append_listener(3, move |args: &mut Args| {
            args.a = 2;
            d1.append_listener(3, |args: &mut Args| args.b = 8);
        });

        let mut args = Args { a: 0, b: 0 };
        d.dispatch(3, &mut args);
        assert_eq!(args.a, 2);
        assert_eq!(args.b, 0);

        d.dispatch(3, &mut args);
        assert_eq!(args.b, 8);
    }

    // Scenario 4: cross-event re-entry.
    #[test]
    fn cross_event_reentry() {
        let d: Arc<Dispatcher<i32, Args>> = Arc::new(Dispatcher::new());
        let d1 = d.clone();
        let d2 = d.clone();
        let handles: Arc<std::sync::Mutex<(Handle, Handle)>> =
            Arc::new(std::sync::Mutex::new((Handle::default(), Handle::default())));
        let handles_for_l2 = handles.clone();

        let h1 = d.append_listener(3, move |args: &mut Args| {
            args.a = 2;
            d1.dispatch(5, args);
        });
        let h2 = d.append_listener(5, move |args: &mut Args| {
            args.b = 8;
            let (ha, hb) = handles_for_l2.lock().unwrap().clone();
            d2.remove_listener(&3, &ha);
            d2.remove_listener(&5, &hb);
        });
        *handles.lock().unwrap() = (h1.clone(), h2.clone());

        let mut args = Args { a: 0, b: 0 };
        d.dispatch(3, &mut args);
        assert_eq!(args.a, 2);
        assert_eq!(args.b, 8);
        assert!(!h1.is_valid());
        assert!(!h2.is_valid());
    }

    // Scenarios 5 & 6 give filters visibility into the key by putting it in
    // the argument bundle itself: a direct-key dispatcher's `A` is whatever
    // the caller defines, so nothing stops it from carrying a copy of `e`
    // alongside the payload.
    struct KeyedArgs {
        e: usize,
        index: i32,
    }

    // Scenario 5: filter vetoes a subset of keys.
    #[test]
    fn filter_vetoes_subset() {
        let d: Dispatcher<usize, KeyedArgs> = Dispatcher::new();
        let data = Arc::new(std::sync::Mutex::new(vec![0i32; 5]));
        for e in 0..5 {
            let data = data.clone();
            d.append_listener(e, move |args: &mut KeyedArgs| {
                data.lock().unwrap()[args.e] = args.index;
            });
        }
        let f1_calls = Arc::new(AtomicUsize::new(0));
        let f1_calls_inner = f1_calls.clone();
        d.append_filter(move |args: &mut KeyedArgs| {
            f1_calls_inner.fetch_add(1, Ordering::SeqCst);
            args.e < 2
        });
        let f2_calls = Arc::new(AtomicUsize::new(0));
        let f2_calls_inner = f2_calls.clone();
        d.append_filter(move |_: &mut KeyedArgs| {
            f2_calls_inner.fetch_add(1, Ordering::SeqCst);
            true
        });

        for e in 0..5usize {
            let mut args = KeyedArgs { e, index: 58 };
            d.dispatch(e, &mut args);
        }

        let data = data.lock().unwrap().clone();
        assert_eq!(data, vec![58, 58, 0, 0, 0]);
        assert_eq!(f1_calls.load(Ordering::SeqCst), 5);
        assert_eq!(f2_calls.load(Ordering::SeqCst), 2);
    }

    // Scenario 6: filter mutates the argument; listeners observe the mutation.
    #[test]
    fn filter_mutates_argument() {
        let d: Dispatcher<usize, KeyedArgs> = Dispatcher::new();
        let data = Arc::new(std::sync::Mutex::new(vec![0i32; 5]));
        for e in 0..5 {
            let data = data.clone();
            d.append_listener(e, move |args: &mut KeyedArgs| {
                data.lock().unwrap()[args.e] = args.index;
            });
        }
        let f1_calls = Arc::new(AtomicUsize::new(0));
        let f1_calls_inner = f1_calls.clone();
        d.append_filter(move |args: &mut KeyedArgs| {
            f1_calls_inner.fetch_add(1, Ordering::SeqCst);
            if args.e >= 2 {
                args.index += 1;
            }
            true
        });
        let f2_calls = Arc::new(AtomicUsize::new(0));
        let f2_calls_inner = f2_calls.clone();
        d.append_filter(move |_: &mut KeyedArgs| {
            f2_calls_inner.fetch_add(1, Ordering::SeqCst);
            true
        });

        for e in 0..5usize {
            let mut args = KeyedArgs { e, index: 58 };
            d.dispatch(e, &mut args);
        }

        let data = data.lock().unwrap().clone();
        assert_eq!(data, vec![58, 58, 59, 59, 59]);
        assert_eq!(f1_calls.load(Ordering::SeqCst), 5);
        assert_eq!(f2_calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn extracted_key_dispatch() {
        struct Event {
            kind: &'static str,
            value: i32,
        }
        let d: Dispatcher<&'static str, Event, ExtractedKey<&'static str, Event, _>> =
            Dispatcher::with_key_extractor(|e: &Event| e.kind);
        d.append_listener("tick", |e: &mut Event| e.value += 1);

        let mut event = Event { kind: "tick", value: 0 };
        d.dispatch(&mut event);
        assert_eq!(event.value, 1);
    }

    #[test]
    fn insert_before_cross_key_handle_fails() {
        let d: Dispatcher<i32, i32> = Dispatcher::new();
        let h_a = d.append_listener(3, |_: &mut i32| {});
        d.append_listener(5, |_: &mut i32| {});
        let result = d.insert_listener_before(5, |_: &mut i32| {}, &h_a);
        assert_eq!(result.unwrap_err(), crate::Error::InvalidHandle);
    }

    #[test]
    fn panicking_listener_does_not_poison_dispatcher() {
        let d: Dispatcher<i32, Vec<i32>> = Dispatcher::new();
        d.append_listener(3, |out: &mut Vec<i32>| out.push(1));
        let should_panic = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let should_panic_inner = should_panic.clone();
        d.append_listener(3, move |_: &mut Vec<i32>| {
            if should_panic_inner.swap(false, Ordering::SeqCst) {
                panic!("listener boom");
            }
        });
        d.append_listener(3, |out: &mut Vec<i32>| out.push(3));

        let mut out = Vec::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            d.dispatch(3, &mut out);
        }));
        assert!(result.is_err());
        // The panicking listener comes before the third listener in
        // traversal order, so it must not have run.
        assert_eq!(out, vec![1]);

        // The dispatcher itself must still be fully usable afterwards: no
        // poisoned lock, no stuck traversal counter.
        let mut out2 = Vec::new();
        d.dispatch(3, &mut out2);
        assert_eq!(out2, vec![1, 3]);
    }

    #[test]
    fn has_any_listener_reflects_registry_state() {
        let d: Dispatcher<i32, i32> = Dispatcher::new();
        assert!(!d.has_any_listener(&3));
        let h = d.append_listener(3, |_: &mut i32| {});
        assert!(d.has_any_listener(&3));
        d.remove_listener(&3, &h);
        assert!(!d.has_any_listener(&3));
    }
}
