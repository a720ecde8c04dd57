//! Event key policy: how a dispatch derives the key used to look up a
//! listener list. Bound once at [`crate::Dispatcher`] construction, never at
//! dispatch time, so a dispatcher's key-derivation strategy can't change
//! shape mid-lifetime.

use std::marker::PhantomData;

/// Direct-key policy: the key is supplied explicitly alongside the dispatch
/// arguments (`dispatcher.dispatch(key, &mut args)`). Listener signatures
/// under this policy never see the key itself, only `args`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectKey;

/// Extracted-key policy: the key is computed from the dispatch arguments by
/// a caller-supplied function (`dispatcher.dispatch(&mut args)`). `extract`
/// must be deterministic and side-effect free; the dispatcher calls it
/// exactly once per dispatch.
pub struct ExtractedKey<K, A, F>
where
    F: Fn(&A) -> K + Send + Sync + 'static,
{
    pub(crate) extract: F,
    _marker: PhantomData<fn(&A) -> K>,
}

impl<K, A, F: Fn(&A) -> K + Send + Sync + 'static> ExtractedKey<K, A, F> {
    pub fn new(extract: F) -> Self {
        ExtractedKey {
            extract,
            _marker: PhantomData,
        }
    }
}
