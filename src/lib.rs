//! Synchronous, typed, re-entrancy-safe event dispatch.
//!
//! This crate is a small building block for in-process, observer-pattern
//! style event delivery: register [listeners](Dispatcher::append_listener)
//! against a key, optionally install [filters](Dispatcher::append_filter)
//! that can veto or rewrite a dispatch before listeners see it, and call
//! [`Dispatcher::dispatch`] to fan an event out to every listener for that
//! key, in registration order.
//!
//! It does no I/O, spawns no threads, and queues nothing — it is a registry
//! and a dispatch loop, nothing more. What makes it worth a crate rather
//! than a `Vec<Box<dyn Fn>>` behind a `Mutex` is the concurrency and
//! re-entrancy story: listeners may add or remove other listeners —
//! including themselves — from *within* their own invocation, on the same
//! thread or a different one, without corrupting the list being traversed
//! or double-invoking anyone. See [`Dispatcher`] for the full contract.
//!
//! # Example
//!
//! ```
//! use dispatch_core::Dispatcher;
//!
//! struct Args {
//!     total: i32,
//! }
//!
//! let dispatcher: Dispatcher<&'static str, Args> = Dispatcher::new();
//! dispatcher.append_listener("tick", |args: &mut Args| args.total += 1);
//! dispatcher.append_listener("tick", |args: &mut Args| args.total += 10);
//!
//! let mut args = Args { total: 0 };
//! dispatcher.dispatch("tick", &mut args);
//! assert_eq!(args.total, 11);
//! ```
//!
//! # Key policies
//!
//! A dispatcher is either *direct-key* ([`Dispatcher::new`] — the caller
//! passes the key to `dispatch` explicitly) or *extracted-key*
//! ([`Dispatcher::with_key_extractor`] — the key is computed from the
//! dispatch arguments by a caller-supplied, side-effect-free function). Both
//! share the same listener registry and filter chain machinery underneath;
//! only how the key is obtained differs, and that choice is bound once at
//! construction, never per-dispatch.
//!
//! # What this crate does not do
//!
//! No asynchronous delivery or queuing (build a queue on top of this core if
//! you need one), no cross-process transport, no listener priorities beyond
//! insertion order, no guaranteed delivery if a listener panics (the panic
//! propagates to the dispatch caller — see [`Dispatcher::dispatch`]), no
//! wildcard subscriptions, no persistence.

mod dispatcher;
mod error;
mod filter;
mod key;
mod listener_list;

pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use key::{DirectKey, ExtractedKey};
pub use listener_list::Handle;
