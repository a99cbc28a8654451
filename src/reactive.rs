//! Change bridge between `yrs` values and a host's reactive computations.
//!
//! A [`ScopedObservation`] holds at most one observer registration. Each
//! `run` is one execution of the host's computation: the previous
//! registration is released before the new value (if any) is observed.
//! Invalidating or dropping the scope releases it for good. Payloads reach
//! the observer untouched.
//!
//! ```rust,no_run
//! use docsync::reactive::observe_yjs;
//! use yrs::{Doc, TextRef};
//!
//! let doc = Doc::new();
//! let title = doc.get_or_insert_text("title");
//! let mut scope = observe_yjs::<TextRef, _>(|_txn, _event| {
//!     println!("title changed");
//! });
//! scope.run(Some(&title));
//! // a later run with another value, or with None, releases this one
//! scope.run(None);
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;
use yrs::types::array::ArrayEvent;
use yrs::types::map::MapEvent;
use yrs::types::text::TextEvent;
use yrs::types::Events;
use yrs::{ArrayRef, DeepObservable, MapRef, Observable, Subscription, TextRef, TransactionMut};

/// Values whose own (non-nested) changes can be observed
pub trait ShallowObservable {
    type Event;

    fn observe_shallow<F>(&self, f: F) -> Subscription
    where
        F: Fn(&TransactionMut, &Self::Event) + Send + Sync + 'static;
}

macro_rules! shallow_observable {
    ($($ty:ty => $event:ty),* $(,)?) => {
        $(
            impl ShallowObservable for $ty {
                type Event = $event;

                fn observe_shallow<F>(&self, f: F) -> Subscription
                where
                    F: Fn(&TransactionMut, &Self::Event) + Send + Sync + 'static,
                {
                    self.observe(f)
                }
            }
        )*
    };
}

shallow_observable! {
    TextRef => TextEvent,
    ArrayRef => ArrayEvent,
    MapRef => MapEvent,
}

type Register<V> = Box<dyn Fn(&V) -> Subscription + Send + Sync>;

/// At most one live observer registration, tied to a reactive scope
pub struct ScopedObservation<V> {
    register: Register<V>,
    active: Option<Subscription>,
}

impl<V: 'static> ScopedObservation<V> {
    /// Scope that registers through `register`; the returned subscription is
    /// released on the next run, on invalidation or on drop.
    pub fn new<R>(register: R) -> Self
    where
        R: Fn(&V) -> Subscription + Send + Sync + 'static,
    {
        Self {
            register: Box::new(register),
            active: None,
        }
    }

    /// One execution of the computation with the current reference
    pub fn run(&mut self, value: Option<&V>) {
        self.invalidate();
        if let Some(value) = value {
            self.active = Some((self.register)(value));
        }
    }

    /// Release the current registration, if any
    pub fn invalidate(&mut self) {
        if self.active.take().is_some() {
            trace!("observer released");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl<V> Drop for ScopedObservation<V> {
    fn drop(&mut self) {
        self.active.take();
    }
}

/// Observe shallow changes of whatever value the scope is run with
pub fn observe_yjs<V, F>(observer: F) -> ScopedObservation<V>
where
    V: ShallowObservable + 'static,
    F: Fn(&TransactionMut, &V::Event) + Send + Sync + 'static,
{
    let observer = Arc::new(observer);
    ScopedObservation::new(move |value: &V| {
        let observer = observer.clone();
        value.observe_shallow(move |txn, event| (*observer)(txn, event))
    })
}

/// Observe every change in the subtree of whatever value the scope is run with
pub fn observe_yjs_deep<V, F>(observer: F) -> ScopedObservation<V>
where
    V: DeepObservable + 'static,
    F: Fn(&TransactionMut, &Events) + Send + Sync + 'static,
{
    let observer = Arc::new(observer);
    ScopedObservation::new(move |value: &V| {
        let observer = observer.clone();
        value.observe_deep(move |txn, events| (*observer)(txn, events))
    })
}

/// A scope driven by a `watch` channel; aborted when dropped
pub struct WatchBinding {
    task: JoinHandle<()>,
}

impl WatchBinding {
    /// True once the sender side is gone and the registration released
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchBinding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Rerun `scope` every time the watched reference changes.
///
/// The registration is released when the sender is dropped or when the
/// returned binding is dropped.
pub fn bind_watch<V>(
    mut scope: ScopedObservation<V>,
    mut reference: watch::Receiver<Option<V>>,
) -> WatchBinding
where
    V: Clone + Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        loop {
            let current = reference.borrow_and_update().clone();
            scope.run(current.as_ref());
            drop(current);
            if reference.changed().await.is_err() {
                break;
            }
        }
        scope.invalidate();
    });
    WatchBinding { task }
}
