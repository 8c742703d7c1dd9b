//! Gargantua controllers
//!
//! Each controller reconciles one kind toward the state its spec describes. Controllers read and
//! write only through a [`Store`], never call one another, and converge through the objects they
//! write: a claim binder marks a machine claimed, which the pool reconciler observes as demand.
//!
//! Watches feed keys into a per-controller [`WorkQueue`] through [`Enqueue`]; a [`Runner`]
//! processes them with a bounded number of workers while this replica holds the leader lease.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binder;
pub mod code_roles;
mod config;
mod demand;
pub mod enqueue;
mod error;
pub mod event_gc;
pub mod events;
mod metrics;
pub mod otac;
pub mod pool;
mod queue;
pub mod retry;
mod runner;
pub mod scheduled_event;
pub mod taint;
pub mod temporal;
pub mod user_bindings;


pub use self::{
    config::Config,
    demand::ClaimDemand,
    enqueue::Enqueue,
    error::{Error, Result},
    events::Recorder,
    metrics::ControllerMetrics,
    queue::WorkQueue,
    runner::{Action, Reconcile, Runner},
};
use gargantua_core::SharedClock;
use gargantua_k8s_api::{
    labels,
    store::{Object, Store},
    ListParams, OwnerReference, Resource,
};
use std::{sync::Arc, time::Duration};

/// The dependencies every reconciler shares.
#[derive(Clone)]
pub struct Context<S> {
    pub store: S,
    pub clock: SharedClock,
    pub events: Recorder<S>,
    pub config: Arc<Config>,
}

// === impl Context ===

impl<S: Store> Context<S> {
    pub fn new(store: S, clock: SharedClock, config: Config) -> Self {
        let events = Recorder::new(store.clone(), clock.clone(), config.instance.clone());
        Self {
            store,
            clock,
            events,
            config: Arc::new(config),
        }
    }
}

/// Lists objects carrying `key=value`.
pub(crate) fn labeled(key: &str, value: &str) -> ListParams {
    ListParams::default().labels(&labels::selector(key, value))
}

/// References `owner` as the controller of a dependent.
pub(crate) fn owner_reference<K: Object>(owner: &K) -> Result<OwnerReference> {
    owner.controller_owner_ref(&()).ok_or_else(|| {
        Error::invariant(format!(
            "{} {} has no uid",
            K::kind(&()),
            owner.meta().name.as_deref().unwrap_or_default()
        ))
    })
}

/// Converts a non-negative time delta into a requeue delay.
pub(crate) fn until(delta: chrono::Duration) -> Duration {
    delta.to_std().unwrap_or_default()
}

pub(crate) fn name_of<K: Resource>(object: &K) -> &str {
    object.meta().name.as_deref().unwrap_or_default()
}
