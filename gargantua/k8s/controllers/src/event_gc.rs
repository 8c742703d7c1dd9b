//! Deletes events once they outlive the retention window.

use crate::{until, Action, Context, Reconcile, Result};
use gargantua_k8s_api::{Event, ResourceId, Store};
use std::time::Duration;
use tracing::trace;

pub const NAME: &str = "event-gc";

const MIN_DELAY: Duration = Duration::from_secs(1);

pub struct EventCollector<S> {
    ctx: Context<S>,
}

impl<S: Store> EventCollector<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for EventCollector<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(event) = store.get_opt::<Event>(&id.namespace, &id.name).await? else {
            return Ok(Action::Done);
        };
        let Some(created) = event.metadata.creation_timestamp.as_ref() else {
            return Ok(Action::Done);
        };

        let age = until(self.ctx.clock.now() - created.0);
        let retention = self.ctx.config.event_retention;
        if age <= retention {
            return Ok(Action::RequeueAfter((retention - age).max(MIN_DELAY)));
        }

        trace!(event = %id, ?age, "Expired");
        match store.delete::<Event>(&id.namespace, &id.name).await {
            Err(error) if !error.is_not_found() => Err(error.into()),
            _ => Ok(Action::Done),
        }
    }
}
