//! Finishes sessions once they expire.
//!
//! One reconciler drives every session kind. A session is revisited when its expiration time
//! passes; if it is not paused past that time, every machine it claimed is tainted and the
//! session is marked finished.

use crate::{
    events::reasons, name_of, retry::retry_on_conflict, taint, until, Action, Context,
    Reconcile, Result,
};
use gargantua_core::timestamp;
use gargantua_k8s_api::{store::Object, EventType, ResourceId, SessionResource, Store};
use std::{marker::PhantomData, time::Duration};
use tracing::{debug, info, trace, warn};

/// How soon to look again when a finished status did not stick.
const VERIFY_RETRY: Duration = Duration::from_secs(1);

pub struct SessionReconciler<S, K> {
    ctx: Context<S>,
    name: String,
    _kind: PhantomData<fn() -> K>,
}

// === impl SessionReconciler ===

impl<S, K> SessionReconciler<S, K>
where
    S: Store,
    K: Object + SessionResource,
{
    /// Names the controller after the kind, e.g. `scenariosession-controller`.
    pub fn new(ctx: Context<S>) -> Self {
        Self {
            ctx,
            name: format!("{}-controller", K::kind(&()).to_lowercase()),
            _kind: PhantomData,
        }
    }

    async fn finish(&self, id: &ResourceId) -> Result<bool> {
        let store = &self.ctx.store;
        retry_on_conflict(|| async move {
            let Some(mut session) = store.get_opt::<K>(&id.namespace, &id.name).await? else {
                return Ok(());
            };
            let status = session.session_status_mut();
            if status.finished && !status.active {
                return Ok(());
            }
            status.finished = true;
            status.active = false;
            store.replace_status(&session).await?;
            Ok(())
        })
        .await?;

        let session = store.get_opt::<K>(&id.namespace, &id.name).await?;
        Ok(session
            .as_ref()
            .and_then(|s| s.session_status())
            .map_or(true, |s| s.finished && !s.active))
    }
}

#[async_trait::async_trait]
impl<S, K> Reconcile for SessionReconciler<S, K>
where
    S: Store,
    K: Object + SessionResource,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(session) = store.get_opt::<K>(&id.namespace, &id.name).await? else {
            return Ok(Action::Done);
        };
        let Some(status) = session.session_status() else {
            debug!(session = %id, "Not started");
            return Ok(Action::Done);
        };

        let expiration = match timestamp::parse(&status.expiration_time) {
            Ok(t) => t,
            Err(error) => {
                warn!(session = %id, %error, "Unparseable expiration time");
                self.ctx
                    .events
                    .publish(
                        &self.name,
                        &session,
                        EventType::Warning,
                        reasons::INVALID_TIME,
                        format!("expirationTime {:?}: {error}", status.expiration_time),
                    )
                    .await;
                return Ok(Action::Done);
            }
        };

        let now = self.ctx.clock.now();
        if expiration > now {
            return Ok(Action::RequeueAfter(until(expiration - now)));
        }

        if status.finished {
            trace!(session = %id, "Already finished");
            return Ok(Action::Done);
        }

        if status.paused {
            if let Some(paused) = status.paused_time.as_deref() {
                match timestamp::parse(paused) {
                    Ok(resume) if resume > now => {
                        debug!(session = %id, %paused, "Paused past expiration");
                        return Ok(Action::Done);
                    }
                    Ok(_) => {}
                    Err(error) => debug!(session = %id, %error, "Ignoring unparseable pause time"),
                }
            }
        }

        for claim in session.claims() {
            if let Err(error) = taint::taint_claim_and_machine(store, &id.namespace, claim).await {
                warn!(session = %id, %claim, %error, "Failed to taint claim");
            }
        }

        if !self.finish(id).await? {
            return Ok(Action::RequeueAfter(VERIFY_RETRY));
        }
        info!(session = %id, "Finished");
        self.ctx
            .events
            .publish(
                &self.name,
                &session,
                EventType::Info,
                reasons::FINISHED,
                format!("{} expired", name_of(&session)),
            )
            .await;
        Ok(Action::Done)
    }
}
