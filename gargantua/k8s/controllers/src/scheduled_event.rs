//! Drives scheduled events through their provisioning window.
//!
//! At the provisioning start the event's machine sets and access code are created. The event
//! becomes active at its start time and ready once its sets hold the requested machines. At the
//! end time the access code is withdrawn and the expiration strategy is applied to the sets.

use crate::{
    events::reasons, labeled, name_of, owner_reference, retry::retry_on_conflict, taint, until,
    Action, Context, Error, Reconcile, Result,
};
use chrono::{DateTime, Utc};
use gargantua_core::pool::ProvisioningStrategy;
use gargantua_k8s_api::{
    labels, set_condition, AccessCode, AccessCodeSpec, AccessGrants, Availability, Environment,
    EventType, ExpirationStrategy, ListParams, MachineClaim, MachineSet, MachineSetSpec,
    ObjectMeta, ResourceId, ScheduledEvent, ScheduledEventSpec, ScheduledEventStatus, Store,
    Validity,
};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const NAME: &str = "scheduledevent-controller";

/// The condition reporting whether the event's schedule could be interpreted.
pub const SCHEDULED: &str = "Scheduled";

/// How often a provisioned event that is not yet ready is revisited.
const READY_POLL: Duration = Duration::from_secs(30);

pub struct ScheduledEventReconciler<S> {
    ctx: Context<S>,
}

struct Window {
    provisioning_start: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

// === impl ScheduledEventReconciler ===

impl<S: Store> ScheduledEventReconciler<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    async fn update_status<F>(&self, id: &ResourceId, update: F) -> Result<()>
    where
        F: Fn(&mut ScheduledEventStatus) + Send + Sync,
    {
        let store = &self.ctx.store;
        let update = &update;
        retry_on_conflict(|| async move {
            let Some(mut event) = store
                .get_opt::<ScheduledEvent>(&id.namespace, &id.name)
                .await?
            else {
                return Ok(());
            };
            let before = event.status.clone();
            update(event.status.get_or_insert_with(Default::default));
            if event.status != before {
                store.replace_status(&event).await?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Creates the event's machine sets and access code. Returns the names of the sets, or
    /// `None` if an environment the event requires does not exist yet.
    async fn provision(
        &self,
        event: &ScheduledEvent,
        window: &Window,
    ) -> Result<Option<Vec<String>>> {
        let store = &self.ctx.store;
        let namespace = event.metadata.namespace.as_deref().unwrap_or_default();
        let name = name_of(event);
        let owner = owner_reference(event)?;

        let mut sets = Vec::new();
        for (environment, templates) in &event.spec.required_machines {
            let Some(env) = store.get_opt::<Environment>(namespace, environment).await? else {
                debug!(event = %name, %environment, "Environment not found");
                return Ok(None);
            };
            for (template, count) in templates {
                let set_name = ScheduledEventSpec::machine_set_name(name, environment, template);
                let (strategy, min_available) = if event.spec.on_demand {
                    (ProvisioningStrategy::OnDemand, 0)
                } else {
                    (ProvisioningStrategy::AutoScale, *count)
                };
                let set = MachineSet {
                    metadata: ObjectMeta {
                        name: Some(set_name.clone()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(labels::Map::from([(
                            labels::SCHEDULED_EVENT.to_string(),
                            name.to_string(),
                        )])),
                        owner_references: Some(vec![owner.clone()]),
                        ..Default::default()
                    },
                    spec: MachineSetSpec {
                        availability: Availability::ScheduledEvent,
                        provisioning_strategy: strategy,
                        max_provisioned: *count,
                        min_available,
                        provider: env.spec.provider.clone(),
                        environment: environment.clone(),
                        machine_template: template.clone(),
                        scheduled_event: Some(name.to_string()),
                        ..Default::default()
                    },
                    status: None,
                };
                match store.create(namespace, &set).await {
                    Err(error) if !error.is_already_exists() => return Err(error.into()),
                    _ => {}
                }
                sets.push(set_name);
            }
        }

        let code = AccessCode {
            metadata: ObjectMeta {
                name: Some(event.spec.access_code.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels::Map::from([(
                    labels::SCHEDULED_EVENT.to_string(),
                    name.to_string(),
                )])),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: AccessCodeSpec {
                grants: AccessGrants {
                    scenarios: event.spec.scenarios.clone(),
                    courses: event.spec.courses.clone(),
                    scheduled_events: vec![name.to_string()],
                    machine_sets: sets.clone(),
                },
                validity: Validity {
                    not_before: Some(window.start),
                    not_after: Some(window.end),
                },
            },
            status: None,
        };
        self.apply_access_code(namespace, name, &code).await?;
        Ok(Some(sets))
    }

    async fn apply_access_code(&self, namespace: &str, event: &str, code: &AccessCode) -> Result<()> {
        let store = &self.ctx.store;
        let code_name = name_of(code);
        let Some(existing) = store.get_opt::<AccessCode>(namespace, code_name).await? else {
            store.create(namespace, code).await?;
            return Ok(());
        };
        if labels::get(&existing.metadata, labels::SCHEDULED_EVENT) != Some(event) {
            return Err(Error::invariant(format!(
                "access code {code_name} is not managed by scheduled event {event}"
            )));
        }

        let spec = &code.spec;
        retry_on_conflict(|| async move {
            let Some(mut existing) = store.get_opt::<AccessCode>(namespace, code_name).await?
            else {
                return Ok(());
            };
            if existing.spec != *spec {
                existing.spec = spec.clone();
                store.replace(&existing).await?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Reports whether every set holds the machines the event requires.
    async fn is_ready(&self, event: &ScheduledEvent) -> Result<bool> {
        if event.spec.on_demand {
            return Ok(true);
        }
        let namespace = event.metadata.namespace.as_deref().unwrap_or_default();
        let name = name_of(event);
        for (environment, templates) in &event.spec.required_machines {
            for (template, count) in templates {
                let set_name = ScheduledEventSpec::machine_set_name(name, environment, template);
                let available = self
                    .ctx
                    .store
                    .get_opt::<MachineSet>(namespace, &set_name)
                    .await?
                    .and_then(|s| s.status)
                    .map_or(0, |s| s.available);
                if available < *count {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Withdraws the event's access code and applies its expiration strategy.
    async fn expire(&self, event: &ScheduledEvent) -> Result<()> {
        let store = &self.ctx.store;
        let namespace = event.metadata.namespace.as_deref().unwrap_or_default();
        let name = name_of(event);

        if let Some(code) = store
            .get_opt::<AccessCode>(namespace, &event.spec.access_code)
            .await?
        {
            if labels::get(&code.metadata, labels::SCHEDULED_EVENT) == Some(name) {
                match store.delete::<AccessCode>(namespace, name_of(&code)).await {
                    Err(error) if !error.is_not_found() => return Err(error.into()),
                    _ => {}
                }
            }
        }

        match event.spec.expiration_strategy {
            ExpirationStrategy::CutOff => {
                let claims = store
                    .list::<MachineClaim>(namespace, &ListParams::default())
                    .await?;
                for claim in claims.iter().filter(|c| {
                    c.spec.scheduled_event.as_deref() == Some(name)
                        || labels::get(&c.metadata, labels::SCHEDULED_EVENT) == Some(name)
                }) {
                    let claim = name_of(claim);
                    if let Err(error) = taint::taint_claim_and_machine(store, namespace, claim).await
                    {
                        warn!(event = %name, %claim, %error, "Failed to taint claim");
                    }
                }
                let deleted = store
                    .delete_collection::<MachineSet>(
                        namespace,
                        &labeled(labels::SCHEDULED_EVENT, name),
                    )
                    .await?;
                debug!(event = %name, deleted, "Deleted machine sets");
            }
            ExpirationStrategy::Soft => {
                let sets = store
                    .list::<MachineSet>(namespace, &labeled(labels::SCHEDULED_EVENT, name))
                    .await?;
                for set in &sets {
                    let set_name = name_of(set);
                    retry_on_conflict(|| async move {
                        let Some(mut set) = store.get_opt::<MachineSet>(namespace, set_name).await?
                        else {
                            return Ok(());
                        };
                        if set.spec.min_available != 0 {
                            set.spec.min_available = 0;
                            store.replace(&set).await?;
                        }
                        Ok(())
                    })
                    .await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for ScheduledEventReconciler<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(event) = store
            .get_opt::<ScheduledEvent>(&id.namespace, &id.name)
            .await?
        else {
            return Ok(Action::Done);
        };
        if event.metadata.deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }
        let now = self.ctx.clock.now();

        let window = match (
            event.spec.provisioning_start(),
            event.spec.start(),
            event.spec.end(),
        ) {
            (Ok(provisioning_start), Ok(start), Ok(end)) => Window {
                provisioning_start,
                start,
                end,
            },
            (Err(error), _, _) | (_, Err(error), _) | (_, _, Err(error)) => {
                let message = error.to_string();
                self.update_status(id, |status| {
                    set_condition(
                        &mut status.conditions,
                        SCHEDULED,
                        false,
                        reasons::INVALID_TIME,
                        message.as_str(),
                        now,
                    );
                })
                .await?;
                self.ctx
                    .events
                    .publish(
                        NAME,
                        &event,
                        EventType::Warning,
                        reasons::INVALID_TIME,
                        message.as_str(),
                    )
                    .await;
                return Err(Error::invariant(format!("scheduled event {id}: {message}")));
            }
        };

        let status = event.status.clone().unwrap_or_default();
        if status.finished {
            return Ok(Action::Done);
        }

        if now >= window.end {
            self.expire(&event).await?;
            self.update_status(id, |status| {
                status.finished = true;
                status.active = false;
                status.ready = false;
            })
            .await?;
            info!(event = %id, "Finished");
            self.ctx
                .events
                .publish(NAME, &event, EventType::Info, reasons::FINISHED, "")
                .await;
            return Ok(Action::Done);
        }

        let mut provisioned = status.provisioned;
        let mut machine_sets = status.machine_sets.clone();
        if now >= window.provisioning_start && !provisioned {
            match self.provision(&event, &window).await? {
                Some(sets) => {
                    info!(event = %id, sets = sets.len(), "Provisioned");
                    self.ctx
                        .events
                        .publish(
                            NAME,
                            &event,
                            EventType::Info,
                            reasons::PROVISIONED,
                            sets.join(", "),
                        )
                        .await;
                    machine_sets = sets;
                    provisioned = true;
                }
                None => return Ok(Action::RequeueAfter(READY_POLL)),
            }
        }

        let active = now >= window.start;
        let ready = provisioned && self.is_ready(&event).await?;
        self.update_status(id, |status| {
            status.machine_sets = machine_sets.clone();
            status.provisioned = provisioned;
            status.active = active;
            status.ready = ready;
            set_condition(&mut status.conditions, SCHEDULED, true, "Valid", "", now);
        })
        .await?;

        let next = [window.provisioning_start, window.start, window.end]
            .into_iter()
            .filter(|t| *t > now)
            .min()
            .map(|t| until(t - now));
        let next = match next {
            Some(next) if provisioned && !ready => next.min(READY_POLL),
            Some(next) => next,
            None => READY_POLL,
        };
        Ok(Action::RequeueAfter(next))
    }
}
