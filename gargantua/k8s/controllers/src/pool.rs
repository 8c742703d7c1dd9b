//! Keeps each machine set provisioned according to its strategy.
//!
//! A set's target is derived from its claimed machines and, for on-demand sets, from the claims
//! waiting for a machine it could provide. The target is further limited by the environment's
//! capacity for the set's template. Tainted machines are reclaimed and never counted. Machines
//! with an active binding are never deleted to scale down.

use crate::{
    events::reasons, labeled, name_of, owner_reference, retry::retry_on_conflict, Action,
    Context, Reconcile, Result,
};
use gargantua_core::{
    configuration,
    pool::{self, BindStrategy, Demand, ProvisioningStrategy},
};
use gargantua_k8s_api::{
    labels, set_condition, ClaimPhase, Environment, EventType, ListParams, Machine, MachineClaim,
    MachineSet, MachineSpec, MachineTemplate, ObjectMeta, ResourceId, Store,
};
use std::time::Duration;
use tracing::{debug, info};

pub const NAME: &str = "pool-reconciler";

/// The condition reporting whether a set holds its target count.
pub const DESIRED_COUNT: &str = "DesiredCount";

/// How often an on-demand set with waiting claims is revisited.
const PENDING_RESYNC: Duration = Duration::from_secs(10);

const CREATE_ATTEMPTS: usize = 3;

pub struct PoolReconciler<S> {
    ctx: Context<S>,
}

struct Outcome {
    provisioned: u32,
    available: u32,
    ok: bool,
    reason: &'static str,
    message: String,
}

// === impl PoolReconciler ===

impl<S: Store> PoolReconciler<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    /// Counts requested claims this set could serve.
    async fn pending_claims(&self, set: &MachineSet) -> Result<u32> {
        let namespace = set.metadata.namespace.as_deref().unwrap_or_default();
        let claims = self
            .ctx
            .store
            .list::<MachineClaim>(namespace, &ListParams::default())
            .await?;
        let pending = claims
            .iter()
            .filter(|c| c.phase() == ClaimPhase::Requested && set.serves(c))
            .filter(|c| {
                c.spec.bind_strategy != BindStrategy::RequireMachineSets
                    || c.spec.machine_sets.iter().any(|s| s == name_of(set))
            })
            .count();
        Ok(pending as u32)
    }

    /// Counts live machines of the set's template that other sets hold in its environment.
    async fn provisioned_elsewhere(&self, set: &MachineSet) -> Result<u32> {
        let namespace = set.metadata.namespace.as_deref().unwrap_or_default();
        let selector = format!(
            "{},{}",
            labels::selector(labels::ENVIRONMENT, &set.spec.environment),
            labels::selector(labels::MACHINE_TEMPLATE, &set.spec.machine_template),
        );
        let machines = self
            .ctx
            .store
            .list::<Machine>(namespace, &ListParams::default().labels(&selector))
            .await?;
        let count = machines
            .iter()
            .filter(|m| m.spec.machine_set != name_of(set))
            .filter(|m| !m.is_tainted() && m.metadata.deletion_timestamp.is_none())
            .count();
        Ok(count as u32)
    }

    /// Builds the machine this set provisions, merging configuration from the template, the
    /// environment, and the set, in increasing precedence.
    fn machine_for(
        set: &MachineSet,
        template: Option<&MachineTemplate>,
        environment: Option<&Environment>,
    ) -> Result<Machine> {
        let spec = &set.spec;
        let configuration = configuration::merge([
            template.and_then(|t| t.spec.provider_configuration.get(&spec.provider)),
            environment.map(|e| &e.spec.provider_configuration),
            environment.and_then(|e| e.spec.template_configuration.get(&spec.machine_template)),
            Some(&spec.configuration),
        ]);

        let prefix = spec
            .machine_name_prefix
            .clone()
            .or_else(|| template.and_then(|t| t.spec.machine_name_prefix.clone()))
            .unwrap_or_else(|| name_of(set).to_string());

        let mut machine_labels = labels::Map::from([
            (labels::MACHINE_SET.to_string(), name_of(set).to_string()),
            (labels::MACHINE_TEMPLATE.to_string(), spec.machine_template.clone()),
            (labels::ENVIRONMENT.to_string(), spec.environment.clone()),
        ]);
        if let Some(event) = spec.scheduled_event.as_ref() {
            machine_labels.insert(labels::SCHEDULED_EVENT.to_string(), event.clone());
        }

        Ok(Machine {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}-")),
                namespace: set.metadata.namespace.clone(),
                labels: Some(machine_labels),
                owner_references: Some(vec![owner_reference(set)?]),
                ..Default::default()
            },
            spec: MachineSpec {
                machine_set: name_of(set).to_string(),
                machine_template: spec.machine_template.clone(),
                environment: spec.environment.clone(),
                provider: spec.provider.clone(),
                configuration,
            },
            status: None,
        })
    }

    async fn create_machine(&self, namespace: &str, machine: &Machine) -> Result<Machine> {
        let mut attempt = 1;
        loop {
            match self.ctx.store.create(namespace, machine).await {
                Err(error) if error.is_already_exists() && attempt < CREATE_ATTEMPTS => {
                    debug!(%error, "Generated name collided");
                    attempt += 1;
                }
                result => return Ok(result?),
            }
        }
    }

    async fn delete_machine(&self, machine: &Machine) -> Result<()> {
        let namespace = machine.metadata.namespace.as_deref().unwrap_or_default();
        match self.ctx.store.delete::<Machine>(namespace, name_of(machine)).await {
            Err(error) if !error.is_not_found() => Err(error.into()),
            _ => Ok(()),
        }
    }

    async fn write_status(&self, id: &ResourceId, outcome: &Outcome) -> Result<()> {
        let store = &self.ctx.store;
        let now = self.ctx.clock.now();
        retry_on_conflict(|| async move {
            let Some(mut set) = store.get_opt::<MachineSet>(&id.namespace, &id.name).await? else {
                return Ok(());
            };
            let status = set.status.get_or_insert_with(Default::default);
            let mut changed =
                status.provisioned != outcome.provisioned || status.available != outcome.available;
            status.provisioned = outcome.provisioned;
            status.available = outcome.available;
            changed |= set_condition(
                &mut status.conditions,
                DESIRED_COUNT,
                outcome.ok,
                outcome.reason,
                outcome.message.as_str(),
                now,
            );
            if changed {
                store.replace_status(&set).await?;
            }
            Ok(())
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for PoolReconciler<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(set) = store.get_opt::<MachineSet>(&id.namespace, &id.name).await? else {
            return Ok(Action::Done);
        };
        if set.metadata.deletion_timestamp.is_some() {
            return Ok(Action::Done);
        }
        let spec = &set.spec;

        let owned = store
            .list::<Machine>(&id.namespace, &labeled(labels::MACHINE_SET, &id.name))
            .await?;
        let (tainted, mut live): (Vec<_>, Vec<_>) = owned
            .into_iter()
            .filter(|m| m.metadata.deletion_timestamp.is_none())
            .partition(Machine::is_tainted);
        for machine in &tainted {
            self.delete_machine(machine).await?;
            self.ctx
                .events
                .publish(NAME, &set, EventType::Info, reasons::RECLAIMED, name_of(machine))
                .await;
        }

        let claimed = live.iter().filter(|m| m.claim().is_some()).count() as u32;
        let pending = match spec.provisioning_strategy {
            ProvisioningStrategy::OnDemand => self.pending_claims(&set).await?,
            ProvisioningStrategy::AutoScale => 0,
        };
        let mut target = pool::target_count(
            spec.provisioning_strategy,
            Demand { claimed, pending },
            spec.min_available,
            spec.max_provisioned,
        );

        let environment = store
            .get_opt::<Environment>(&id.namespace, &spec.environment)
            .await?;
        let capacity = environment
            .as_ref()
            .and_then(|e| e.spec.template_capacity.get(&spec.machine_template))
            .copied();
        let mut exhausted = None;
        if let Some(capacity) = capacity {
            let allowed = capacity.saturating_sub(self.provisioned_elsewhere(&set).await?);
            if target > allowed {
                exhausted = Some(format!(
                    "environment {} has capacity for {allowed} more {} machines",
                    spec.environment, spec.machine_template
                ));
                target = allowed;
            }
        }

        let provisioned = live.len() as u32;
        let mut cannot_scale_down = None;
        if provisioned < target {
            let template = store
                .get_opt::<MachineTemplate>(&id.namespace, &spec.machine_template)
                .await?;
            let machine = Self::machine_for(&set, template.as_ref(), environment.as_ref())?;
            for _ in provisioned..target {
                match self.create_machine(&id.namespace, &machine).await {
                    Ok(created) => live.push(created),
                    Err(error) => {
                        self.ctx
                            .events
                            .publish(
                                NAME,
                                &set,
                                EventType::Warning,
                                reasons::CREATE_FAILED,
                                error.to_string(),
                            )
                            .await;
                        return Err(error);
                    }
                }
            }
            info!(set = %id, from = provisioned, to = target, "Scaled up");
            self.ctx
                .events
                .publish(
                    NAME,
                    &set,
                    EventType::Info,
                    reasons::SCALED_UP,
                    format!("scaled from {provisioned} to {target} machines"),
                )
                .await;
        } else if provisioned > target {
            let surplus = (provisioned - target) as usize;
            let mut idle = live
                .iter()
                .filter(|m| m.claim().is_none())
                .map(|m| name_of(m).to_string())
                .collect::<Vec<_>>();
            idle.sort();
            idle.truncate(surplus);
            for name in &idle {
                match store.delete::<Machine>(&id.namespace, name).await {
                    Err(error) if !error.is_not_found() => return Err(error.into()),
                    _ => {}
                }
            }
            live.retain(|m| !idle.iter().any(|n| n == name_of(m)));

            if !idle.is_empty() {
                info!(set = %id, deleted = idle.len(), "Scaled down");
                self.ctx
                    .events
                    .publish(
                        NAME,
                        &set,
                        EventType::Info,
                        reasons::SCALED_DOWN,
                        format!("deleted {} unclaimed machines", idle.len()),
                    )
                    .await;
            }
            if idle.len() < surplus {
                let message = format!(
                    "{} machines are claimed; cannot scale down to {target}",
                    claimed
                );
                self.ctx
                    .events
                    .publish(
                        NAME,
                        &set,
                        EventType::Warning,
                        reasons::CANNOT_SCALE_DOWN,
                        message.as_str(),
                    )
                    .await;
                cannot_scale_down = Some(message);
            }
        }

        let (ok, reason, message) = match (exhausted, cannot_scale_down) {
            (Some(message), _) => (false, reasons::CAPACITY_EXHAUSTED, message),
            (None, Some(message)) => (false, reasons::CANNOT_SCALE_DOWN, message),
            (None, None) => (true, "Scaled", String::new()),
        };
        let outcome = Outcome {
            provisioned: live.len() as u32,
            available: live.iter().filter(|m| m.claim().is_none()).count() as u32,
            ok,
            reason,
            message,
        };
        self.write_status(id, &outcome).await?;

        if pending > 0 {
            return Ok(Action::RequeueAfter(PENDING_RESYNC));
        }
        Ok(Action::Done)
    }
}
