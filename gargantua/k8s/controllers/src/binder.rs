//! Binds requested claims to available machines.
//!
//! A claim is bound by writing its name to a machine's status, preconditioned on the machine's
//! resource version, so two claims racing for one machine cannot both win. The loser retries
//! against a fresh candidate list. A claim that finds no candidate within the claim timeout
//! fails; a claim terminated by its owner, or deleted outright, releases and taints its machine.

use crate::{
    events::reasons, name_of, retry::retry_on_conflict, taint, until, Action, Context,
    Reconcile, Result,
};
use gargantua_core::pool;
use gargantua_k8s_api::{
    labels, ClaimPhase, EventType, ListParams, Machine, MachineClaim, MachineSet, ResourceId,
    Store,
};
use std::{collections::HashSet, time::Duration};
use tracing::{debug, info};

pub const NAME: &str = "claim-binder";

const BIND_ATTEMPTS: usize = 5;

/// How often a waiting claim looks for a machine again.
const PENDING_RETRY: Duration = Duration::from_secs(5);

pub struct ClaimBinder<S> {
    ctx: Context<S>,
}

// === impl ClaimBinder ===

impl<S: Store> ClaimBinder<S> {
    pub fn new(ctx: Context<S>) -> Self {
        Self { ctx }
    }

    /// Lists available machines that may serve the claim, best candidate first.
    async fn candidates(&self, claim: &MachineClaim) -> Result<Vec<Machine>> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        let sets = self
            .ctx
            .store
            .list::<MachineSet>(namespace, &ListParams::default())
            .await?;
        let serving = sets
            .iter()
            .filter(|s| s.serves(claim))
            .map(|s| name_of(s))
            .collect::<HashSet<_>>();
        if serving.is_empty() {
            return Ok(Vec::new());
        }

        let machines = self
            .ctx
            .store
            .list::<Machine>(
                namespace,
                &ListParams::default().labels(&labels::selector(
                    labels::MACHINE_TEMPLATE,
                    &claim.spec.machine_template,
                )),
            )
            .await?;
        let available = machines
            .into_iter()
            .filter(|m| m.is_available() && serving.contains(m.spec.machine_set.as_str()))
            .collect::<Vec<_>>();

        Ok(pool::rank_candidates(
            claim.spec.bind_strategy,
            &claim.spec.machine_sets,
            available,
            |m| (name_of(m), m.spec.machine_set.as_str()),
        ))
    }

    /// Finds a machine already claimed for this claim by an earlier, interrupted bind.
    async fn claimed_machine(&self, claim: &MachineClaim) -> Result<Option<Machine>> {
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        let machines = self
            .ctx
            .store
            .list::<Machine>(
                namespace,
                &ListParams::default().labels(&labels::selector(
                    labels::MACHINE_TEMPLATE,
                    &claim.spec.machine_template,
                )),
            )
            .await?;
        Ok(machines
            .into_iter()
            .find(|m| m.claim() == Some(name_of(claim)) && !m.is_tainted()))
    }

    /// Atomically marks the machine as claimed. Returns false if another writer got there first.
    async fn claim_machine(&self, mut machine: Machine, claim: &str) -> Result<bool> {
        machine.status.get_or_insert_with(Default::default).claim = Some(claim.to_string());
        match self.ctx.store.replace_status(&machine).await {
            Ok(_) => Ok(true),
            Err(error) if error.is_conflict() || error.is_not_found() => {
                debug!(machine = %name_of(&machine), %error, "Lost bind race");
                Ok(false)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Taints machines still held by a claim that has been deleted.
    async fn release(&self, id: &ResourceId) -> Result<()> {
        let store = &self.ctx.store;
        let machines = store
            .list::<Machine>(&id.namespace, &ListParams::default())
            .await?;
        for machine in machines
            .iter()
            .filter(|m| m.claim() == Some(id.name.as_str()) && !m.is_tainted())
        {
            let name = name_of(machine);
            if taint::taint_machine(store, &id.namespace, name).await? {
                info!(claim = %id, machine = %name, "Released machine of deleted claim");
            }
        }
        Ok(())
    }

    async fn set_phase(
        &self,
        id: &ResourceId,
        phase: ClaimPhase,
        machine: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        let store = &self.ctx.store;
        retry_on_conflict(|| async move {
            let Some(mut claim) = store.get_opt::<MachineClaim>(&id.namespace, &id.name).await?
            else {
                return Ok(());
            };
            let status = claim.status.get_or_insert_with(Default::default);
            status.phase = phase;
            status.machine = machine.map(str::to_string);
            status.reason = reason.map(str::to_string);
            store.replace_status(&claim).await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn bind(&self, id: &ResourceId, claim: &MachineClaim) -> Result<Action> {
        if let Some(machine) = self.claimed_machine(claim).await? {
            self.bound(id, claim, name_of(&machine)).await?;
            return Ok(Action::Done);
        }

        for attempt in 1..=BIND_ATTEMPTS {
            let candidates = self.candidates(claim).await?;
            let Some(machine) = candidates.into_iter().next() else {
                return self.wait(id, claim).await;
            };
            let name = name_of(&machine).to_string();
            if self.claim_machine(machine, &id.name).await? {
                self.bound(id, claim, &name).await?;
                return Ok(Action::Done);
            }
            debug!(claim = %id, attempt, "Retrying bind");
        }
        Ok(Action::RequeueAfter(PENDING_RETRY))
    }

    async fn bound(&self, id: &ResourceId, claim: &MachineClaim, machine: &str) -> Result<()> {
        self.set_phase(id, ClaimPhase::Bound, Some(machine), None)
            .await?;
        info!(claim = %id, %machine, "Bound");
        self.ctx
            .events
            .publish(NAME, claim, EventType::Info, reasons::BOUND, machine)
            .await;
        Ok(())
    }

    /// Fails the claim once it has waited out the claim timeout; otherwise checks again later.
    async fn wait(&self, id: &ResourceId, claim: &MachineClaim) -> Result<Action> {
        let timeout = self.ctx.config.claim_timeout;
        let created = claim
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(|| self.ctx.clock.now());
        let age = until(self.ctx.clock.now() - created);
        if age < timeout {
            return Ok(Action::RequeueAfter(PENDING_RETRY.min(timeout - age)));
        }

        let reason = format!(
            "no {} machine became available within {}s",
            claim.spec.machine_template,
            timeout.as_secs()
        );
        self.set_phase(id, ClaimPhase::Failed, None, Some(&reason))
            .await?;
        info!(claim = %id, "Failed to bind");
        self.ctx
            .events
            .publish(NAME, claim, EventType::Warning, reasons::BIND_TIMEOUT, reason)
            .await;
        Ok(Action::Done)
    }
}

#[async_trait::async_trait]
impl<S: Store> Reconcile for ClaimBinder<S> {
    fn name(&self) -> &str {
        NAME
    }

    async fn reconcile(&self, id: &ResourceId) -> Result<Action> {
        let store = &self.ctx.store;
        let Some(claim) = store
            .get_opt::<MachineClaim>(&id.namespace, &id.name)
            .await?
        else {
            self.release(id).await?;
            return Ok(Action::Done);
        };

        match claim.phase() {
            ClaimPhase::Requested => self.bind(id, &claim).await,
            ClaimPhase::Terminated => {
                // Terminated claims are never rebound. Their machine is released once.
                let tainted = claim.status.as_ref().is_some_and(|s| s.tainted);
                if !tainted {
                    taint::taint_claim_and_machine(store, &id.namespace, &id.name).await?;
                    self.ctx
                        .events
                        .publish(
                            NAME,
                            &claim,
                            EventType::Info,
                            reasons::RELEASED,
                            claim.machine().unwrap_or_default(),
                        )
                        .await;
                }
                Ok(Action::Done)
            }
            ClaimPhase::Bound | ClaimPhase::Failed => Ok(Action::Done),
        }
    }
}
