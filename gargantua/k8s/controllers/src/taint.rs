//! Marks machines and claims as no longer usable.
//!
//! A tainted machine carries the label `ready=false` and `status.tainted`; the binder skips it
//! and the pool reconciler reclaims it. A tainted claim is terminated.

use crate::{retry::retry_on_conflict, Result};
use gargantua_k8s_api::{labels, store, ClaimPhase, Machine, MachineClaim, Store};
use tracing::debug;

/// Taints a machine. Returns false if it no longer exists.
pub async fn taint_machine<S: Store>(store: &S, namespace: &str, name: &str) -> Result<bool> {
    let tainted = retry_on_conflict(|| async move {
        let Some(mut machine) = store.get_opt::<Machine>(namespace, name).await? else {
            return Ok(false);
        };

        if labels::get(&machine.metadata, labels::READY) != Some("false") {
            machine
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(labels::READY.to_string(), "false".to_string());
            machine = store.replace(&machine).await?;
        }

        let status = machine.status.get_or_insert_with(Default::default);
        if !status.tainted {
            status.tainted = true;
            store.replace_status(&machine).await?;
        }
        Ok(true)
    })
    .await;
    Ok(ignore_not_found(tainted)?)
}

/// Taints a claim, terminating it if it was bound. Returns false if it no longer exists.
pub async fn taint_claim<S: Store>(store: &S, namespace: &str, name: &str) -> Result<bool> {
    let tainted = retry_on_conflict(|| async move {
        let Some(mut claim) = store.get_opt::<MachineClaim>(namespace, name).await? else {
            return Ok(false);
        };
        let status = claim.status.get_or_insert_with(Default::default);
        if status.tainted && status.phase != ClaimPhase::Bound {
            return Ok(true);
        }
        status.tainted = true;
        if status.phase == ClaimPhase::Bound {
            status.phase = ClaimPhase::Terminated;
        }
        store.replace_status(&claim).await?;
        Ok(true)
    })
    .await;
    Ok(ignore_not_found(tainted)?)
}

/// Taints a claim and the machine bound to it.
pub async fn taint_claim_and_machine<S: Store>(
    store: &S,
    namespace: &str,
    claim: &str,
) -> Result<()> {
    let Some(found) = store.get_opt::<MachineClaim>(namespace, claim).await? else {
        debug!(%namespace, %claim, "Claim not found");
        return Ok(());
    };
    if let Some(machine) = found.machine() {
        taint_machine(store, namespace, machine).await?;
    }
    taint_claim(store, namespace, claim).await?;
    Ok(())
}

/// Treats an object deleted mid-update as gone.
fn ignore_not_found(result: store::Result<bool>) -> store::Result<bool> {
    match result {
        Err(error) if error.is_not_found() => Ok(false),
        result => result,
    }
}
