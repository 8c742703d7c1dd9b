use crate::k8s::{api::apps::v1::Deployment, ObjectMeta, Resource};
use anyhow::Result;
use k8s_openapi::api::coordination::v1 as coordv1;
use kube::api::PatchParams;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info};

const LEASE_DURATION: time::Duration = time::Duration::from_secs(30);
const RENEW_GRACE_PERIOD: time::Duration = time::Duration::from_secs(1);
const FIELD_MANAGER: &str = "gargantua";

pub type Claims = watch::Receiver<Arc<kubert::lease::Claim>>;

pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    lease_name: &str,
    deployment_name: Option<&str>,
    hostname: &str,
) -> Result<Claims> {
    // When running as a deployment, the lease is owned by it so that it is removed along with
    // the controllers.
    let owner_references = match deployment_name {
        Some(name) => {
            let api = kube::Api::<Deployment>::namespaced(runtime.client(), ns);
            let deployment = api.get(name).await?;
            deployment.controller_owner_ref(&()).map(|owner| vec![owner])
        }
        None => None,
    };

    let lease = coordv1::Lease {
        metadata: ObjectMeta {
            name: Some(lease_name.to_string()),
            namespace: Some(ns.to_string()),
            // Specifying a resource version of "0" means that we will
            // only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references,
            labels: Some(
                [("app.kubernetes.io/component".to_string(), "gargantua".to_string())]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        },
        spec: None,
    };
    let api = kube::Api::<coordv1::Lease>::namespaced(runtime.client(), ns);
    match api
        .patch(
            lease_name,
            &PatchParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            },
            &kube::api::Patch::Apply(lease),
        )
        .await
    {
        Ok(lease) => info!(?lease, "Created Lease resource"),
        Err(kube::Error::Api(_)) => debug!("Lease already exists, no need to create it"),
        Err(error) => {
            return Err(error.into());
        }
    };

    let params = kubert::lease::ClaimParams {
        lease_duration: LEASE_DURATION,
        renew_grace_period: RENEW_GRACE_PERIOD,
    };
    let (claims, _task) = kubert::lease::LeaseManager::init(api, lease_name)
        .await?
        .spawn(hostname, params)
        .await?;
    Ok(claims)
}

/// Tracks whether `hostname` holds the lease.
///
/// The claim is re-evaluated whenever it changes and when it expires, so leadership is
/// surrendered even if the lease manager stops reporting.
pub fn leadership(mut claims: Claims, hostname: String) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(claims.borrow().is_current_for(&hostname));
    tokio::spawn(async move {
        loop {
            let expiry = claims.borrow().expiry;
            let remaining = (expiry - chrono::Utc::now())
                .to_std()
                .unwrap_or_default();
            tokio::select! {
                changed = claims.changed() => {
                    if changed.is_err() {
                        tx.send_replace(false);
                        return;
                    }
                }
                _ = time::sleep(remaining), if !remaining.is_zero() => {}
                _ = tx.closed() => return,
            }

            let leader = claims.borrow_and_update().is_current_for(&hostname);
            if tx.send_replace(leader) != leader {
                info!(leader, %hostname, "Leadership changed");
            }
        }
    });
    rx
}
