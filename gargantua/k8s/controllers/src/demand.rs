use crate::queue::WorkQueue;
use ahash::AHashMap as HashMap;
use gargantua_core::pool::ProvisioningStrategy;
use gargantua_k8s_api::{ClaimPhase, MachineClaim, MachineSet, ResourceId};
use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use std::sync::Arc;

/// Wakes on-demand machine sets when a claim for their template starts waiting.
///
/// On-demand pools size themselves by the claims waiting on them, but a claim does not name the
/// set that will serve it. This index tracks the template of every on-demand set so that each
/// requested claim can be fed to the pool queue of the sets that might serve it.
pub struct ClaimDemand {
    queue: WorkQueue<ResourceId>,
    templates: HashMap<ResourceId, String>,
}

// === impl ClaimDemand ===

impl ClaimDemand {
    pub fn new(queue: WorkQueue<ResourceId>) -> Self {
        Self {
            queue,
            templates: HashMap::default(),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}

impl IndexNamespacedResource<MachineSet> for ClaimDemand {
    fn apply(&mut self, set: MachineSet) {
        let Some(id) = ResourceId::of(&set) else {
            return;
        };
        if set.spec.provisioning_strategy == ProvisioningStrategy::OnDemand {
            self.templates.insert(id, set.spec.machine_template);
        } else {
            self.templates.remove(&id);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.templates.remove(&ResourceId::new(namespace, name));
    }
}

impl IndexNamespacedResource<MachineClaim> for ClaimDemand {
    fn apply(&mut self, claim: MachineClaim) {
        if claim.phase() != ClaimPhase::Requested {
            return;
        }
        let namespace = claim.metadata.namespace.as_deref().unwrap_or_default();
        for (id, template) in &self.templates {
            if id.namespace == namespace && *template == claim.spec.machine_template {
                self.queue.add(id.clone());
            }
        }
    }

    // The binder taints a deleted claim's machine. The machine watch then wakes the pool.
    fn delete(&mut self, _namespace: String, _name: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use gargantua_k8s_api::{MachineClaimSpec, MachineSetSpec, ObjectMeta};

    fn set(name: &str, strategy: ProvisioningStrategy) -> MachineSet {
        MachineSet {
            metadata: ObjectMeta {
                namespace: Some("hf".to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: MachineSetSpec {
                provisioning_strategy: strategy,
                machine_template: "small".to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    fn claim(template: &str) -> MachineClaim {
        MachineClaim {
            metadata: ObjectMeta {
                namespace: Some("hf".to_string()),
                name: Some("c1".to_string()),
                ..Default::default()
            },
            spec: MachineClaimSpec {
                machine_template: template.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    #[tokio::test]
    async fn requested_claims_wake_on_demand_sets() {
        let queue = WorkQueue::new();
        let mut demand = ClaimDemand::new(queue.clone());
        demand.apply(set("od", ProvisioningStrategy::OnDemand));
        demand.apply(set("auto", ProvisioningStrategy::AutoScale));

        demand.apply(claim("large"));
        assert!(queue.is_empty());

        demand.apply(claim("small"));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some(ResourceId::new("hf", "od")));
    }

    #[tokio::test]
    async fn deleted_sets_are_forgotten() {
        let queue = WorkQueue::new();
        let mut demand = ClaimDemand::new(queue.clone());
        demand.apply(set("od", ProvisioningStrategy::OnDemand));
        IndexNamespacedResource::<MachineSet>::delete(
            &mut demand,
            "hf".to_string(),
            "od".to_string(),
        );

        demand.apply(claim("small"));
        assert!(queue.is_empty());
    }
}
