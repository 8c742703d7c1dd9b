//! Providers, deployment targets and the machine pools provisioned in them.

use crate::{labels, Condition};
use gargantua_core::{
    configuration::Configuration,
    pool::{BindStrategy, ProvisioningStrategy},
    property::Property,
};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declares the configuration a provider accepts and the information it reports on machines.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Provider", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    #[serde(default)]
    pub provider_configuration: BTreeMap<String, Property>,

    #[serde(default)]
    pub machine_information: BTreeMap<String, Property>,
}

/// An abstract machine shape.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "MachineTemplate", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub display_name: String,

    /// Configuration overrides keyed by provider name.
    #[serde(default)]
    pub provider_configuration: BTreeMap<String, Configuration>,

    #[serde(default)]
    pub connect_protocols: Vec<String>,

    pub machine_name_prefix: Option<String>,

    #[serde(default)]
    pub predefined_services: Vec<String>,
}

/// A concrete deployment target for a provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Environment", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    #[serde(default)]
    pub display_name: String,

    pub provider: String,

    #[serde(default)]
    pub provider_configuration: Configuration,

    /// Per-template overrides, applied over `providerConfiguration`.
    #[serde(default)]
    pub template_configuration: BTreeMap<String, Configuration>,

    /// The most machines of each template the environment may host.
    #[serde(default)]
    pub template_capacity: BTreeMap<String, u32>,

    /// Connection endpoints by protocol.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Availability {
    AccessCode,
    ScheduledEvent,
    #[default]
    Pool,
}

/// A pool of interchangeable machines.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "MachineSet",
    status = "MachineSetStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    #[serde(default)]
    pub availability: Availability,

    #[serde(default)]
    pub provisioning_strategy: ProvisioningStrategy,

    pub max_provisioned: u32,

    #[serde(default)]
    pub min_available: u32,

    pub provider: String,
    pub environment: String,
    pub machine_template: String,

    pub machine_name_prefix: Option<String>,

    /// Highest-precedence configuration overrides.
    #[serde(default)]
    pub configuration: Configuration,

    /// Required when availability is `AccessCode`.
    pub access_code: Option<String>,

    /// Required when availability is `ScheduledEvent`.
    pub scheduled_event: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    #[serde(default)]
    pub provisioned: u32,
    #[serde(default)]
    pub available: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// A single provisioned instance. The core writes its spec; providers write its status.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "Machine",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub machine_set: String,
    pub machine_template: String,
    pub environment: String,
    pub provider: String,

    #[serde(default)]
    pub configuration: Configuration,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// The claim bound to this machine.
    pub claim: Option<String>,

    #[serde(default)]
    pub tainted: bool,

    /// Provider-reported values, e.g. `primary_address`.
    #[serde(default)]
    pub machine_information: BTreeMap<String, String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ClaimPhase {
    #[default]
    Requested,
    Bound,
    Failed,
    Terminated,
}

/// A user's bid to hold a machine of a specific template.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "MachineClaim",
    status = "MachineClaimStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineClaimSpec {
    pub machine_template: String,
    pub user: String,

    pub access_code: Option<String>,
    pub scheduled_event: Option<String>,

    #[serde(default)]
    pub bind_strategy: BindStrategy,

    /// The machine sets a `PreferMachineSets` or `RequireMachineSets` strategy names.
    #[serde(default)]
    pub machine_sets: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineClaimStatus {
    #[serde(default)]
    pub phase: ClaimPhase,

    /// Set iff the phase is `Bound` or `Terminated`.
    pub machine: Option<String>,

    #[serde(default)]
    pub tainted: bool,

    pub reason: Option<String>,
}

// === impl Machine ===

impl Machine {
    pub fn claim(&self) -> Option<&str> {
        self.status.as_ref()?.claim.as_deref()
    }

    pub fn is_tainted(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.tainted)
            || labels::get(&self.metadata, labels::READY) == Some("false")
    }

    /// Unclaimed, untainted, and not being deleted.
    pub fn is_available(&self) -> bool {
        self.claim().is_none()
            && !self.is_tainted()
            && self.metadata.deletion_timestamp.is_none()
    }
}

// === impl MachineClaim ===

impl MachineClaim {
    pub fn phase(&self) -> ClaimPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    pub fn machine(&self) -> Option<&str> {
        self.status.as_ref()?.machine.as_deref()
    }
}

// === impl MachineSet ===

impl MachineSet {
    /// Returns true if machines in this set may serve the claim.
    pub fn serves(&self, claim: &MachineClaim) -> bool {
        if self.spec.machine_template != claim.spec.machine_template {
            return false;
        }
        match self.spec.availability {
            Availability::Pool => true,
            Availability::AccessCode => {
                self.spec.access_code.is_some() && self.spec.access_code == claim.spec.access_code
            }
            Availability::ScheduledEvent => {
                self.spec.scheduled_event.is_some()
                    && self.spec.scheduled_event == claim.spec.scheduled_event
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(template: &str, access_code: Option<&str>, event: Option<&str>) -> MachineClaim {
        MachineClaim::new(
            "c",
            MachineClaimSpec {
                machine_template: template.to_string(),
                user: "u".to_string(),
                access_code: access_code.map(Into::into),
                scheduled_event: event.map(Into::into),
                ..Default::default()
            },
        )
    }

    #[test]
    fn availability_restricts_claims() {
        let pool = MachineSet::new(
            "pool",
            MachineSetSpec {
                machine_template: "small".to_string(),
                ..Default::default()
            },
        );
        assert!(pool.serves(&claim("small", None, None)));
        assert!(!pool.serves(&claim("large", None, None)));

        let event = MachineSet::new(
            "event",
            MachineSetSpec {
                availability: Availability::ScheduledEvent,
                machine_template: "small".to_string(),
                scheduled_event: Some("workshop".to_string()),
                ..Default::default()
            },
        );
        assert!(event.serves(&claim("small", None, Some("workshop"))));
        assert!(!event.serves(&claim("small", None, None)));
        assert!(!event.serves(&claim("small", None, Some("other"))));

        let code = MachineSet::new(
            "code",
            MachineSetSpec {
                availability: Availability::AccessCode,
                machine_template: "small".to_string(),
                access_code: Some("ac".to_string()),
                ..Default::default()
            },
        );
        assert!(code.serves(&claim("small", Some("ac"), None)));
        assert!(!code.serves(&claim("small", None, None)));
    }
}
