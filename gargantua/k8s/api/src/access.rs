//! Principals and the access codes they redeem.

use crate::{duration::K8sDuration, Condition};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A HobbyFarm principal.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "User", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// External identities, e.g. `ldap://example.org/uid=alice`.
    #[serde(default)]
    pub principals: Vec<String>,

    /// Redeemed access codes, by name.
    #[serde(default)]
    pub access_codes: Vec<String>,

    pub local_auth: Option<LocalAuth>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalAuth {
    pub username: String,
    pub password_secret: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Group", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct GroupSpec {
    pub display_name: String,

    /// `User` object names.
    #[serde(default)]
    pub user_members: Vec<String>,

    /// External principals by authentication provider.
    #[serde(default)]
    pub provider_members: BTreeMap<String, Vec<String>>,
}

/// The resources an access code grants, by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrants {
    #[serde(default)]
    pub scenarios: Vec<String>,
    #[serde(default)]
    pub courses: Vec<String>,
    #[serde(default)]
    pub scheduled_events: Vec<String>,
    #[serde(default)]
    pub machine_sets: Vec<String>,
}

/// A validity interval. Unset bounds are open.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Validity {
    #[schemars(with = "Option<String>")]
    pub not_before: Option<DateTime<Utc>>,
    #[schemars(with = "Option<String>")]
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum CodePhase {
    Active,
    #[default]
    Inactive,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "AccessCode",
    status = "AccessCodeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AccessCodeSpec {
    #[serde(flatten)]
    pub grants: AccessGrants,

    #[serde(flatten)]
    pub validity: Validity,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessCodeStatus {
    #[serde(default)]
    pub phase: CodePhase,
}

/// A single-redemption access code.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "OneTimeAccessCode",
    status = "AccessCodeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeAccessCodeSpec {
    #[serde(flatten)]
    pub grants: AccessGrants,

    #[serde(flatten)]
    pub validity: Validity,

    /// The redeeming user. Empty until redeemed.
    #[serde(default)]
    pub user: String,

    /// Limits how long after redemption the code stays valid.
    #[schemars(with = "Option<String>")]
    pub max_duration: Option<K8sDuration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "OneTimeAccessCodeSet",
    status = "OneTimeAccessCodeSetStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeAccessCodeSetSpec {
    pub count: u32,
    pub template: OneTimeAccessCodeSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneTimeAccessCodeSetStatus {
    #[serde(default)]
    pub created: u32,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

// === impl Validity ===

impl Validity {
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now) && self.not_after.map_or(true, |t| now <= t)
    }

    /// The next bound after `now`, when the code's phase will change.
    pub fn next_transition(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        [self.not_before, self.not_after]
            .into_iter()
            .flatten()
            .filter(|t| *t > now)
            .min()
    }

    pub fn phase(&self, now: DateTime<Utc>) -> CodePhase {
        if self.contains(now) {
            CodePhase::Active
        } else {
            CodePhase::Inactive
        }
    }
}

/// Implemented by kinds that grant access by code.
pub trait GrantsAccess {
    fn grants(&self) -> &AccessGrants;
    fn validity(&self) -> &Validity;
    fn phase(&self) -> Option<CodePhase>;
    fn set_phase(&mut self, phase: CodePhase);
}

impl GrantsAccess for AccessCode {
    fn grants(&self) -> &AccessGrants {
        &self.spec.grants
    }

    fn validity(&self) -> &Validity {
        &self.spec.validity
    }

    fn phase(&self) -> Option<CodePhase> {
        self.status.as_ref().map(|s| s.phase)
    }

    fn set_phase(&mut self, phase: CodePhase) {
        self.status.get_or_insert_with(Default::default).phase = phase;
    }
}

impl GrantsAccess for OneTimeAccessCode {
    fn grants(&self) -> &AccessGrants {
        &self.spec.grants
    }

    fn validity(&self) -> &Validity {
        &self.spec.validity
    }

    fn phase(&self) -> Option<CodePhase> {
        self.status.as_ref().map(|s| s.phase)
    }

    fn set_phase(&mut self, phase: CodePhase) {
        self.status.get_or_insert_with(Default::default).phase = phase;
    }
}
