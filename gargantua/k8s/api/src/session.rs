//! A user's engagement with a scenario or course.
//!
//! The three session kinds share one status block so that a single temporal reconciler can drive
//! all of them through [`SessionResource`].

use crate::scheduling::PersistenceStrategy;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Unix-date timestamps.
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub expiration_time: String,

    /// While paused, the time until which expiry is deferred.
    pub paused_time: Option<String>,

    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub provisioned: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "Session",
    status = "SessionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    pub user: String,
    pub scenario: Option<String>,
    pub course: Option<String>,
    pub access_code: Option<String>,
    pub scheduled_event: Option<String>,
    pub persistence: Option<PersistenceStrategy>,

    /// `MachineClaim` names.
    #[serde(default)]
    pub claims: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "CourseSession",
    status = "SessionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CourseSessionSpec {
    pub user: String,
    pub course: String,
    pub access_code: Option<String>,
    pub scheduled_event: Option<String>,

    #[serde(default)]
    pub persistence: PersistenceStrategy,

    #[serde(default)]
    pub claims: Vec<String>,

    /// Index into the course's scenarios.
    #[serde(default)]
    pub current_scenario: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "ScenarioSession",
    status = "SessionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSessionSpec {
    pub user: String,
    pub scenario: String,
    pub course: Option<String>,
    pub access_code: Option<String>,
    pub scheduled_event: Option<String>,

    #[serde(default)]
    pub claims: Vec<String>,

    #[serde(default)]
    pub current_step: u32,
    #[serde(default)]
    pub max_step: u32,
}

/// Gives the temporal reconciler uniform access to session kinds.
pub trait SessionResource {
    fn session_status(&self) -> Option<&SessionStatus>;
    fn session_status_mut(&mut self) -> &mut SessionStatus;
    fn claims(&self) -> &[String];
}

macro_rules! impl_session_resource {
    ($($kind:ty),+) => {
        $(
            impl SessionResource for $kind {
                fn session_status(&self) -> Option<&SessionStatus> {
                    self.status.as_ref()
                }

                fn session_status_mut(&mut self) -> &mut SessionStatus {
                    self.status.get_or_insert_with(Default::default)
                }

                fn claims(&self) -> &[String] {
                    &self.spec.claims
                }
            }
        )+
    };
}

impl_session_resource!(Session, CourseSession, ScenarioSession);
