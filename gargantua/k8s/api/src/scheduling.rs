//! Learning content and the events that schedule it.

use crate::{duration::K8sDuration, Condition};
use gargantua_core::timestamp;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Machines required per environment, by template.
pub type RequiredMachines = BTreeMap<String, BTreeMap<String, u32>>;

/// Machine-template names required by a scenario or course, keyed by VM name.
pub type VirtualMachines = Vec<BTreeMap<String, String>>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ExpirationStrategy {
    /// Taint every claim at the end time and tear down the event's machine sets.
    #[default]
    CutOff,

    /// Stop keeping spare machines, leaving claimed machines to their sessions.
    Soft,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PauseBehavior {
    #[default]
    CanPause,
    CannotPause,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PersistenceStrategy {
    #[default]
    PersistThroughCourse,
    NewPerScenario,
}

/// A provisioning window.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "hobbyfarm.io",
    version = "v1",
    kind = "ScheduledEvent",
    status = "ScheduledEventStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEventSpec {
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Unix-date timestamps, e.g. `Mon Jan  2 15:04:05 UTC 2006`.
    pub start_time: String,
    pub end_time: String,

    /// Defaults to half an hour before `startTime`.
    pub provisioning_start_time: Option<String>,

    #[serde(default)]
    pub expiration_strategy: ExpirationStrategy,

    #[serde(default)]
    pub required_machines: RequiredMachines,

    /// Provision on-demand rather than keeping every required machine warm.
    #[serde(default)]
    pub on_demand: bool,

    #[serde(default)]
    pub scenarios: Vec<String>,

    #[serde(default)]
    pub courses: Vec<String>,

    /// The access code participants redeem.
    pub access_code: String,

    #[serde(default)]
    pub printable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEventStatus {
    #[serde(default)]
    pub machine_sets: Vec<String>,
    #[serde(default)]
    pub provisioned: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub finished: bool,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Scenario", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSpec {
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Step names, in order.
    #[serde(default)]
    pub steps: Vec<String>,

    #[serde(default)]
    pub virtual_machines: VirtualMachines,

    #[schemars(with = "Option<String>")]
    pub keepalive_duration: Option<K8sDuration>,

    #[schemars(with = "Option<String>")]
    pub pause_duration: Option<K8sDuration>,

    #[serde(default)]
    pub pause_behavior: PauseBehavior,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Course", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct CourseSpec {
    #[serde(default)]
    pub display_name: String,

    #[serde(default)]
    pub description: String,

    /// Scenario names, in order.
    #[serde(default)]
    pub scenarios: Vec<String>,

    #[serde(default)]
    pub virtual_machines: VirtualMachines,

    #[schemars(with = "Option<String>")]
    pub keepalive_duration: Option<K8sDuration>,

    /// Takes precedence over the scenario's pause settings for sessions drawn from this course.
    #[schemars(with = "Option<String>")]
    pub pause_duration: Option<K8sDuration>,

    pub pause_behavior: Option<PauseBehavior>,

    #[serde(default)]
    pub persistence: PersistenceStrategy,
}

// === impl ScheduledEventSpec ===

impl ScheduledEventSpec {
    pub fn start(&self) -> Result<chrono::DateTime<chrono::Utc>, timestamp::ParseError> {
        timestamp::parse(&self.start_time)
    }

    pub fn end(&self) -> Result<chrono::DateTime<chrono::Utc>, timestamp::ParseError> {
        timestamp::parse(&self.end_time)
    }

    pub fn provisioning_start(&self) -> Result<chrono::DateTime<chrono::Utc>, timestamp::ParseError> {
        match self.provisioning_start_time.as_deref() {
            Some(t) => timestamp::parse(t),
            None => Ok(self.start()? - chrono::Duration::minutes(30)),
        }
    }

    /// Names the machine set provisioned for an environment and template.
    pub fn machine_set_name(event: &str, environment: &str, template: &str) -> String {
        format!("{event}-{environment}-{template}")
    }
}

/// Resolves the pause settings for a session drawn from a scenario, optionally within a course.
///
/// The session writer applies these when it creates a session; nothing in this workspace does.
#[cfg_attr(not(test), allow(dead_code))]
pub(crate) fn pause_settings(
    scenario: &ScenarioSpec,
    course: Option<&CourseSpec>,
) -> (PauseBehavior, Option<K8sDuration>) {
    let behavior = course
        .and_then(|c| c.pause_behavior)
        .unwrap_or(scenario.pause_behavior);
    let duration = course
        .and_then(|c| c.pause_duration)
        .or(scenario.pause_duration);
    (behavior, duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn provisioning_defaults_to_half_hour_early() {
        let spec = ScheduledEventSpec {
            start_time: "Wed May  1 12:00:00 UTC 2024".to_string(),
            end_time: "Wed May  1 18:00:00 UTC 2024".to_string(),
            ..Default::default()
        };
        assert_eq!(
            spec.provisioning_start().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 11, 30, 0).unwrap()
        );

        let spec = ScheduledEventSpec {
            provisioning_start_time: Some("Wed May  1 08:00:00 UTC 2024".to_string()),
            ..spec
        };
        assert_eq!(
            spec.provisioning_start().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn course_pause_settings_take_precedence() {
        let scenario = ScenarioSpec {
            pause_behavior: PauseBehavior::CanPause,
            pause_duration: Some(K8sDuration::from_secs(600)),
            ..Default::default()
        };
        assert_eq!(
            pause_settings(&scenario, None),
            (PauseBehavior::CanPause, Some(K8sDuration::from_secs(600)))
        );

        let course = CourseSpec {
            pause_behavior: Some(PauseBehavior::CannotPause),
            ..Default::default()
        };
        assert_eq!(
            pause_settings(&scenario, Some(&course)),
            (PauseBehavior::CannotPause, Some(K8sDuration::from_secs(600)))
        );
    }
}
