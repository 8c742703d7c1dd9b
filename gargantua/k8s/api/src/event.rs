use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EventType {
    #[default]
    Info,
    Warning,
    Error,
}

/// Identifies the object an event is about.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

/// A transient observation, expired after the retention window.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(group = "hobbyfarm.io", version = "v1", kind = "Event", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    pub regarding: ObjectRef,

    #[serde(rename = "type")]
    pub type_: EventType,

    /// RFC 3339.
    pub event_time: String,

    pub reporting_controller: String,
    pub reporting_instance: String,
    pub reason: String,

    #[serde(default)]
    pub note: String,
}

impl ObjectRef {
    pub fn of<K>(resource: &K) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let meta = resource.meta();
        Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone().unwrap_or_default(),
        }
    }
}
