//! Records `Event`s about the objects controllers act on.
//!
//! Recording is fire-and-forget: a failure is logged and never fails the reconciliation that
//! reported it.

use gargantua_core::SharedClock;
use gargantua_k8s_api::{
    store::{Object, Store},
    Event, EventSpec, EventType, ObjectMeta, ObjectRef,
};
use tracing::warn;

#[derive(Clone)]
pub struct Recorder<S> {
    store: S,
    clock: SharedClock,
    instance: String,
}

/// Event reasons.
pub mod reasons {
    pub const CREATE_FAILED: &str = "CreateFailed";
    pub const SCALED_UP: &str = "ScaledUp";
    pub const SCALED_DOWN: &str = "ScaledDown";
    pub const CANNOT_SCALE_DOWN: &str = "CannotScaleDown";
    pub const CAPACITY_EXHAUSTED: &str = "CapacityExhausted";
    pub const RECLAIMED: &str = "Reclaimed";
    pub const BOUND: &str = "Bound";
    pub const BIND_TIMEOUT: &str = "BindTimeout";
    pub const RELEASED: &str = "Released";
    pub const INVALID_TIME: &str = "InvalidTime";
    pub const FINISHED: &str = "Finished";
    pub const PROVISIONED: &str = "Provisioned";
    pub const DUPLICATE_ROLES: &str = "DuplicateRoles";
    pub const ROLE_SYNTHESIZED: &str = "RoleSynthesized";
    pub const SURPLUS_REDEEMED: &str = "SurplusRedeemed";
}

// === impl Recorder ===

impl<S: Store> Recorder<S> {
    pub fn new(store: S, clock: SharedClock, instance: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            instance: instance.into(),
        }
    }

    pub async fn publish<K: Object>(
        &self,
        controller: &str,
        regarding: &K,
        type_: EventType,
        reason: &str,
        note: impl Into<String>,
    ) {
        let regarding = ObjectRef::of(regarding);
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", regarding.name)),
                namespace: Some(regarding.namespace.clone()),
                ..Default::default()
            },
            spec: EventSpec {
                event_time: self.clock.now().to_rfc3339(),
                reporting_controller: controller.to_string(),
                reporting_instance: self.instance.clone(),
                reason: reason.to_string(),
                note: note.into(),
                type_,
                regarding,
            },
        };

        let namespace = event.spec.regarding.namespace.as_str();
        if let Err(error) = self.store.create(namespace, &event).await {
            warn!(%reason, %error, "Failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gargantua_core::ManualClock;
    use gargantua_k8s_api::{ListParams, MachineSet, MachineSetSpec, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn records_regarding_object() {
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        let clock: SharedClock = Arc::new(clock);
        let store = MemoryStore::new(clock.clone());
        let recorder = Recorder::new(store.clone(), clock, "replica-0");

        let mut set = MachineSet::new("ms1", MachineSetSpec::default());
        set.metadata.namespace = Some("hf".to_string());
        let set = store.create("hf", &set).await.unwrap();
        recorder
            .publish(
                "pool-reconciler",
                &set,
                EventType::Warning,
                reasons::CANNOT_SCALE_DOWN,
                "2 machines are claimed",
            )
            .await;

        let events = store
            .list::<Event>("hf", &ListParams::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.metadata.name.as_deref().unwrap().starts_with("ms1-"));
        assert_eq!(event.spec.regarding.kind, "MachineSet");
        assert_eq!(event.spec.regarding.name, "ms1");
        assert_eq!(event.spec.regarding.uid, set.metadata.uid.clone().unwrap());
        assert_eq!(event.spec.type_, EventType::Warning);
        assert_eq!(event.spec.reporting_controller, "pool-reconciler");
        assert_eq!(event.spec.reporting_instance, "replica-0");
        assert_eq!(event.spec.reason, "CannotScaleDown");
        assert_eq!(event.spec.event_time, "2024-05-01T12:00:00+00:00");
    }
}
