#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod access;
mod condition;
pub mod duration;
pub mod event;
pub mod labels;
pub mod machine;
mod resource_id;
pub mod scheduling;
pub mod session;
pub mod store;

pub use self::{
    access::{
        AccessCode, AccessCodeSpec, AccessCodeStatus, AccessGrants, CodePhase, GrantsAccess,
        Group, GroupSpec, OneTimeAccessCode, OneTimeAccessCodeSet, OneTimeAccessCodeSetSpec,
        OneTimeAccessCodeSetStatus, OneTimeAccessCodeSpec, User, UserSpec, Validity,
    },
    condition::{set_condition, Condition},
    duration::K8sDuration,
    event::{Event, EventSpec, EventType, ObjectRef},
    machine::{
        Availability, ClaimPhase, Environment, EnvironmentSpec, Machine, MachineClaim,
        MachineClaimSpec, MachineClaimStatus, MachineSet, MachineSetSpec, MachineSetStatus,
        MachineSpec, MachineStatus, MachineTemplate, MachineTemplateSpec, Provider, ProviderSpec,
    },
    resource_id::ResourceId,
    scheduling::{
        Course, CourseSpec, ExpirationStrategy, PauseBehavior, PersistenceStrategy, Scenario,
        ScenarioSpec, ScheduledEvent, ScheduledEventSpec, ScheduledEventStatus,
    },
    session::{
        CourseSession, CourseSessionSpec, ScenarioSession, ScenarioSessionSpec, Session,
        SessionResource, SessionSpec, SessionStatus,
    },
    store::{KubeStore, MemoryStore, Object, Store, WatchEvent},
};
pub use k8s_openapi::{
    api::{
        self,
        rbac::v1::{
            ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
        },
    },
    apimachinery::pkg::apis::meta::v1::{OwnerReference, Time},
};
pub use kube::{
    api::{ListParams, ObjectMeta, ResourceExt},
    Client, Resource,
};

/// The API group of the RBAC kinds that bindings reference.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
