//! Well-known labels.

use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Set on machines, naming the owning machine set.
pub const MACHINE_SET: &str = "hobbyfarm.io/machine-set";

pub const MACHINE_TEMPLATE: &str = "hobbyfarm.io/machine-template";

pub const ENVIRONMENT: &str = "hobbyfarm.io/environment";

/// Set to `"false"` on tainted machines.
pub const READY: &str = "ready";

/// Links machine sets, claims and access codes to the scheduled event that created them.
pub const SCHEDULED_EVENT: &str = "hobbyfarm.io/scheduledevent";

pub const ACCESS_CODE: &str = "hobbyfarm.io/accesscode";

pub const USER: &str = "hobbyfarm.io/user";

/// Names the access code a synthesized role grants.
pub const CODE_ROLE: &str = "code-role";

/// Names the access code a synthesized role binding grants.
pub const CODE_ROLEBINDING: &str = "code-rolebinding";

pub const OTAC_SET: &str = "hobbyfarm.io/otac-set";

/// `"true"` once a one-time access code has been redeemed.
pub const OTAC_REDEEMED: &str = "hobbyfarm.io/otac-redeemed";

/// Formats an equality label selector.
pub fn selector(key: &str, value: &str) -> String {
    format!("{key}={value}")
}

/// Reads a label from an object's metadata.
pub fn get<'m>(meta: &'m kube::api::ObjectMeta, key: &str) -> Option<&'m str> {
    meta.labels.as_ref()?.get(key).map(String::as_str)
}
