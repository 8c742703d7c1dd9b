#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod authz;
pub mod clock;
pub mod configuration;
mod field_error;
pub mod pool;
pub mod property;
pub mod rbac;
pub mod timestamp;

pub use self::{
    authz::{Attributes, Decision, ResourceAttributes, UserInfo},
    clock::{Clock, ManualClock, SharedClock, SystemClock},
    field_error::{FieldError, FieldErrors},
    rbac::{AccessSet, Rule},
};

/// The API group of every HobbyFarm resource.
pub const API_GROUP: &str = "hobbyfarm.io";
