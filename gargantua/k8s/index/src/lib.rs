//! Gargantua RBAC index
//!
//! The index maintains the secondary lookups the authorizer and the access-code controllers need
//! over the cluster's RBAC resources. It watches the following resources:
//!
//! - Each `Role` and `ClusterRole` is indexed by name, with its rules converted to
//!   [`gargantua_core::Rule`]s.
//! - Each `RoleBinding` and `ClusterRoleBinding` is indexed by its user, group and service-account
//!   subjects. Bindings synthesized for access codes are additionally indexed by code.
//! - Each HobbyFarm `Group` is indexed by its members so that a principal's effective groups can
//!   be expanded before bindings are consulted.
//!
//! ```text
//! [ User | Group ] <- [ RoleBinding ] -> [ Role ] -> [ Rule ]
//! ```
//!
//! The index is written only by watch tasks. Readers take a shared lock and receive copies, so a
//! lookup never observes a partially applied update.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod authorizer;
mod index;
pub mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    authorizer::Authorizer,
    index::{Index, SharedIndex, SubjectKind},
    metrics::IndexMetrics,
};
