#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gargantua_core as core;
pub use gargantua_k8s_api as k8s;
pub use gargantua_k8s_controllers as controllers;
pub use gargantua_k8s_index as index;

mod admission;
mod args;
mod index_list;
mod lease;
mod validation;

pub use self::{admission::Admission, args::Args};
