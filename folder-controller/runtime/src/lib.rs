#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use folder_controller_core as core;
pub use folder_controller_k8s_api as k8s;
pub use folder_controller_k8s_reconcile as reconcile;

mod admission;
mod args;

pub use self::{admission::Admission, args::Args};
