//! cnvrgctl: backup and restore of cnvrg.io control plane state on Kubernetes

pub mod core;
pub mod logging;
pub mod utils;
