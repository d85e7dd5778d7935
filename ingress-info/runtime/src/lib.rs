#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use ingress_info_core as core;

mod args;
pub mod k8s;
pub mod lookup;
pub mod server;
pub mod store;

pub use self::{
    args::Args,
    k8s::{KubeIngresses, LoadConfigMode},
    lookup::{Lookup, LookupConfig, LookupMetrics},
    store::DiskStore,
};

type Body = http_body_util::Full<bytes::Bytes>;
