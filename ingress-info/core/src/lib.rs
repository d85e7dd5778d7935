#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Builds the set of hostnames declared by Ingress resources and serves it
//! from an optional time-bounded cache.
//!
//! The cluster itself is reached through the [`ListIngresses`] capability
//! and cache storage through the [`Store`] capability, so everything in this
//! crate can be exercised without a cluster.

pub mod build;
pub mod cache;
pub mod hosts;
pub mod labels;
pub mod metrics;

pub use self::{
    build::{Builder, DbConfig, Error as BuildError, IngressResource, ListIngresses, Rule},
    cache::{CachedDb, MemoryStore, NoopStore, Store, StoreError, INGRESS_DB_KEY},
    hosts::{extract_hosts, IngressDb},
    labels::{should_exclude, Labels, Selector},
    metrics::DbMetrics,
};
