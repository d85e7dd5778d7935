use crate::build::IngressResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The unique, lower-cased hostnames declared by a set of Ingress resources.
///
/// A database is never mutated after it is built; a rebuild produces a new
/// instance that replaces the old one wholesale.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct IngressDb {
    unique_hosts: BTreeSet<String>,
}

/// Returns the lower-cased hostnames of `ingress`'s rules in rule order.
///
/// Rules without a host (or with an empty one) are skipped. Duplicates are
/// preserved.
pub fn extract_hosts(ingress: &IngressResource) -> Vec<String> {
    ingress
        .rules
        .iter()
        .filter_map(|rule| rule.host.as_deref())
        .filter(|host| !host.is_empty())
        .map(str::to_lowercase)
        .collect()
}

// === impl IngressDb ===

impl IngressDb {
    /// Case-insensitive membership test.
    pub fn contains(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        self.unique_hosts.contains(&host.to_lowercase())
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.unique_hosts.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.unique_hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unique_hosts.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<S> for IngressDb {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let unique_hosts = iter
            .into_iter()
            .map(|h| h.as_ref().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self { unique_hosts }
    }
}

impl From<Vec<String>> for IngressDb {
    fn from(hosts: Vec<String>) -> Self {
        hosts.into_iter().collect()
    }
}

impl From<IngressDb> for Vec<String> {
    fn from(db: IngressDb) -> Self {
        db.unique_hosts.into_iter().collect()
    }
}
