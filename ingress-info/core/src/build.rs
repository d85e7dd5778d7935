use crate::{
    hosts::{extract_hosts, IngressDb},
    labels::{should_exclude, Labels, Selector},
    metrics::DbMetrics,
};
use std::{collections::BTreeSet, sync::Arc};
use thiserror::Error;
use tracing::debug;

/// The parts of an Ingress the host database is built from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressResource {
    pub namespace: String,
    pub name: String,
    pub labels: Labels,
    pub rules: Vec<Rule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Rule {
    pub host: Option<String>,
}

/// Lists Ingress resources from the cluster.
///
/// `labels`, when set, is applied by the server: only resources carrying
/// every pair are returned.
#[async_trait::async_trait]
pub trait ListIngresses: Send + Sync {
    async fn list_ingresses(
        &self,
        namespace: Option<&str>,
        labels: Option<&Selector>,
    ) -> anyhow::Result<Vec<IngressResource>>;
}

/// Which Ingresses make up the database. Fixed for the process lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbConfig {
    /// Namespaces to list, in order. `None` lists across all namespaces.
    pub namespaces: Option<Vec<String>>,
    pub include_labels: Option<Selector>,
    pub exclude_labels: Option<Selector>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list ingresses in {scope}: {source}")]
    Fetch {
        scope: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Builds an [`IngressDb`] from the current cluster state.
#[derive(Debug)]
pub struct Builder<L> {
    client: L,
    config: Arc<DbConfig>,
    metrics: DbMetrics,
}

// === impl Builder ===

impl<L: ListIngresses> Builder<L> {
    pub fn new(client: L, config: Arc<DbConfig>, metrics: DbMetrics) -> Self {
        Self {
            client,
            config,
            metrics,
        }
    }

    /// Lists every configured scope and aggregates the hosts of the
    /// Ingresses that survive the exclude selector.
    ///
    /// A failure in any one namespace fails the whole build.
    pub async fn build(&self) -> Result<IngressDb, Error> {
        self.metrics.builds.inc();
        let ingresses = match self.fetch().await {
            Ok(ingresses) => ingresses,
            Err(error) => {
                self.metrics.build_failures.inc();
                return Err(error);
            }
        };

        let exclude = self.config.exclude_labels.as_ref();
        let mut hosts = BTreeSet::new();
        for ingress in &ingresses {
            if should_exclude(&ingress.labels, exclude) {
                debug!(
                    namespace = %ingress.namespace,
                    name = %ingress.name,
                    label = ?exclude.and_then(|sel| sel.first_match(&ingress.labels)),
                    "Excluding Ingress"
                );
                continue;
            }
            hosts.extend(extract_hosts(ingress));
        }

        let db = hosts.into_iter().collect::<IngressDb>();
        self.metrics.hosts.set(db.len() as i64);
        debug!(ingresses = ingresses.len(), hosts = db.len(), "Built host database");
        Ok(db)
    }

    async fn fetch(&self) -> Result<Vec<IngressResource>, Error> {
        let labels = self.config.include_labels.as_ref();

        let Some(namespaces) = self.config.namespaces.as_ref() else {
            debug!(namespace = "*", ?labels, "Listing Ingresses");
            return self
                .client
                .list_ingresses(None, labels)
                .await
                .map_err(|source| Error::Fetch {
                    scope: "all namespaces".to_string(),
                    source,
                });
        };

        let mut ingresses = Vec::new();
        for ns in namespaces {
            debug!(namespace = %ns, ?labels, "Listing Ingresses");
            let items = self
                .client
                .list_ingresses(Some(ns), labels)
                .await
                .map_err(|source| Error::Fetch {
                    scope: format!("namespace {ns}"),
                    source,
                })?;
            ingresses.extend(items);
        }
        Ok(ingresses)
    }
}
