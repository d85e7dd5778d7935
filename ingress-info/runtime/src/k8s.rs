use anyhow::{Context, Result};
use ingress_info_core::{IngressResource, ListIngresses, Rule, Selector};
use k8s_openapi::api::networking::v1::Ingress;
use kube::{
    api::{Api, ListParams},
    config::KubeConfigOptions,
    Client, Config, ResourceExt,
};
use tracing::debug;

/// How cluster credentials are loaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum LoadConfigMode {
    /// Use the current (or named) context of the local kubeconfig.
    Local,
    /// Use the service account of the pod the process runs in.
    Cluster,
}

/// Lists `networking.k8s.io/v1` Ingresses through the Kubernetes API.
#[derive(Clone)]
pub struct KubeIngresses {
    client: Client,
}

pub async fn client(mode: LoadConfigMode, context: Option<String>) -> Result<Client> {
    let config = match mode {
        LoadConfigMode::Local => Config::from_kubeconfig(&KubeConfigOptions {
            context,
            ..Default::default()
        })
        .await
        .context("failed to load kubeconfig")?,
        LoadConfigMode::Cluster => {
            Config::incluster().context("failed to load in-cluster configuration")?
        }
    };
    Client::try_from(config).context("failed to build Kubernetes client")
}

// === impl KubeIngresses ===

impl KubeIngresses {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl ListIngresses for KubeIngresses {
    async fn list_ingresses(
        &self,
        namespace: Option<&str>,
        labels: Option<&Selector>,
    ) -> Result<Vec<IngressResource>> {
        let api = match namespace {
            Some(ns) => Api::<Ingress>::namespaced(self.client.clone(), ns),
            None => Api::<Ingress>::all(self.client.clone()),
        };

        let mut params = ListParams::default();
        if let Some(selector) = labels.filter(|s| !s.is_empty()) {
            params = params.labels(&selector.to_string());
        }

        let list = api.list(&params).await?;
        debug!(namespace = namespace.unwrap_or("*"), ingresses = list.items.len(), "Listed");
        Ok(list.items.into_iter().map(to_resource).collect())
    }
}

fn to_resource(ingress: Ingress) -> IngressResource {
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();
    let rules = ingress
        .spec
        .and_then(|spec| spec.rules)
        .unwrap_or_default()
        .into_iter()
        .map(|rule| Rule { host: rule.host })
        .collect();

    IngressResource {
        namespace,
        name,
        labels: ingress.metadata.labels.into(),
        rules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{IngressRule, IngressSpec};
    use kube::api::ObjectMeta;
    use maplit::btreemap;

    #[test]
    fn converts_ingress() {
        let ingress = Ingress {
            metadata: ObjectMeta {
                namespace: Some("ns-0".to_string()),
                name: Some("web".to_string()),
                labels: Some(btreemap! {
                    "env".to_string() => "prod".to_string(),
                }),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                rules: Some(vec![
                    IngressRule {
                        host: Some("Web.example.com".to_string()),
                        ..Default::default()
                    },
                    IngressRule::default(),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let resource = to_resource(ingress);
        assert_eq!(resource.namespace, "ns-0");
        assert_eq!(resource.name, "web");
        assert_eq!(resource.labels.get("env"), Some("prod"));
        assert_eq!(
            resource.rules,
            vec![
                Rule {
                    host: Some("Web.example.com".to_string())
                },
                Rule { host: None },
            ]
        );
    }

    #[test]
    fn converts_bare_ingress() {
        let resource = to_resource(Ingress {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(resource.namespace, "");
        assert!(resource.labels.as_ref().is_empty());
        assert!(resource.rules.is_empty());
    }
}
