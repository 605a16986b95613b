//! Typed access to the running control plane.

use crate::config::CredentialCache;
use crate::errors::ClusterError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// Namespace that exists as soon as the control plane does.
pub const SYSTEM_NAMESPACE: &str = "kube-system";

/// Namespaces present on a freshly initialised cluster.
pub const PREEXISTING_NAMESPACES: &[&str] = &["default", "kube-system", "kube-public"];

/// The bits of a pod the bootstrap cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Reported phase, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl PodSummary {
    /// Creates a pod summary.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: None,
        }
    }
}

impl From<Pod> for PodSummary {
    fn from(pod: Pod) -> Self {
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            phase: pod.status.and_then(|status| status.phase),
        }
    }
}

/// Operations the bootstrap performs directly against the API server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Creates a namespace with the given labels.
    ///
    /// An existing namespace with the same name is an error.
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Lists the pods in a namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, ClusterError>;
}

/// [`ClusterApi`] backed by kube-rs.
///
/// The client is built on first use from the shared credential cache, since
/// the admin kubeconfig does not exist until the control plane is initialised.
pub struct KubeClusterApi {
    credentials: Arc<CredentialCache>,
    client: OnceCell<Client>,
}

impl KubeClusterApi {
    /// Creates a lazily-connecting API handle.
    #[must_use]
    pub fn new(credentials: Arc<CredentialCache>) -> Self {
        Self {
            credentials,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, ClusterError> {
        self.client
            .get_or_try_init(|| async {
                let credentials = self.credentials.get().await?;
                let config = Config::from_custom_kubeconfig(
                    credentials.kubeconfig.clone(),
                    &KubeConfigOptions::default(),
                )
                .await
                .map_err(|e| ClusterError::Client(e.to_string()))?;

                debug!(cluster_url = %config.cluster_url, "Connecting to control plane");
                Client::try_from(config).map_err(|e| ClusterError::Client(e.to_string()))
            })
            .await
    }
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi")
            .field("credentials", &self.credentials)
            .field("connected", &self.client.initialized())
            .finish()
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create_namespace(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client().await?.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: (!labels.is_empty()).then(|| labels.clone()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };

        api.create(&PostParams::default(), &namespace)
            .await
            .map_err(|source| ClusterError::Api {
                operation: format!("create {name} namespace"),
                source,
            })?;

        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client().await?.clone(), namespace);
        let pods = api
            .list(&ListParams::default())
            .await
            .map_err(|source| ClusterError::Api {
                operation: format!("list pods in {namespace}"),
                source,
            })?;

        Ok(pods.items.into_iter().map(PodSummary::from).collect())
    }
}
