//! Kubernetes service discovery.

mod client;
mod informer;
mod pod;
mod resource;
mod watch;

pub use client::{Auth, Client, ClientConfig, Error as ClientError, RefreshableToken, WatchEvent};
pub use informer::{EventHandler, IndexFunc, SharedInformer, Store};
pub use pod::{node_index, PodDiscovery, NODE_INDEX};
pub use resource::{
    Container, ContainerPort, ContainerStatus, Node, ObjectList, ObjectMeta, OwnerReference, Pod,
    PodCondition, PodSpec, PodStatus, Resource,
};
pub use watch::{watcher, Event};

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discoverer::{Discoverer, DiscovererOptions};
use crate::target::TargetGroup;

/// The resource kind a discovery instance watches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Pod,
}

/// Cluster metadata merged into discovered targets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AttachMetadata {
    /// Attach the labels and annotations of the node a pod is scheduled on.
    #[serde(default)]
    pub node: bool,
}

/// Configuration for Kubernetes service discovery.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the API server. When unset, the in-cluster service
    /// account environment and mount are used.
    #[serde(default)]
    pub api_server: Option<String>,

    #[serde(default)]
    pub role: Role,

    /// Restrict discovery to a single namespace. All namespaces are watched
    /// when unset.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default)]
    pub bearer_token: Option<String>,

    #[serde(default)]
    pub bearer_token_file: Option<PathBuf>,

    /// PEM bundle used to verify the API server certificate.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    #[serde(default)]
    pub attach_metadata: AttachMetadata,
}

impl Config {
    fn client_config(&self) -> Result<ClientConfig, client::Error> {
        let Some(api_server) = &self.api_server else {
            return ClientConfig::in_cluster();
        };

        let auth = if let Some(path) = &self.bearer_token_file {
            Auth::BearerFile(
                client::RefreshableToken::new(path.clone())
                    .map_err(client::Error::RefreshToken)?,
            )
        } else if let Some(token) = &self.bearer_token {
            Auth::Bearer(token.clone())
        } else {
            Auth::None
        };

        Ok(ClientConfig {
            cluster_url: api_server.clone(),
            auth,
            ca_file: self.ca_file.clone(),
        })
    }
}

/// A provider that watches cluster resources and turns them into target
/// groups, according to its configured role.
pub struct Discovery {
    client: Client,
    namespace: Option<String>,
    role: Role,
    attach_node_metadata: bool,
}

impl Discovery {
    pub fn new(config: &Config, opts: DiscovererOptions) -> crate::Result<Self> {
        let client = Client::new(config.client_config()?)?;

        debug!(
            message = "created kubernetes discovery",
            role = ?config.role,
            config = %opts.job,
        );

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            role: config.role,
            attach_node_metadata: config.attach_metadata.node,
        })
    }

    async fn run_pod(&self, ctx: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        let pods = Arc::new(SharedInformer::<Pod>::with_indices(vec![(
            NODE_INDEX, node_index,
        )]));
        let nodes = self
            .attach_node_metadata
            .then(|| Arc::new(SharedInformer::<Node>::new()));

        // Handlers must be in place before the informers observe anything,
        // otherwise the initial listing is not replayed into the queue.
        let discovery = PodDiscovery::new(Arc::clone(&pods), nodes.clone());

        tokio::spawn({
            let ctx = ctx.clone();
            let stream = watcher::<Pod>(self.client.clone(), self.namespace.clone());
            async move { pods.run(ctx, stream).await }
        });

        if let Some(nodes) = nodes {
            tokio::spawn({
                let ctx = ctx.clone();
                let stream = watcher::<Node>(self.client.clone(), None);
                async move { nodes.run(ctx, stream).await }
            });
        }

        Box::new(discovery).run(ctx, tx).await
    }
}

#[async_trait]
impl Discoverer for Discovery {
    async fn run(self: Box<Self>, ctx: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        match self.role {
            Role::Pod => self.run_pod(ctx, tx).await,
        }
    }
}
