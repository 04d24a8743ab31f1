//! Hand-rolled Kubernetes resource types, restricted to the fields service
//! discovery actually reads.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

/// An accessor trait for a Kubernetes resource.
pub trait Resource: DeserializeOwned + Send + Sync + 'static {
    /// The group of the resource, or the empty string if the resource
    /// doesn't have a group.
    const GROUP: &'static str;

    /// The version of the resource.
    const VERSION: &'static str;

    /// The plural of this resource, which is used to construct URLs.
    const PLURAL: &'static str;

    /// Whether objects of this kind live in a namespace.
    const NAMESPACED: bool;

    fn metadata(&self) -> &ObjectMeta;

    /// Creates a url path for http requests for this resource.
    fn url_path(namespace: Option<&str>) -> String {
        let group = if Self::GROUP.is_empty() {
            "api"
        } else {
            "apis"
        };
        let api_version = if Self::GROUP.is_empty() {
            Self::VERSION.to_string()
        } else {
            format!("{}/{}", Self::GROUP, Self::VERSION)
        };
        let namespace = match namespace {
            Some(namespace) if Self::NAMESPACED => format!("namespaces/{}/", namespace),
            _ => String::new(),
        };

        format!("/{group}/{api_version}/{namespace}{}", Self::PLURAL)
    }
}

/// Cache key of an object, `<namespace>/<name>` for namespaced resources
/// and `<name>` otherwise.
pub fn object_key(meta: &ObjectMeta) -> String {
    if meta.namespace.is_empty() {
        meta.name.clone()
    } else {
        format!("{}/{}", meta.namespace, meta.name)
    }
}

/// Standard object metadata.
///
/// See https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerReference>,
}

/// A reference to the owning object, at most one of which is the managing
/// controller.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: Option<bool>,
}

impl ObjectMeta {
    /// The owner reference marked as the managing controller, if any.
    pub fn controller(&self) -> Option<&OwnerReference> {
        self.owner_references
            .iter()
            .find(|r| r.controller.unwrap_or(false))
    }
}

/// A single application container run within a pod.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Container {
    /// Name of the container specified as a DNS_LABEL, unique within the
    /// pod.
    pub name: String,

    /// Container image name.
    ///
    /// More info: https://kubernetes.io/docs/concepts/containers/images
    pub image: String,

    pub ports: Vec<ContainerPort>,
}

/// A network port in a single container.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerPort {
    /// Each named port in a pod must have a unique name. May be empty.
    pub name: String,

    /// Port number to expose on the pod's IP address.
    pub container_port: i32,

    /// Protocol for the port, one of UDP, TCP or SCTP.
    pub protocol: String,
}

/// PodSpec is a description of a pod.
///
/// See https://kubernetes.io/docs/reference/generated/kubernetes-api/v1.31/#podspec-v1-core
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodSpec {
    /// The name of the node this pod is scheduled onto, empty while
    /// unscheduled.
    pub node_name: String,

    /// List of containers belonging to the pod. There must be at least one.
    pub containers: Vec<Container>,

    /// Initialization containers, executed in order prior to `containers`
    /// being started.
    pub init_containers: Vec<Container>,
}

/// Details about the current status of one container.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ContainerStatus {
    pub name: String,

    /// The ID of the container in the format `<type>://<container_id>`,
    /// where `<type>` is a container runtime identifier.
    #[serde(rename = "containerID")]
    pub container_id: String,
}

/// Details about the pod's current service state.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodCondition {
    /// Condition kind, e.g. `Ready`.
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: `True`, `False` or `Unknown`.
    pub status: String,
}

/// The most recently observed status of a pod. This data may trail the
/// actual state of the system.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PodStatus {
    /// IP address allocated to the pod, routable at least within the
    /// cluster. Empty when not yet allocated or after eviction.
    #[serde(rename = "podIP")]
    pub pod_ip: String,

    /// IP address of the host the pod is assigned to.
    #[serde(rename = "hostIP")]
    pub host_ip: String,

    /// The phase of the pod lifecycle: Pending, Running, Succeeded, Failed
    /// or Unknown.
    pub phase: String,

    pub conditions: Vec<PodCondition>,

    /// One entry per container in `spec.containers`.
    pub container_statuses: Vec<ContainerStatus>,

    /// One entry per container in `spec.initContainers`.
    pub init_container_statuses: Vec<ContainerStatus>,
}

/// Pod is a collection of containers that can run on a host.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    pub status: PodStatus,
}

impl Resource for Pod {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const PLURAL: &'static str = "pods";
    const NAMESPACED: bool = true;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Node is a worker machine in the cluster.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    pub metadata: ObjectMeta,
}

impl Resource for Node {
    const GROUP: &'static str = "";
    const VERSION: &'static str = "v1";
    const PLURAL: &'static str = "nodes";
    const NAMESPACED: bool = false;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// List metadata, only really used for its `resourceVersion`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

/// A generic Kubernetes object list, produced by list queries on a
/// [`Resource`].
#[derive(Debug, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default)]
    pub metadata: ListMeta,

    /// The items we are actually interested in.
    pub items: Vec<T>,
}
