//! Discovers one target group per pod, with one target per container/port
//! combination.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use workqueue::WorkQueue;

use super::informer::{EventHandler, SharedInformer, Store};
use super::resource::{object_key, ContainerStatus, Node, Pod};
use crate::discoverer::Discoverer;
use crate::target::{sanitize_label_name, Labels, TargetGroup, ADDRESS_LABEL};

pub const NODE_INDEX: &str = "node";

const NAMESPACE_LABEL: &str = "__meta_kubernetes_namespace";

const POD_NAME_LABEL: &str = "__meta_kubernetes_pod_name";
const POD_IP_LABEL: &str = "__meta_kubernetes_pod_ip";
const POD_CONTAINER_NAME_LABEL: &str = "__meta_kubernetes_pod_container_name";
const POD_CONTAINER_ID_LABEL: &str = "__meta_kubernetes_pod_container_id";
const POD_CONTAINER_IMAGE_LABEL: &str = "__meta_kubernetes_pod_container_image";
const POD_CONTAINER_PORT_NAME_LABEL: &str = "__meta_kubernetes_pod_container_port_name";
const POD_CONTAINER_PORT_NUMBER_LABEL: &str = "__meta_kubernetes_pod_container_port_number";
const POD_CONTAINER_PORT_PROTOCOL_LABEL: &str = "__meta_kubernetes_pod_container_port_protocol";
const POD_CONTAINER_IS_INIT_LABEL: &str = "__meta_kubernetes_pod_container_init";
const POD_READY_LABEL: &str = "__meta_kubernetes_pod_ready";
const POD_PHASE_LABEL: &str = "__meta_kubernetes_pod_phase";
const POD_NODE_NAME_LABEL: &str = "__meta_kubernetes_pod_node_name";
const POD_HOST_IP_LABEL: &str = "__meta_kubernetes_pod_host_ip";
const POD_UID_LABEL: &str = "__meta_kubernetes_pod_uid";
const POD_CONTROLLER_KIND_LABEL: &str = "__meta_kubernetes_pod_controller_kind";
const POD_CONTROLLER_NAME_LABEL: &str = "__meta_kubernetes_pod_controller_name";

const POD_LABEL_PREFIX: &str = "__meta_kubernetes_pod_label_";
const POD_LABEL_PRESENT_PREFIX: &str = "__meta_kubernetes_pod_labelpresent_";
const POD_ANNOTATION_PREFIX: &str = "__meta_kubernetes_pod_annotation_";
const POD_ANNOTATION_PRESENT_PREFIX: &str = "__meta_kubernetes_pod_annotationpresent_";

const NODE_NAME_LABEL: &str = "__meta_kubernetes_node_name";
const NODE_LABEL_PREFIX: &str = "__meta_kubernetes_node_label_";
const NODE_LABEL_PRESENT_PREFIX: &str = "__meta_kubernetes_node_labelpresent_";
const NODE_ANNOTATION_PREFIX: &str = "__meta_kubernetes_node_annotation_";
const NODE_ANNOTATION_PRESENT_PREFIX: &str = "__meta_kubernetes_node_annotationpresent_";

/// The index function wiring pods to the [`NODE_INDEX`] of their store.
pub fn node_index(pod: &Pod) -> Option<String> {
    if pod.spec.node_name.is_empty() {
        None
    } else {
        Some(pod.spec.node_name.clone())
    }
}

/// Discovers new pod targets.
pub struct PodDiscovery {
    store: Store<Pod>,
    nodes: Option<Arc<SharedInformer<Node>>>,
    pods: Arc<SharedInformer<Pod>>,
    queue: Arc<WorkQueue<String>>,
}

impl PodDiscovery {
    /// Create a new pod discovery watching `pods`, which must carry the
    /// [`NODE_INDEX`] when `nodes` is given.
    pub fn new(pods: Arc<SharedInformer<Pod>>, nodes: Option<Arc<SharedInformer<Node>>>) -> Self {
        let queue = Arc::new(WorkQueue::new());
        let store = pods.store();

        pods.add_event_handler(PodHandler {
            queue: Arc::clone(&queue),
        });

        if let Some(nodes) = &nodes {
            nodes.add_event_handler(NodeHandler {
                queue: Arc::clone(&queue),
                pods: store.clone(),
            });
        }

        Self {
            store,
            nodes,
            pods,
            queue,
        }
    }

    async fn process(
        &self,
        ctx: &CancellationToken,
        tx: &mpsc::Sender<Vec<TargetGroup>>,
    ) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match key.split_once('/') {
            Some((namespace, name)) => match self.store.get_by_key(&key) {
                Some(pod) => send(ctx, tx, self.build_pod(&pod)).await,
                None => {
                    // The pod is gone from the cache: replace whatever was
                    // emitted for it with an empty group so the consumer
                    // drops its targets.
                    send(ctx, tx, TargetGroup::empty(pod_source(namespace, name))).await;
                }
            },
            None => error!(message = "received unexpected pod key", key = %key),
        }

        self.queue.done(&key);
        true
    }

    fn build_pod(&self, pod: &Pod) -> TargetGroup {
        let mut group = TargetGroup::empty(pod_source(
            &pod.metadata.namespace,
            &pod.metadata.name,
        ));

        // PodIP can be empty when a pod is starting or has been evicted.
        if pod.status.pod_ip.is_empty() {
            return group;
        }

        group.labels = pod_labels(pod);
        group
            .labels
            .insert(NAMESPACE_LABEL.to_string(), pod.metadata.namespace.clone());
        if let Some(nodes) = &self.nodes {
            add_node_labels(&mut group.labels, &nodes.store(), &pod.spec.node_name);
        }

        let containers = pod
            .spec
            .containers
            .iter()
            .chain(pod.spec.init_containers.iter());
        for (i, container) in containers.enumerate() {
            let is_init = i >= pod.spec.containers.len();

            let statuses = if is_init {
                &pod.status.init_container_statuses
            } else {
                &pod.status.container_statuses
            };
            let container_id = find_container_id(statuses, &container.name);

            // If no ports are declared for the container, create an
            // anonymous target per container; the user has to add a port
            // manually.
            if container.ports.is_empty() {
                let mut target = Labels::new();
                target.insert(ADDRESS_LABEL.to_string(), pod.status.pod_ip.clone());
                target.insert(POD_CONTAINER_NAME_LABEL.to_string(), container.name.clone());
                target.insert(POD_CONTAINER_ID_LABEL.to_string(), container_id.clone());
                target.insert(
                    POD_CONTAINER_IMAGE_LABEL.to_string(),
                    container.image.clone(),
                );
                target.insert(POD_CONTAINER_IS_INIT_LABEL.to_string(), is_init.to_string());
                group.targets.push(target);
                continue;
            }

            // Otherwise one target per container/port combination.
            for port in &container.ports {
                let number = port.container_port.to_string();

                let mut target = Labels::new();
                target.insert(
                    ADDRESS_LABEL.to_string(),
                    join_host_port(&pod.status.pod_ip, &number),
                );
                target.insert(POD_CONTAINER_NAME_LABEL.to_string(), container.name.clone());
                target.insert(POD_CONTAINER_ID_LABEL.to_string(), container_id.clone());
                target.insert(
                    POD_CONTAINER_IMAGE_LABEL.to_string(),
                    container.image.clone(),
                );
                target.insert(POD_CONTAINER_PORT_NUMBER_LABEL.to_string(), number.clone());
                target.insert(POD_CONTAINER_PORT_NAME_LABEL.to_string(), port.name.clone());
                target.insert(
                    POD_CONTAINER_PORT_PROTOCOL_LABEL.to_string(),
                    port.protocol.clone(),
                );
                target.insert(POD_CONTAINER_IS_INIT_LABEL.to_string(), is_init.to_string());
                group.targets.push(target);
            }
        }

        group
    }
}

#[async_trait]
impl Discoverer for PodDiscovery {
    async fn run(self: Box<Self>, ctx: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        let mut synced = self.pods.wait_for_sync(&ctx).await;
        if synced {
            if let Some(nodes) = &self.nodes {
                synced = nodes.wait_for_sync(&ctx).await;
            }
        }

        if !synced {
            if !ctx.is_cancelled() {
                error!(message = "pod informer unable to sync cache");
            }
            self.queue.shut_down();
            return;
        }

        let this = Arc::new(*self);
        let worker = tokio::spawn({
            let this = Arc::clone(&this);
            let ctx = ctx.clone();
            let tx = tx.clone();

            async move { while this.process(&ctx, &tx).await {} }
        });

        // Block until the provider is explicitly canceled.
        ctx.cancelled().await;
        this.queue.shut_down();
        let _ = worker.await;
    }
}

struct PodHandler {
    queue: Arc<WorkQueue<String>>,
}

impl EventHandler<Pod> for PodHandler {
    fn on_add(&self, pod: &Arc<Pod>) {
        counter!("prometheus_sd_kubernetes_events_total", "role" => "pod", "event" => "add")
            .increment(1);
        self.queue.add(object_key(&pod.metadata));
    }

    fn on_update(&self, pod: &Arc<Pod>) {
        counter!("prometheus_sd_kubernetes_events_total", "role" => "pod", "event" => "update")
            .increment(1);
        self.queue.add(object_key(&pod.metadata));
    }

    fn on_delete(&self, pod: &Arc<Pod>) {
        counter!("prometheus_sd_kubernetes_events_total", "role" => "pod", "event" => "delete")
            .increment(1);
        self.queue.add(object_key(&pod.metadata));
    }
}

struct NodeHandler {
    queue: Arc<WorkQueue<String>>,
    pods: Store<Pod>,
}

impl NodeHandler {
    /// Node metadata changed, so every group built for a pod on that node
    /// is stale.
    fn enqueue_pods_for_node(&self, node_name: &str) {
        for pod in self.pods.by_index(NODE_INDEX, node_name) {
            self.queue.add(object_key(&pod.metadata));
        }
    }
}

impl EventHandler<Node> for NodeHandler {
    fn on_add(&self, node: &Arc<Node>) {
        self.enqueue_pods_for_node(&node.metadata.name);
    }

    fn on_update(&self, node: &Arc<Node>) {
        self.enqueue_pods_for_node(&node.metadata.name);
    }

    fn on_delete(&self, node: &Arc<Node>) {
        self.enqueue_pods_for_node(&node.metadata.name);
    }
}

async fn send(ctx: &CancellationToken, tx: &mpsc::Sender<Vec<TargetGroup>>, group: TargetGroup) {
    tokio::select! {
        _ = ctx.cancelled() => {}
        _ = tx.send(vec![group]) => {}
    }
}

fn pod_labels(pod: &Pod) -> Labels {
    let mut labels = Labels::new();
    labels.insert(POD_NAME_LABEL.to_string(), pod.metadata.name.clone());
    labels.insert(POD_IP_LABEL.to_string(), pod.status.pod_ip.clone());
    labels.insert(POD_READY_LABEL.to_string(), pod_ready(pod));
    labels.insert(POD_PHASE_LABEL.to_string(), pod.status.phase.clone());
    labels.insert(POD_NODE_NAME_LABEL.to_string(), pod.spec.node_name.clone());
    labels.insert(POD_HOST_IP_LABEL.to_string(), pod.status.host_ip.clone());
    labels.insert(POD_UID_LABEL.to_string(), pod.metadata.uid.clone());

    if let Some(controller) = pod.metadata.controller() {
        if !controller.kind.is_empty() {
            labels.insert(
                POD_CONTROLLER_KIND_LABEL.to_string(),
                controller.kind.clone(),
            );
        }
        if !controller.name.is_empty() {
            labels.insert(
                POD_CONTROLLER_NAME_LABEL.to_string(),
                controller.name.clone(),
            );
        }
    }

    for (key, value) in &pod.metadata.labels {
        let name = sanitize_label_name(key);
        labels.insert(format!("{POD_LABEL_PREFIX}{name}"), value.clone());
        labels.insert(format!("{POD_LABEL_PRESENT_PREFIX}{name}"), "true".to_string());
    }

    for (key, value) in &pod.metadata.annotations {
        let name = sanitize_label_name(key);
        labels.insert(format!("{POD_ANNOTATION_PREFIX}{name}"), value.clone());
        labels.insert(
            format!("{POD_ANNOTATION_PRESENT_PREFIX}{name}"),
            "true".to_string(),
        );
    }

    labels
}

fn add_node_labels(labels: &mut Labels, nodes: &Store<Node>, node_name: &str) {
    let Some(node) = nodes.get_by_key(node_name) else {
        debug!(message = "node not found in cache", node = %node_name);
        return;
    };

    labels.insert(NODE_NAME_LABEL.to_string(), node_name.to_string());

    for (key, value) in &node.metadata.labels {
        let name = sanitize_label_name(key);
        labels.insert(format!("{NODE_LABEL_PREFIX}{name}"), value.clone());
        labels.insert(format!("{NODE_LABEL_PRESENT_PREFIX}{name}"), "true".to_string());
    }

    for (key, value) in &node.metadata.annotations {
        let name = sanitize_label_name(key);
        labels.insert(format!("{NODE_ANNOTATION_PREFIX}{name}"), value.clone());
        labels.insert(
            format!("{NODE_ANNOTATION_PRESENT_PREFIX}{name}"),
            "true".to_string(),
        );
    }
}

fn find_container_id(statuses: &[ContainerStatus], name: &str) -> String {
    match statuses.iter().find(|status| status.name == name) {
        Some(status) => status.container_id.clone(),
        None => {
            debug!(message = "cannot find container id", container = %name);
            String::new()
        }
    }
}

fn pod_ready(pod: &Pod) -> String {
    pod.status
        .conditions
        .iter()
        .find(|cond| cond.type_ == "Ready")
        .map(|cond| cond.status.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

fn pod_source(namespace: &str, name: &str) -> String {
    format!("pod/{namespace}/{name}")
}

fn join_host_port(host: &str, port: &str) -> String {
    // Bracket IPv6 addresses.
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
