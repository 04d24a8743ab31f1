use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::target::TargetGroup;

/// Options handed to a provider constructor.
#[derive(Clone, Debug, Default)]
pub struct DiscovererOptions {
    /// Name of the scrape job the provider was first requested for, used
    /// for log context only.
    pub job: String,
}

/// A Discoverer provides information about target groups. It maintains a
/// set of sources from which groups can originate, and sends a batch of
/// groups on its channel whenever it detects a potential change.
///
/// A Discoverer does not know whether an actual change happened; it does
/// guarantee that it sends the new state of a group whenever a change
/// happens, and that it initially sends a full set of all the groups it
/// knows about.
///
/// `run` must return promptly once `ctx` is canceled. Implementations
/// should keep `tx` alive until then, although the manager treats a closed
/// channel as a benign terminal event.
#[async_trait]
pub trait Discoverer: Send + Sync {
    async fn run(self: Box<Self>, ctx: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>);
}

/// A provider for a fixed list of target groups that never changes.
pub struct StaticDiscoverer {
    groups: Vec<TargetGroup>,
}

impl StaticDiscoverer {
    pub fn new(groups: Vec<TargetGroup>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl Discoverer for StaticDiscoverer {
    async fn run(self: Box<Self>, ctx: CancellationToken, tx: mpsc::Sender<Vec<TargetGroup>>) {
        // The consumer may exit right away, in which case the context is
        // canceled before the send completes.
        tokio::select! {
            _ = ctx.cancelled() => return,
            result = tx.send(self.groups) => {
                if result.is_err() {
                    return;
                }
            }
        }

        ctx.cancelled().await;
    }
}
