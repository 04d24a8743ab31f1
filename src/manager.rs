//! The discovery manager maintains a set of running providers and keeps the
//! merged view of their target groups in sync with a single consumer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, StaticConfig};
use crate::discoverer::{Discoverer, DiscovererOptions};
use crate::target::TargetGroup;

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// A full snapshot of discovered targets: job name to the groups of every
/// provider serving that job.
pub type TargetSets = HashMap<String, Vec<TargetGroup>>;

/// Slot of one provider's groups under one subscribed job.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    set_name: String,
    provider: String,
}

/// A provider bundles a discoverer with its configuration and the set of
/// jobs subscribed to it.
struct Provider {
    name: String,
    config: Option<Config>,

    // Taken when the provider is started; the running driver owns it.
    discoverer: Option<Box<dyn Discoverer>>,

    // Jobs sharing this provider. Multiple jobs carrying value-equal
    // configurations are served by one running instance.
    subs: Vec<String>,
}

struct State {
    // Some discoverers send only the updates for a given target group, so
    // each (job, provider) slot maps group sources to their latest state.
    targets: BTreeMap<PoolKey, BTreeMap<String, TargetGroup>>,
    providers: Vec<Provider>,
    cancels: Vec<CancellationToken>,
}

struct Shared {
    name: String,
    state: RwLock<State>,

    // Capacity-1 dirty bit: a pending message means updates were merged
    // since the last broadcast.
    trigger_tx: mpsc::Sender<()>,
}

impl Shared {
    fn update_group(&self, key: PoolKey, groups: &[TargetGroup]) {
        let mut state = self.state.write();
        let slot = state.targets.entry(key).or_default();
        for group in groups {
            slot.insert(group.source.clone(), group.clone());
        }
    }

    fn all_groups(&self) -> TargetSets {
        let state = self.state.read();

        let mut sets = TargetSets::new();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for (key, groups) in &state.targets {
            // Even an empty group is sent to the consumer, it signals that
            // the scrape loops for this target set must be stopped.
            let entry = sets.entry(key.set_name.clone()).or_default();
            let count = counts.entry(key.set_name.clone()).or_default();
            for group in groups.values() {
                entry.push(group.clone());
                *count += group.targets.len();
            }
        }

        for (job, count) in counts {
            gauge!(
                "prometheus_sd_discovered_targets",
                "name" => self.name.clone(),
                "config" => job
            )
            .set(count as f64);
        }

        sets
    }
}

/// Maintains a set of discovery providers and sends each update to a map
/// channel. Targets are grouped by the target set name.
pub struct Manager {
    ctx: CancellationToken,
    update_interval: Duration,
    shared: Arc<Shared>,

    sync_tx: mpsc::Sender<TargetSets>,
    sync_rx: Option<mpsc::Receiver<TargetSets>>,
    trigger_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Manager {
    pub fn new(ctx: CancellationToken, name: impl Into<String>) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (sync_tx, sync_rx) = mpsc::channel(1);

        Self {
            ctx,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            shared: Arc::new(Shared {
                name: name.into(),
                state: RwLock::new(State {
                    targets: BTreeMap::new(),
                    providers: Vec::new(),
                    cancels: Vec::new(),
                }),
                trigger_tx,
            }),
            sync_tx,
            sync_rx: Some(sync_rx),
            trigger_rx: Mutex::new(Some(trigger_rx)),
        }
    }

    /// Override how long merged updates are withheld before a broadcast.
    /// Intended for tests.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    /// The channel consumers receive target updates from. Every element is
    /// a complete snapshot across all jobs; delivery is best effort, a slow
    /// consumer only ever misses intermediate states. May be taken once.
    pub fn sync_ch(&mut self) -> Option<mpsc::Receiver<TargetSets>> {
        self.sync_rx.take()
    }

    /// Start the broadcast task and park until the root context is
    /// canceled, then stop every provider.
    pub async fn run(&self) {
        let trigger_rx = self.trigger_rx.lock().take();
        if let Some(trigger_rx) = trigger_rx {
            tokio::spawn(sender(
                Arc::clone(&self.shared),
                self.ctx.clone(),
                self.sync_tx.clone(),
                trigger_rx,
                self.update_interval,
            ));
        }

        self.ctx.cancelled().await;
        self.cancel_discoverers();
    }

    /// Stop all running providers and start the set described by `config`.
    /// Returns how many provider configurations could not be instantiated;
    /// their jobs fall back to an empty target list.
    pub fn apply_config(&self, config: HashMap<String, Vec<Config>>) -> usize {
        let mut state = self.shared.state.write();

        // Jobs that disappear take their target count with them.
        for key in state.targets.keys() {
            if !config.contains_key(&key.set_name) {
                gauge!(
                    "prometheus_sd_discovered_targets",
                    "name" => self.shared.name.clone(),
                    "config" => key.set_name.clone()
                )
                .set(0.0);
            }
        }

        for cancel in state.cancels.drain(..) {
            cancel.cancel();
        }
        state.targets.clear();
        state.providers.clear();

        let mut failed = 0;
        for (job, configs) in &config {
            failed += register_providers(&mut state, configs, job);
            gauge!(
                "prometheus_sd_discovered_targets",
                "name" => self.shared.name.clone(),
                "config" => job.clone()
            )
            .set(0.0);
        }
        gauge!("prometheus_sd_failed_configs", "name" => self.shared.name.clone())
            .set(failed as f64);

        for index in 0..state.providers.len() {
            self.start_provider_locked(&mut state, index, self.ctx.clone());
        }

        failed
    }

    /// Append and immediately start a provider serving the single job
    /// `name`.
    pub fn start_custom_provider(
        &self,
        ctx: CancellationToken,
        name: impl Into<String>,
        discoverer: Box<dyn Discoverer>,
    ) {
        let name = name.into();
        let mut state = self.shared.state.write();

        state.targets.entry(PoolKey {
            set_name: name.clone(),
            provider: name.clone(),
        })
        .or_default();
        state.providers.push(Provider {
            name: name.clone(),
            config: None,
            discoverer: Some(discoverer),
            subs: vec![name],
        });

        let index = state.providers.len() - 1;
        self.start_provider_locked(&mut state, index, ctx);
    }

    fn start_provider_locked(&self, state: &mut State, index: usize, ctx: CancellationToken) {
        let (discoverer, name, subs) = {
            let provider = &mut state.providers[index];
            let Some(discoverer) = provider.discoverer.take() else {
                return;
            };

            (discoverer, provider.name.clone(), provider.subs.clone())
        };

        debug!(message = "starting provider", provider = %name, subs = ?subs);

        let cancel = ctx.child_token();
        state.cancels.push(cancel.clone());

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(discoverer.run(cancel.clone(), tx));
        tokio::spawn(updater(Arc::clone(&self.shared), cancel, name, subs, rx));
    }

    fn cancel_discoverers(&self) {
        let mut state = self.shared.state.write();
        for cancel in state.cancels.drain(..) {
            cancel.cancel();
        }
    }
}

/// Register the providers of one job, sharing existing ones whose retained
/// configuration is value-equal. Returns the number of configurations that
/// failed to instantiate.
fn register_providers(state: &mut State, configs: &[Config], job: &str) -> usize {
    let mut failed = 0;
    let mut added = false;

    for config in configs {
        if add_provider(state, config.clone(), job) {
            added = true;
        } else {
            failed += 1;
        }
    }

    if !added {
        // The job has no working provider, either because its configuration
        // list is empty or because every entry failed. An empty group still
        // has to reach the consumer so it refreshes the corresponding
        // scrape pool and drops any previous targets.
        add_provider(
            state,
            Config::Static(StaticConfig::empty_group()),
            job,
        );
    }

    failed
}

fn add_provider(state: &mut State, config: Config, job: &str) -> bool {
    if let Some(index) = state
        .providers
        .iter()
        .position(|p| p.config.as_ref() == Some(&config))
    {
        let provider = state.providers[index].name.clone();
        state.providers[index].subs.push(job.to_string());
        state.targets.entry(PoolKey {
            set_name: job.to_string(),
            provider,
        })
        .or_default();

        return true;
    }

    let kind = config.name();
    let discoverer = match config.new_discoverer(DiscovererOptions {
        job: job.to_string(),
    }) {
        Ok(discoverer) => discoverer,
        Err(err) => {
            error!(message = "cannot create service discovery", %err, kind, config = %job);
            return false;
        }
    };

    let name = format!("{}/{}", kind, state.providers.len());
    state.targets.entry(PoolKey {
        set_name: job.to_string(),
        provider: name.clone(),
    })
    .or_default();
    state.providers.push(Provider {
        name,
        config: Some(config),
        discoverer: Some(discoverer),
        subs: vec![job.to_string()],
    });

    true
}

/// Reads one provider's updates and merges them into the target table under
/// every subscribed job.
async fn updater(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    provider: String,
    subs: Vec<String>,
    mut rx: mpsc::Receiver<Vec<TargetGroup>>,
) {
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            update = rx.recv() => {
                counter!("prometheus_sd_received_updates_total", "name" => shared.name.clone())
                    .increment(1);

                let Some(groups) = update else {
                    debug!(message = "discoverer channel closed", provider = %provider);
                    return;
                };

                for sub in &subs {
                    shared.update_group(
                        PoolKey {
                            set_name: sub.clone(),
                            provider: provider.clone(),
                        },
                        &groups,
                    );
                }

                // Flip the dirty bit; a pending signal is just as good.
                let _ = shared.trigger_tx.try_send(());
            }
        }
    }
}

/// Broadcasts coalesced snapshots: however many provider updates arrive
/// within one tick become at most one send on the sync channel.
async fn sender(
    shared: Arc<Shared>,
    ctx: CancellationToken,
    sync_tx: mpsc::Sender<TargetSets>,
    mut trigger_rx: mpsc::Receiver<()>,
    interval: Duration,
) {
    // Some discoverers send updates too often, throttle them with a ticker.
    let mut ticker = interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = ticker.tick() => {
                if trigger_rx.try_recv().is_err() {
                    continue;
                }

                counter!("prometheus_sd_updates_total", "name" => shared.name.clone())
                    .increment(1);

                if sync_tx.try_send(shared.all_groups()).is_err() {
                    counter!("prometheus_sd_updates_delayed_total", "name" => shared.name.clone())
                        .increment(1);
                    debug!(
                        message = "discovery receiver's channel was full so will retry the next cycle"
                    );
                    let _ = shared.trigger_tx.try_send(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::kubernetes;
    use crate::target::{Labels, ADDRESS_LABEL};

    fn group(source: &str, addresses: &[&str]) -> TargetGroup {
        TargetGroup {
            source: source.to_string(),
            targets: addresses
                .iter()
                .map(|addr| {
                    let mut target = Labels::new();
                    target.insert(ADDRESS_LABEL.to_string(), addr.to_string());
                    target
                })
                .collect(),
            labels: Labels::new(),
        }
    }

    fn static_config(groups: &[TargetGroup]) -> Config {
        Config::Static(StaticConfig {
            groups: groups.to_vec(),
        })
    }

    fn pool_key(job: &str, provider: &str) -> PoolKey {
        PoolKey {
            set_name: job.to_string(),
            provider: provider.to_string(),
        }
    }

    async fn new_manager(
        interval: Duration,
    ) -> (Arc<Manager>, CancellationToken, mpsc::Receiver<TargetSets>) {
        let ctx = CancellationToken::new();
        let mut manager = Manager::new(ctx.clone(), "test").with_update_interval(interval);
        let rx = manager.sync_ch().unwrap();

        let manager = Arc::new(manager);
        tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.run().await }
        });

        (manager, ctx, rx)
    }

    async fn recv_until<F>(rx: &mut mpsc::Receiver<TargetSets>, mut predicate: F) -> TargetSets
    where
        F: FnMut(&TargetSets) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                let sets = rx.recv().await.expect("sync channel closed");
                if predicate(&sets) {
                    return sets;
                }
            }
        })
        .await
        .expect("timed out waiting for a matching snapshot")
    }

    /// Emits its groups once, then parks until canceled.
    struct OnceDiscoverer(Vec<TargetGroup>);

    #[async_trait]
    impl Discoverer for OnceDiscoverer {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            tx: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tx.send(self.0) => {}
            }

            ctx.cancelled().await;
        }
    }

    /// Emits its groups and returns right away, dropping its sender.
    struct ClosingDiscoverer(Vec<TargetGroup>);

    #[async_trait]
    impl Discoverer for ClosingDiscoverer {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            tx: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = tx.send(self.0) => {}
            }
        }
    }

    /// Emits a run of single-group updates under one source, paced so they
    /// span several broadcast ticks.
    struct BurstDiscoverer {
        count: usize,
        pace: Duration,
    }

    #[async_trait]
    impl Discoverer for BurstDiscoverer {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            tx: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            for i in 0..self.count {
                let update = vec![group("burst", &[format!("10.0.0.1:{i}").as_str()])];
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tx.send(update) => {}
                }
                tokio::time::sleep(self.pace).await;
            }

            ctx.cancelled().await;
        }
    }

    /// Flags cancellation so tests can observe provider teardown.
    struct CancelProbe(Arc<AtomicBool>);

    #[async_trait]
    impl Discoverer for CancelProbe {
        async fn run(
            self: Box<Self>,
            ctx: CancellationToken,
            _tx: mpsc::Sender<Vec<TargetGroup>>,
        ) {
            ctx.cancelled().await;
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn static_groups_are_broadcast() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        let groups = vec![group("s1", &["10.0.0.1:9090"])];
        let failed = manager.apply_config(HashMap::from([(
            "j1".to_string(),
            vec![static_config(&groups)],
        )]));
        assert_eq!(failed, 0);

        let sets = recv_until(&mut rx, |sets| sets.contains_key("j1")).await;
        assert_eq!(sets.len(), 1);
        assert_eq!(sets["j1"], groups);

        ctx.cancel();
    }

    #[tokio::test]
    async fn every_configured_job_has_a_snapshot_slot() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        manager.apply_config(HashMap::from([
            ("j1".to_string(), vec![static_config(&[group("s1", &["a:1"])])]),
            // A provider that never emits any group.
            ("j2".to_string(), vec![static_config(&[])]),
        ]));

        let sets = recv_until(&mut rx, |sets| !sets.is_empty()).await;
        assert!(sets.contains_key("j1"));
        assert_eq!(sets["j2"], Vec::<TargetGroup>::new());

        ctx.cancel();
    }

    #[tokio::test]
    async fn value_equal_static_configs_share_one_provider() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        let config = static_config(&[group("s1", &["a:1"])]);
        manager.apply_config(HashMap::from([
            ("j1".to_string(), vec![config.clone()]),
            ("j2".to_string(), vec![config]),
        ]));

        {
            let state = manager.shared.state.read();
            assert_eq!(state.providers.len(), 1);
            assert_eq!(state.providers[0].name, "static/0");

            let mut subs = state.providers[0].subs.clone();
            subs.sort();
            assert_eq!(subs, vec!["j1".to_string(), "j2".to_string()]);
        }

        let sets =
            recv_until(&mut rx, |sets| sets.contains_key("j1") && sets.contains_key("j2")).await;
        assert_eq!(sets["j1"], sets["j2"]);

        ctx.cancel();
    }

    #[tokio::test]
    async fn value_equal_kubernetes_configs_share_one_provider() {
        let (manager, ctx, _rx) = new_manager(Duration::from_millis(50)).await;

        let config = Config::Kubernetes(kubernetes::Config {
            api_server: Some("https://localhost:6443".to_string()),
            ..Default::default()
        });
        let failed = manager.apply_config(HashMap::from([
            ("j1".to_string(), vec![config.clone()]),
            ("j2".to_string(), vec![config]),
        ]));
        assert_eq!(failed, 0);

        let state = manager.shared.state.read();
        assert_eq!(state.providers.len(), 1);
        assert_eq!(state.providers[0].name, "kubernetes/0");

        let mut subs = state.providers[0].subs.clone();
        subs.sort();
        assert_eq!(subs, vec!["j1".to_string(), "j2".to_string()]);
        drop(state);

        ctx.cancel();
    }

    #[tokio::test]
    async fn apply_config_replaces_the_provider_set() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        manager.apply_config(HashMap::from([(
            "j1".to_string(),
            vec![static_config(&[group("s1", &["a:1"])])],
        )]));
        recv_until(&mut rx, |sets| sets.contains_key("j1")).await;

        let replacement = vec![group("s2", &["b:2"])];
        manager.apply_config(HashMap::from([(
            "j1".to_string(),
            vec![static_config(&replacement)],
        )]));

        // Within a tick the broadcast reflects only the new configuration.
        let sets = recv_until(&mut rx, |sets| {
            sets.get("j1").is_some_and(|groups| groups == &replacement)
        })
        .await;
        assert!(!sets["j1"].iter().any(|g| g.source == "s1"));

        let state = manager.shared.state.read();
        assert_eq!(state.providers.len(), 1);
        assert_eq!(state.providers[0].name, "static/0");
        drop(state);

        ctx.cancel();
    }

    #[tokio::test]
    async fn removed_jobs_are_dropped_from_snapshots() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        manager.apply_config(HashMap::from([
            ("j1".to_string(), vec![static_config(&[group("s1", &["a:1"])])]),
            ("j2".to_string(), vec![static_config(&[group("s2", &["b:2"])])]),
        ]));
        recv_until(&mut rx, |sets| sets.contains_key("j1") && sets.contains_key("j2")).await;

        manager.apply_config(HashMap::from([(
            "j1".to_string(),
            vec![static_config(&[group("s1", &["a:1"])])],
        )]));

        let sets = recv_until(&mut rx, |sets| sets.contains_key("j1")).await;
        assert!(!sets.contains_key("j2"));

        ctx.cancel();
    }

    #[tokio::test]
    async fn jobs_without_working_providers_fall_back_to_an_empty_group() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        let failed = manager.apply_config(HashMap::from([("j1".to_string(), Vec::new())]));
        assert_eq!(failed, 0);

        {
            let state = manager.shared.state.read();
            assert_eq!(state.providers.len(), 1);
            assert_eq!(state.providers[0].name, "static/0");
        }

        let sets = recv_until(&mut rx, |sets| sets.contains_key("j1")).await;
        assert_eq!(sets["j1"], vec![TargetGroup::default()]);

        ctx.cancel();
    }

    #[tokio::test]
    async fn failed_configs_are_counted_and_fall_back_to_an_empty_group() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        // A bearer token file that cannot be read fails construction.
        let failed = manager.apply_config(HashMap::from([(
            "j1".to_string(),
            vec![Config::Kubernetes(kubernetes::Config {
                api_server: Some("https://localhost:6443".to_string()),
                bearer_token_file: Some("/nonexistent/token".into()),
                ..Default::default()
            })],
        )]));
        assert_eq!(failed, 1);

        let sets = recv_until(&mut rx, |sets| sets.contains_key("j1")).await;
        assert_eq!(sets["j1"], vec![TargetGroup::default()]);

        ctx.cancel();
    }

    #[tokio::test]
    async fn custom_providers_serve_their_own_job() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        let groups = vec![group("custom-source", &["c:3"])];
        manager.start_custom_provider(
            ctx.clone(),
            "custom",
            Box::new(OnceDiscoverer(groups.clone())),
        );

        let sets = recv_until(&mut rx, |sets| sets.contains_key("custom")).await;
        assert_eq!(sets["custom"], groups);

        ctx.cancel();
    }

    #[tokio::test]
    async fn closed_update_channel_is_a_benign_terminal_event() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        let groups = vec![group("s1", &["a:1"])];
        manager.start_custom_provider(
            ctx.clone(),
            "closing",
            Box::new(ClosingDiscoverer(groups.clone())),
        );

        let sets = recv_until(&mut rx, |sets| sets.contains_key("closing")).await;
        assert_eq!(sets["closing"], groups);

        // The manager keeps running: another provider still gets through,
        // and the closed provider's groups are retained.
        manager.start_custom_provider(
            ctx.clone(),
            "late",
            Box::new(OnceDiscoverer(vec![group("s2", &["b:2"])])),
        );

        let sets = recv_until(&mut rx, |sets| sets.contains_key("late")).await;
        assert_eq!(sets["closing"], groups);

        ctx.cancel();
    }

    #[tokio::test]
    async fn emitting_a_group_twice_keeps_one_table_entry() {
        let manager = Manager::new(CancellationToken::new(), "test");
        let shared = &manager.shared;

        let g = group("s1", &["a:1"]);
        shared.update_group(pool_key("j1", "p/0"), &[g.clone()]);
        shared.update_group(pool_key("j1", "p/0"), &[g.clone()]);

        let sets = shared.all_groups();
        assert_eq!(sets["j1"], vec![g]);
    }

    #[tokio::test]
    async fn empty_targets_replace_and_reemission_restores() {
        let manager = Manager::new(CancellationToken::new(), "test");
        let shared = &manager.shared;

        let full = group("s1", &["a:1", "b:2"]);
        shared.update_group(pool_key("j1", "p/0"), &[full.clone()]);
        assert_eq!(shared.all_groups()["j1"], vec![full.clone()]);

        // An empty re-emission clears the targets but stays in the table.
        let cleared = group("s1", &[]);
        shared.update_group(pool_key("j1", "p/0"), &[cleared.clone()]);
        assert_eq!(shared.all_groups()["j1"], vec![cleared]);

        shared.update_group(pool_key("j1", "p/0"), &[full.clone()]);
        assert_eq!(shared.all_groups()["j1"], vec![full]);
    }

    #[tokio::test]
    async fn updates_within_one_tick_coalesce_for_a_slow_consumer() {
        let (manager, ctx, mut rx) = new_manager(Duration::from_millis(50)).await;

        manager.start_custom_provider(
            ctx.clone(),
            "burst",
            Box::new(BurstDiscoverer {
                count: 100,
                pace: Duration::from_millis(2),
            }),
        );

        // Leave the sync channel unread while the burst crosses several
        // ticks, forcing delayed broadcasts.
        tokio::time::sleep(Duration::from_millis(400)).await;

        // The buffered snapshot may be any intermediate state...
        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.contains_key("burst"));

        // ...but the retried broadcast reflects exactly the final state.
        let expected = group("burst", &["10.0.0.1:99"]);
        let sets = recv_until(&mut rx, |sets| sets.contains_key("burst")).await;
        assert_eq!(sets["burst"], vec![expected]);

        ctx.cancel();
    }

    #[tokio::test]
    async fn canceling_the_root_context_stops_providers() {
        let (manager, ctx, _rx) = new_manager(Duration::from_millis(50)).await;

        let canceled = Arc::new(AtomicBool::new(false));
        manager.start_custom_provider(
            ctx.clone(),
            "probe",
            Box::new(CancelProbe(Arc::clone(&canceled))),
        );

        ctx.cancel();

        timeout(Duration::from_secs(1), async {
            while !canceled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("provider was not canceled");
    }
}
