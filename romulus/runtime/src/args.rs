use crate::{
    core::{annotations::DEFAULT_PREFIX, Keyspace},
    engine::{self, Backoff, Config, Engine, EngineMetrics},
    index::{self, Builder, Feed, FeedMetrics, ObjectCache},
    k8s::{self, watcher, Api, Client, ClusterEvent, Selector, Watch, Watched},
    vulcan::{EtcdStore, MemoryStore, Store, Vulcan, DEFAULT_ROOT},
};
use anyhow::{bail, Result};
use clap::Parser;
use kubert::index::IndexNamespacedResource;
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "romulus",
    about = "Synchronizes a load balancer's routes with Kubernetes"
)]
pub struct Args {
    #[clap(long, default_value = "romulus=info,warn", env = "ROMULUS_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The annotation namespace read from cluster objects.
    #[clap(long, default_value = DEFAULT_PREFIX)]
    annotation_prefix: String,

    /// Only reconciles objects labeled `KEY=VALUE`. Keys without a `/` are
    /// placed in the annotation namespace.
    #[clap(long = "selector", value_name = "KEY=VALUE")]
    selectors: Vec<Label>,

    /// Allows selector pairs to be satisfied by annotations as well as
    /// labels. Watches are then unfiltered.
    #[clap(long)]
    selector_annotations: bool,

    #[clap(
        long,
        default_value = "http://127.0.0.1:2379",
        value_delimiter = ',',
        env = "ROMULUS_ETCD_PEERS"
    )]
    etcd_peers: Vec<String>,

    #[clap(long, default_value = DEFAULT_ROOT)]
    vulcan_root: String,

    #[clap(long, default_value = "5000")]
    etcd_timeout_ms: u64,

    /// Keeps the load balancer configuration in memory instead of writing it
    /// to etcd.
    #[clap(long)]
    dry_run: bool,

    #[clap(long, default_value = "172800")]
    cache_ttl_secs: u64,

    /// Reopens every watch on this interval so that live objects are listed
    /// again before their cache entries expire. Must be shorter than the
    /// cache TTL.
    #[clap(long, default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
    relist_interval_secs: u64,

    #[clap(long, default_value = "10")]
    requeue_delay_secs: u64,

    #[clap(long, default_value = "300", value_parser = clap::value_parser!(u64).range(1..))]
    resync_interval_secs: u64,

    #[clap(long, default_value = "60")]
    retry_max_elapsed_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Label(String, String);

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let keyspace = self.keyspace();
        let selector = self.selector();
        let config = self.engine_config();
        let Self {
            admin,
            client,
            log_level,
            log_format,
            etcd_peers,
            vulcan_root,
            etcd_timeout_ms,
            dry_run,
            cache_ttl_secs,
            relist_interval_secs,
            ..
        } = self;
        if relist_interval_secs >= cache_ttl_secs {
            bail!("--relist-interval-secs must be shorter than --cache-ttl-secs");
        }
        let relist = Duration::from_secs(relist_interval_secs);

        let mut prom = <Registry>::default();
        let feed_metrics = FeedMetrics::register(prom.sub_registry_with_prefix("feed"));
        let engine_metrics = EngineMetrics::register(prom.sub_registry_with_prefix("engine"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let shutdown = CancellationToken::new();
        let cache = ObjectCache::new(Duration::from_secs(cache_ttl_secs));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let feed = Feed::new(cache.clone(), events_tx.clone(), feed_metrics).shared();

        // Spawn resource watches. Each feeds the shared cache and event
        // channel until shutdown.
        let watches = Watches {
            client: runtime.client(),
            feed,
            events: events_tx,
            relist,
            shutdown: shutdown.clone(),
        };
        watches.spawn::<k8s::Service>(&selector);
        watches.spawn::<k8s::Endpoints>(&Selector::default());
        watches.spawn::<k8s::Ingress>(&selector);
        drop(watches);

        let builder = Builder::new(cache, keyspace, selector);
        let worker = if dry_run {
            info!("Dry run: load balancer configuration is kept in memory");
            spawn_engine(
                MemoryStore::new(),
                &vulcan_root,
                builder,
                config,
                engine_metrics,
                shutdown.clone(),
                events_rx,
            )
        } else {
            let store = EtcdStore::new(&etcd_peers, Duration::from_millis(etcd_timeout_ms))?;
            info!(peers = ?etcd_peers, root = %vulcan_root, "Writing to etcd");
            spawn_engine(
                store,
                &vulcan_root,
                builder,
                config,
                engine_metrics,
                shutdown.clone(),
                events_rx,
            )
        };

        // Stop the watches and the worker once the runtime is signaled, and
        // hold the runtime open until the worker finishes its pass.
        let drain = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = drain.signaled().await;
            info!("Shutting down");
            shutdown.cancel();
            let _ = release.release_after(worker).await;
        });

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }

    fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.annotation_prefix)
    }

    fn selector(&self) -> Selector {
        let keyspace = self.keyspace();
        self.selectors
            .iter()
            .map(|Label(k, v)| (keyspace.qualify(k), v.clone()))
            .collect::<Selector>()
            .with_annotations(self.selector_annotations)
    }

    fn engine_config(&self) -> Config {
        Config {
            retry: Backoff {
                max_elapsed: Duration::from_secs(self.retry_max_elapsed_secs),
                ..Backoff::default()
            },
            requeue_delay: Duration::from_secs(self.requeue_delay_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
        }
    }
}

/// Shared handles for the per-kind watch tasks.
struct Watches {
    client: Client,
    feed: Arc<RwLock<Feed>>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    relist: Duration,
    shutdown: CancellationToken,
}

// === impl Watches ===

impl Watches {
    fn spawn<K>(&self, selector: &Selector)
    where
        K: Watched + DeserializeOwned,
        Feed: IndexNamespacedResource<K>,
    {
        let api = Api::<K>::all(self.client.clone());
        let mut config = watcher::Config::default();
        if let Some(labels) = selector.label_selector() {
            config = config.labels(&labels);
        }

        let watch = Watch::new(
            move || watcher::watcher(api.clone(), config.clone()),
            self.shutdown.clone(),
        )
        .with_relist_interval(self.relist)
        .on_error(index::watch_errors(self.events.clone(), K::KIND))
        .instrument(info_span!("watch", kind = %K::KIND));

        tokio::spawn(
            kubert::index::namespaced(self.feed.clone(), watch.into_stream())
                .instrument(info_span!("index", kind = %K::KIND)),
        );
    }
}

fn spawn_engine<S: Store>(
    store: S,
    root: &str,
    builder: Builder,
    config: Config,
    metrics: EngineMetrics,
    shutdown: CancellationToken,
    events: mpsc::UnboundedReceiver<ClusterEvent>,
) -> JoinHandle<()> {
    let engine = Arc::new(Engine::new(
        Vulcan::new(store, root),
        builder,
        config,
        metrics,
        shutdown,
    ));
    tokio::spawn(
        async move {
            if let Err(error) = engine.check_status().await {
                warn!(%error, "Load balancer store is unreachable");
            }
            engine::run(engine, events).await
        }
        .instrument(info_span!("engine")),
    )
}

// === impl Label ===

impl std::str::FromStr for Label {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok(Self(k.trim().to_string(), v.trim().to_string()))
            }
            _ => bail!("invalid selector {s:?}: expected KEY=VALUE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("romulus").chain(args.iter().copied()))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).expect("defaults must parse");
        assert_eq!(args.engine_config(), Config::default());
        assert_eq!(args.keyspace(), Keyspace::default());
        assert_eq!(args.selector(), Selector::default());
        assert_eq!(args.etcd_peers, vec!["http://127.0.0.1:2379".to_string()]);
        assert_eq!(args.vulcan_root, DEFAULT_ROOT);
        assert_eq!(args.cache_ttl_secs, index::cache::DEFAULT_TTL.as_secs());
        assert!(args.relist_interval_secs < args.cache_ttl_secs);
        assert!(!args.dry_run);
    }

    #[test]
    fn selectors_are_qualified() {
        let args = parse(&[
            "--annotation-prefix=edge.example.com",
            "--selector=tier=public",
            "--selector",
            "app.kubernetes.io/name=web",
        ])
        .expect("args must parse");
        assert_eq!(
            args.selector(),
            Selector::from_iter(vec![
                ("edge.example.com/tier", "public"),
                ("app.kubernetes.io/name", "web"),
            ])
        );

        let args = parse(&["--selector=tier=public", "--selector-annotations"])
            .expect("args must parse");
        assert_eq!(
            args.selector(),
            Selector::from_iter(Some(("romulus/tier", "public"))).with_annotations(true)
        );
    }

    #[test]
    fn etcd_peers_are_comma_separated() {
        let args = parse(&["--etcd-peers=http://10.0.0.1:2379,http://10.0.0.2:2379"])
            .expect("args must parse");
        assert_eq!(
            args.etcd_peers,
            vec![
                "http://10.0.0.1:2379".to_string(),
                "http://10.0.0.2:2379".to_string()
            ]
        );
    }

    #[test]
    fn timings() {
        let args = parse(&[
            "--requeue-delay-secs=1",
            "--resync-interval-secs=30",
            "--retry-max-elapsed-secs=5",
        ])
        .expect("args must parse");
        let config = args.engine_config();
        assert_eq!(config.requeue_delay, Duration::from_secs(1));
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.retry.max_elapsed, Duration::from_secs(5));
        assert_eq!(config.retry.initial, Backoff::default().initial);
    }

    #[test]
    fn invalid_args() {
        assert!(parse(&["--selector=tier"]).is_err());
        assert!(parse(&["--selector==public"]).is_err());
        assert!(parse(&["--resync-interval-secs=0"]).is_err());
        assert!(parse(&["--relist-interval-secs=0"]).is_err());
    }
}
