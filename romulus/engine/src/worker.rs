use crate::{Engine, Error};
use futures::prelude::*;
use romulus_core::LoadBalancer;
use romulus_k8s_api::ClusterEvent;
use romulus_k8s_index::BuildError;
use std::sync::Arc;
use tokio::{
    sync::mpsc,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

/// Handles cluster events until shutdown or until every sender is dropped.
///
/// Failed passes are requeued and refreshed against the cache before they
/// are handled again. Every cached object is reconciled periodically.
///
/// On shutdown the channel is closed and the events already queued on it are
/// handled before returning. Their writes observe the cancellation, so only
/// passes that need no writes complete. Requeued events are dropped.
pub async fn run<L: LoadBalancer>(
    engine: Arc<Engine<L>>,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
) {
    let shutdown = engine.shutdown().clone();
    let config = engine.config().clone();
    let mut requeue = DelayQueue::<ClusterEvent>::new();
    let mut resync = time::interval_at(
        Instant::now() + config.resync_interval,
        config.resync_interval,
    );
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(requeued = requeue.len(), "Shutting down");
                events.close();
                while let Some(event) = events.recv().await {
                    process(&engine, event, &mut requeue).await;
                }
                return;
            }

            event = events.recv() => match event {
                Some(event) => process(&engine, event, &mut requeue).await,
                None => {
                    info!("Event channel closed");
                    return;
                }
            },

            Some(expired) = requeue.next() => {
                match engine.refresh(expired.into_inner()) {
                    Some(event) => process(&engine, event, &mut requeue).await,
                    None => debug!("Requeued object no longer exists"),
                }
            }

            _ = resync.tick() => engine.resync().await,
        }
    }
}

async fn process<L: LoadBalancer>(
    engine: &Engine<L>,
    event: ClusterEvent,
    requeue: &mut DelayQueue<ClusterEvent>,
) {
    let kind = event.kind();
    let op = event.op();
    let obj = event.object();
    let namespace = obj.as_ref().map(|o| o.namespace()).unwrap_or_default();
    let name = obj.as_ref().map(|o| o.name()).unwrap_or_default();

    match engine.handle(&event).await {
        Ok(()) => debug!(%kind, op, %namespace, %name, "Reconciled"),
        Err(Error::Cancelled) => debug!(%kind, op, %namespace, %name, "Pass cancelled"),
        Err(error) if error.is_retryable() => {
            let delay = engine.config().requeue_delay;
            warn!(%error, %kind, op, %namespace, %name, ?delay, "Pass failed; requeueing");
            engine.metrics().requeued();
            requeue.insert(event, delay);
        }
        // Endpoints are watched unfiltered, so most have no selected Service.
        Err(Error::Build(BuildError::MissingService { .. })) => {
            debug!(%kind, op, %namespace, %name, "Service not found")
        }
        Err(error) => warn!(%error, %kind, op, %namespace, %name, "Pass failed"),
    }
}
