//! Time-based invalidation and eviction of nodes.
//!
//! Expiry happens in three places: lazily when a node is accessed, through a precise timer per
//! auto-invalidating node, and in a periodic sweep that also evicts unused nodes.

use std::sync::Weak;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use super::graph::NodeTable;
use super::node::{NodeId, NodeState};
use super::service::{ComputeService, ServiceInner};
use super::ComputedKey;

/// Auto-invalidation deadline of the value stored as `version`.
#[derive(Debug)]
pub(crate) struct Deadline {
    pub key: ComputedKey,
    pub version: u64,
    pub at: Instant,
}

/// Invalidates a consistent node on access when it is overdue or was left unused for too long.
///
/// An unused node is only expired when nothing consistent depends on it.
pub(crate) fn expire_on_access(table: &mut NodeTable, id: NodeId, now: Instant) -> Vec<ComputedKey> {
    let node = table.get(id);
    if node.state != NodeState::Consistent {
        return Vec::new();
    }
    let unused = node.is_unused(now) && !table.has_live_dependents(id);
    if node.is_outdated(now) || unused {
        tracing::trace!("Expiring {} on access", node.key);
        table.invalidate(id)
    } else {
        Vec::new()
    }
}

impl ComputeService {
    /// Applies every overdue auto-invalidation and evicts nodes whose keep-alive elapsed.
    ///
    /// Nodes that are computing, or that consistent dependents still rely on, are kept.
    /// Returns the number of evicted nodes.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut invalidated = Vec::new();
        let (evicted, remaining) = {
            let mut table = self.inner.table.lock();

            for id in table.ids() {
                let node = table.get(id);
                if node.state == NodeState::Consistent && node.is_outdated(now) {
                    invalidated.extend(table.invalidate(id));
                }
            }

            let mut evict = Vec::new();
            for id in table.ids() {
                let node = table.get(id);
                if node.state == NodeState::Computing
                    || !node.is_unused(now)
                    || table.has_live_dependents(id)
                {
                    continue;
                }
                if node.state == NodeState::Consistent {
                    invalidated.extend(table.invalidate(id));
                }
                evict.push(id);
            }

            for id in &evict {
                let node = table.remove(*id);
                tracing::trace!("Evicted {}", node.key);
            }
            (evict.len(), table.len())
        };

        metric!(counter("computed.evicted") += evicted as i64);
        metric!(gauge("computed.nodes") = remaining as u64);
        if evicted > 0 {
            tracing::debug!("Evicted {} unused nodes, {} remaining", evicted, remaining);
        }
        self.publish(invalidated);
        evicted
    }
}

pub(crate) fn spawn_expiry_tasks(
    service: &ComputeService,
    timers: mpsc::UnboundedReceiver<Deadline>,
    sweep_interval: Duration,
) {
    let inner = std::sync::Arc::downgrade(&service.inner);
    let shutdown = service.inner.shutdown.clone();

    tokio::spawn(run_timers(inner.clone(), timers, shutdown.clone()));
    // A zero interval disables the periodic sweep, leaving only lazy expiry on access.
    if !sweep_interval.is_zero() {
        tokio::spawn(run_sweeps(inner, sweep_interval, shutdown));
    }
}

async fn run_timers(
    inner: Weak<ServiceInner>,
    mut incoming: mpsc::UnboundedReceiver<Deadline>,
    shutdown: CancellationToken,
) {
    let mut queue = DelayQueue::new();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            deadline = incoming.recv() => match deadline {
                Some(Deadline { key, version, at }) => {
                    queue.insert_at((key, version), at);
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let (key, version) = expired.into_inner();
                let Some(inner) = inner.upgrade() else { break };
                let count = ComputeService { inner }.invalidate_version(&key, version);
                if count > 0 {
                    tracing::debug!("Auto-invalidated {} and {} dependents", key, count - 1);
                }
            }
        }
    }
    tracing::trace!("Auto-invalidation timers stopped");
}

async fn run_sweeps(inner: Weak<ServiceInner>, period: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        ComputeService { inner }.sweep();
    }
    tracing::trace!("Sweeper stopped");
}
