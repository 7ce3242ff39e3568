//! Resource usage streaming and normalization.

use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use super::Environment;
use crate::events::Event;
use crate::runtime::{RuntimeError, RuntimeStats};

pub type PollResult<T> = Result<T, PollError>;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("cannot enable resource polling on a stopped workload")]
    NotRunning,

    #[error("failed to attach to container stats: {0}")]
    Attach(#[source] RuntimeError),

    #[error("resource polling cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One normalized usage reading.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    /// Milliseconds since the container started.
    pub uptime: i64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    /// Percent of one core, so up to 100 × cores.
    pub cpu_absolute: f64,
    /// Summed over every attached interface.
    pub network: NetworkSample,
}

impl StatsSample {
    pub fn from_stats(
        stats: &RuntimeStats,
        uptime: i64,
        accounting: &dyn UsageAccountingStrategy,
    ) -> Self {
        let network = stats
            .networks
            .iter()
            .flat_map(|networks| networks.values())
            .fold(NetworkSample::default(), |acc, nw| NetworkSample {
                rx_bytes: acc.rx_bytes + nw.rx_bytes,
                tx_bytes: acc.tx_bytes + nw.tx_bytes,
            });

        Self {
            uptime,
            memory_bytes: accounting.memory_bytes(stats),
            memory_limit_bytes: stats.memory_stats.limit,
            cpu_absolute: accounting.cpu_percent(stats),
            network,
        }
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// How a host reports memory and CPU usage.
pub trait UsageAccountingStrategy: Send + Sync {
    fn memory_bytes(&self, stats: &RuntimeStats) -> u64;
    /// Absolute CPU usage, rounded to three decimals.
    fn cpu_percent(&self, stats: &RuntimeStats) -> f64;
}

/// cgroup accounting, matching what `docker stats` shows.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupAccounting;

impl UsageAccountingStrategy for CgroupAccounting {
    fn memory_bytes(&self, stats: &RuntimeStats) -> u64 {
        let memory = &stats.memory_stats;
        let counter = |name: &str| memory.stats.as_ref().and_then(|s| s.get(name)).copied();

        if let Some(cache) = counter("total_inactive_file")
            && cache < memory.usage
        {
            return memory.usage - cache;
        }
        if let Some(cache) = counter("inactive_file")
            && cache < memory.usage
        {
            return memory.usage - cache;
        }
        memory.usage
    }

    fn cpu_percent(&self, stats: &RuntimeStats) -> f64 {
        let cpu = &stats.cpu_stats;
        let pre = &stats.precpu_stats;
        let cpu_delta = cpu.cpu_usage.total_usage as f64 - pre.cpu_usage.total_usage as f64;
        let system_delta = cpu.system_cpu_usage as f64 - pre.system_cpu_usage as f64;

        let cpus = if cpu.online_cpus > 0 {
            cpu.online_cpus as f64
        } else {
            cpu.cpu_usage.percpu_usage.as_ref().map_or(0, Vec::len) as f64
        };

        if cpu_delta <= 0.0 || system_delta <= 0.0 {
            return 0.0;
        }
        round3(cpu_delta / system_delta * cpus * 100.0)
    }
}

/// Windows accounting: private working set and 100ns CPU intervals.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkingSetAccounting;

impl UsageAccountingStrategy for WorkingSetAccounting {
    fn memory_bytes(&self, stats: &RuntimeStats) -> u64 {
        stats.memory_stats.privateworkingset
    }

    fn cpu_percent(&self, stats: &RuntimeStats) -> f64 {
        let (Some(read), Some(preread)) = (stats.read, stats.preread) else {
            return 0.0;
        };
        let elapsed_ns = (read - preread).num_nanoseconds().unwrap_or(0);
        let possible = (elapsed_ns / 100) as f64 * stats.num_procs as f64;
        let used = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage) as f64;

        if possible <= 0.0 || used <= 0.0 {
            return 0.0;
        }
        round3(used / possible * 100.0)
    }
}

/// Stream usage for `env` into its event bus until the workload goes offline,
/// the stream ends or `ctx` is cancelled.
#[instrument(skip_all, fields(workload = %env.id()))]
pub async fn poll(env: &Environment, ctx: &CancellationToken) -> PollResult<()> {
    if env.state().is_offline() {
        return Err(PollError::NotRunning);
    }

    info!("starting resource polling for {}", env.id());
    let mut state_rx = env.subscribe_state();
    let container = env.container_ref();

    let mut stream = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(PollError::Cancelled),
        result = env.runtime().stats(&container) => result.map_err(PollError::Attach)?,
    };

    let mut uptime = match env.uptime(ctx).await {
        Ok(uptime) => uptime,
        Err(e) => {
            warn!("failed to calculate uptime for {}: {}", env.id(), e);
            0
        }
    };

    let accounting = env.platform().accounting();
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(PollError::Cancelled),
            _ = state_rx.wait_for(|state| state.is_offline()) => {
                debug!("{} went offline, stopping resource polling", env.id());
                return Ok(());
            }
            frame = stream.next() => frame,
        };

        let stats = match frame {
            None => {
                debug!("stats stream for {} ended", env.id());
                return Ok(());
            }
            Some(Err(e)) if e.is_end_of_stream() => {
                debug!("stats stream for {} closed: {}", env.id(), e);
                return Ok(());
            }
            Some(Err(e)) => {
                warn!("error while processing stats for {}: {}", env.id(), e);
                return Ok(());
            }
            Some(Ok(stats)) => stats,
        };

        // A frame may have been in flight while the workload stopped.
        if env.state().is_offline() {
            debug!("{} offline while polling was active, stopping", env.id());
            return Ok(());
        }

        if let (Some(read), Some(preread)) = (stats.read, stats.preread) {
            uptime += (read - preread).num_milliseconds();
        }

        let sample = StatsSample::from_stats(&stats, uptime, accounting);
        env.events().publish(Event::Resource(sample));
    }
}
