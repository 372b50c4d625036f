//! Host selection against the slot pool.
//!
//! Hosts are tried in file order with a non-blocking acquire each; a full
//! pass without a slot backs off briefly and retries until the deadline.
//! The number of remote jobs a build can hold at once is therefore bounded
//! by the sum of the hosts' limits, machine-wide.

use crate::error::ClientError;
use crate::slots::{SlotGuard, SlotPool};
use homcc_common::host::Host;
use std::time::{Duration, Instant};
use tracing::debug;

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Pick the first host with a free slot, waiting up to `deadline`.
pub async fn select_host(
    hosts: &[Host],
    pool: &SlotPool,
    deadline: Duration,
) -> Result<(Host, SlotGuard), ClientError> {
    if hosts.is_empty() {
        return Err(ClientError::NoHosts);
    }

    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        for host in hosts {
            if let Some(guard) = pool.try_acquire(host)? {
                debug!(host = %host, slot = guard.index, "host selected");
                return Ok((host.clone(), guard));
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= deadline {
            return Err(ClientError::NoSlot);
        }
        tokio::time::sleep(backoff.min(deadline - elapsed)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(specs: &[&str]) -> Vec<Host> {
        specs.iter().map(|s| Host::parse(s).unwrap()).collect()
    }

    #[tokio::test]
    async fn picks_hosts_in_file_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(dir.path());
        let hosts = hosts(&["first/1", "second/1"]);

        let (host, _one) = select_host(&hosts, &pool, Duration::from_secs(1)).await.unwrap();
        assert_eq!(host.name, "first");

        // First host exhausted, the selector advances.
        let (host, _two) = select_host(&hosts, &pool, Duration::from_secs(1)).await.unwrap();
        assert_eq!(host.name, "second");
    }

    #[tokio::test]
    async fn times_out_when_everything_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(dir.path());
        let hosts = hosts(&["only/1"]);

        let _held = pool.try_acquire(&hosts[0]).unwrap().unwrap();
        let err = select_host(&hosts, &pool, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoSlot));
    }

    #[tokio::test]
    async fn in_flight_jobs_cannot_exceed_total_slots() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(dir.path());
        let hosts = hosts(&["a/2", "b/1"]);

        let mut guards = Vec::new();
        for _ in 0..3 {
            let (_, guard) = select_host(&hosts, &pool, Duration::from_secs(1)).await.unwrap();
            guards.push(guard);
        }
        let err = select_host(&hosts, &pool, Duration::from_millis(120))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoSlot));
    }

    #[tokio::test]
    async fn empty_host_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SlotPool::new(dir.path());
        let err = select_host(&[], &pool, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ClientError::NoHosts));
    }
}
