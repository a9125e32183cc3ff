//! Hostname resolution for feeds that list names instead of addresses.

use futures::stream::{self, StreamExt};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::warn;

/// Per-lookup timeout.
const DNS_TIMEOUT_SECS: u64 = 5;

/// Default resolution concurrency ceiling.
pub const DEFAULT_PARALLEL_QUERIES: usize = 10;

/// Resolve hostnames to their A records in parallel, bounded by
/// `parallel` concurrent lookups. Unresolvable names are dropped with a
/// warning; only IPv4 answers are kept.
pub async fn resolve_a_records(hostnames: Vec<String>, parallel: usize) -> Vec<Ipv4Addr> {
    let lookups = hostnames.into_iter().map(|host| async move {
        let blocking = {
            let host = host.clone();
            tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&host))
        };
        match tokio::time::timeout(Duration::from_secs(DNS_TIMEOUT_SECS), blocking).await {
            Ok(Ok(Ok(addrs))) => addrs
                .into_iter()
                .filter_map(|a| match a {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Ok(Ok(Err(e))) => {
                warn!("failed to resolve {}: {}", host, e);
                Vec::new()
            }
            Ok(Err(e)) => {
                warn!("resolver task for {} failed: {}", host, e);
                Vec::new()
            }
            Err(_) => {
                warn!("resolving {} timed out", host);
                Vec::new()
            }
        }
    });

    stream::iter(lookups)
        .buffer_unordered(parallel.max(1))
        .collect::<Vec<Vec<Ipv4Addr>>>()
        .await
        .into_iter()
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unresolvable_names_are_dropped() {
        let out = resolve_a_records(
            vec!["definitely-not-a-real-host.invalid".to_string()],
            4,
        )
        .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_empty_input() {
        assert!(resolve_a_records(Vec::new(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_localhost_resolves_v4_only() {
        let out = resolve_a_records(vec!["localhost".to_string()], 1).await;
        // Every answer, if any, is an IPv4 address by construction.
        for addr in out {
            assert!(addr.octets().len() == 4);
        }
    }
}
