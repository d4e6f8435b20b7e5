// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use assert_matches::assert_matches;

use common::init_logger;

use volguard::{
    engine::{
        sim::SimCluster, AddressFence, BlocklistMode, ClusterConfig, CommandGateway, Context,
        FenceConfig, NetworkFence,
    },
    guard::GuardError,
};

mod common;

fn network_fence(cluster: &Arc<SimCluster>, ranges: &[&str]) -> NetworkFence {
    network_fence_with(cluster, ranges, FenceConfig::default())
}

fn network_fence_with(
    cluster: &Arc<SimCluster>,
    ranges: &[&str],
    config: FenceConfig,
) -> NetworkFence {
    let gateway: Arc<dyn CommandGateway> = Arc::clone(cluster) as Arc<dyn CommandGateway>;
    NetworkFence::new(
        AddressFence::new(
            ranges.iter().map(|r| r.to_string()).collect(),
            ClusterConfig::default(),
        )
        .unwrap(),
        gateway,
        config,
    )
}

#[tokio::test]
// Fencing and unfencing on a range capable cluster leaves no entries.
async fn test_fence_round_trip_ranges() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(true));
    let fence = network_fence(&cluster, &["10.0.0.0/30", "2001:db8::/126"]);
    let ctx = Context::background();

    assert_eq!(fence.add_fence(&ctx).await.unwrap(), BlocklistMode::Range);
    assert_eq!(
        cluster.blocklisted_ranges(),
        vec!["10.0.0.0/30".to_string(), "2001:db8::/126".to_string()]
    );
    assert!(cluster.blocklisted_addresses().is_empty());

    assert_eq!(fence.remove_fence(&ctx).await.unwrap(), BlocklistMode::Range);
    assert!(cluster.blocklisted_ranges().is_empty());
}

#[tokio::test]
// An older cluster gets one entry per address, and removal finds them all.
async fn test_fence_round_trip_per_address() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(false));
    let fence = network_fence(&cluster, &["10.0.0.0/30", "10.0.1.7/32"]);
    let ctx = Context::background();

    assert_eq!(
        fence.add_fence(&ctx).await.unwrap(),
        BlocklistMode::PerAddress
    );
    let addresses: Vec<String> = cluster
        .blocklisted_addresses()
        .into_iter()
        .map(|(address, _)| address)
        .collect();
    assert_eq!(
        addresses,
        vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.1.7"]
    );
    // Only the first range probes for range support.
    assert_eq!(
        cluster
            .commands()
            .iter()
            .filter(|c| c.starts_with("osd blocklist range"))
            .count(),
        1
    );

    assert_eq!(
        fence.remove_fence(&ctx).await.unwrap(),
        BlocklistMode::PerAddress
    );
    assert!(cluster.blocklisted_addresses().is_empty());
}

#[tokio::test]
// A failure other than an unknown command aborts the fence.
async fn test_fence_hard_failure() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(true));
    cluster.fail_commands_matching("range add 10.0.0.4", "Error EACCES: access denied");
    let fence = network_fence(&cluster, &["10.0.0.0/30", "10.0.0.4/30"]);

    let err = fence.add_fence(&Context::background()).await.unwrap_err();
    assert_matches!(err.root_cause(), GuardError::CommandFailed { .. });
    assert_eq!(cluster.blocklisted_ranges(), vec!["10.0.0.0/30".to_string()]);
}

#[tokio::test]
// Sessions inside the ranges are evicted once; others are untouched.
async fn test_evict_and_unfence() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(true));
    cluster.add_session(4101, "10.0.0.1:0/1001");
    cluster.add_session(4102, "10.0.0.2:0/1002");
    cluster.add_session(4103, "192.168.1.9:0/1003");
    cluster.add_raw_session("not a descriptor");
    let fence = network_fence(&cluster, &["10.0.0.0/30", "10.0.0.0/31"]);
    let ctx = Context::background();

    let evicted = fence.evict_and_fence(&ctx).await.unwrap();
    assert_eq!(evicted, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
    assert_eq!(cluster.evicted(), vec![4101, 4102]);
    assert_eq!(cluster.blocklisted_ranges().len(), 2);
    assert_eq!(cluster.blocklisted_addresses().len(), 2);

    fence.remove_eviction(&ctx).await.unwrap();
    assert!(cluster.blocklisted_ranges().is_empty());
    assert!(cluster.blocklisted_addresses().is_empty());
}

#[tokio::test]
// A client listing that is not JSON is a protocol error and blocks nothing.
async fn test_evict_bad_listing() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(true));
    cluster.set_session_listing("<html>oops</html>");
    let fence = network_fence(&cluster, &["10.0.0.0/30"]);

    assert_matches!(
        fence.evict_and_fence(&Context::background()).await,
        Err(GuardError::ProtocolError(_))
    );
    assert!(cluster.blocklisted_ranges().is_empty());
}

#[tokio::test]
// A cancelled context stops the fence before any command is sent.
async fn test_fence_cancelled() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(true));
    let fence = network_fence(&cluster, &["10.0.0.0/30"]);
    let ctx = Context::background();
    ctx.cancel();

    let err = fence.add_fence(&ctx).await.unwrap_err();
    assert!(err.is_context_error());
    assert!(cluster.commands().is_empty());
}

#[tokio::test]
// Without range support, a block larger than the expansion limit is
// refused before any of its addresses is blocklisted.
async fn test_fence_per_address_limit() {
    init_logger();
    let cluster = Arc::new(SimCluster::new(false));
    let config = FenceConfig {
        max_expanded_host_bits: 2,
        ..Default::default()
    };
    let fence = network_fence_with(&cluster, &["10.0.0.0/30", "10.0.1.0/29"], config);

    assert_matches!(
        fence.add_fence(&Context::background()).await,
        Err(GuardError::InvalidRange { .. })
    );
    let addresses: Vec<String> = cluster
        .blocklisted_addresses()
        .into_iter()
        .map(|(address, _)| address)
        .collect();
    assert_eq!(addresses, vec!["10.0.0.0", "10.0.0.1", "10.0.0.2", "10.0.0.3"]);
}
