use privatecaptcha_shield::{Config, IpBuckets};
use std::net::SocketAddr;

fn client_addr() -> SocketAddr {
    "198.51.100.42:12345".parse().unwrap()
}

/// An authenticated session raises its own IP's portal-pool bucket to the
/// configured `authenticated_bucket_*` parameters (the "legitimizing a
/// client" flow, spec.md §4.5), preserving the bucket's current level.
/// Subsequent requests from that IP observe the elevated capacity instead
/// of the pool's tighter unauthenticated default.
#[test]
fn authenticating_raises_the_portal_bucket_above_its_default_capacity() {
    let config = Config::default();
    assert!(config.authenticated_bucket_capacity > config.default_bucket_capacity);

    let portal_buckets = IpBuckets::new(
        "portal",
        config.rate_limit_header.clone(),
        config.max_buckets,
        config.default_bucket_capacity,
        config.default_bucket_interval,
    )
    .unwrap();

    // Consume the default pool right up to its capacity.
    let mut last_added = 0;
    for _ in 0..config.default_bucket_capacity {
        let (_key, _prev, added) = portal_buckets
            .update_for_request(None, Some(client_addr()), 1, 0)
            .unwrap();
        last_added = added;
    }
    assert_eq!(last_added, 1);
    let (key, _prev, overflowed) = portal_buckets
        .update_for_request(None, Some(client_addr()), 1, 0)
        .unwrap();
    assert_eq!(overflowed, 0, "default capacity should already be exhausted");

    // The session authenticates: legitimize this IP's bucket using the
    // authenticated parameters from Config, preserving its current level.
    let level_before = portal_buckets.level(&key, 0);
    portal_buckets
        .update_limits_for_key(
            key.clone(),
            config.authenticated_bucket_capacity,
            config.authenticated_bucket_interval,
            0,
        )
        .unwrap();
    assert_eq!(
        portal_buckets.level(&key, 0),
        level_before,
        "reconfiguring must preserve the bucket's current level"
    );

    // The same IP can now be admitted well past the old default capacity.
    let mut admitted = 0u32;
    for _ in 0..(config.authenticated_bucket_capacity - config.default_bucket_capacity) {
        let (_key, _prev, added) = portal_buckets
            .update_for_request(None, Some(client_addr()), 1, 0)
            .unwrap();
        admitted += added;
    }
    assert!(
        admitted > 0,
        "the legitimized client should be admitted beyond the unauthenticated default"
    );
}

/// A distinct, unauthenticated IP sharing the same portal pool is
/// unaffected by another client's legitimization.
#[test]
fn legitimizing_one_client_does_not_affect_another() {
    let config = Config::default();
    let portal_buckets = IpBuckets::new(
        "portal",
        config.rate_limit_header.clone(),
        config.max_buckets,
        config.default_bucket_capacity,
        config.default_bucket_interval,
    )
    .unwrap();

    let authenticated_addr: SocketAddr = "198.51.100.7:1".parse().unwrap();
    let bystander_addr: SocketAddr = "198.51.100.8:1".parse().unwrap();

    let (authenticated_key, _, _) = portal_buckets
        .update_for_request(None, Some(authenticated_addr), 1, 0)
        .unwrap();
    portal_buckets
        .update_limits_for_key(
            authenticated_key,
            config.authenticated_bucket_capacity,
            config.authenticated_bucket_interval,
            0,
        )
        .unwrap();

    for _ in 0..config.default_bucket_capacity {
        let (_key, _prev, added) = portal_buckets
            .update_for_request(None, Some(bystander_addr), 1, 0)
            .unwrap();
        assert_eq!(added, 1);
    }
    let (_key, _prev, overflowed) = portal_buckets
        .update_for_request(None, Some(bystander_addr), 1, 0)
        .unwrap();
    assert_eq!(
        overflowed, 0,
        "the bystander's bucket keeps the pool's unauthenticated default capacity"
    );
}
