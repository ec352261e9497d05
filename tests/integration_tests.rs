use std::{
    sync::{Arc, Barrier},
    thread,
    time::Duration,
};

use tiered_ratelimit::{
    config::{load_config_from_file, load_config_from_yaml, load_layered_config, AdmissionConfig},
    metrics::Metrics,
    policy::{AdmissionRequest, AuthContext, Tier},
    service::AdmissionService,
    utils::{ManualClock, TimeSource},
    EvictionSweeper,
};

fn create_service(config: &AdmissionConfig) -> (Arc<ManualClock>, Arc<AdmissionService>) {
    let clock = Arc::new(ManualClock::new());
    let metrics = Arc::new(Metrics::new().unwrap());
    let service = AdmissionService::from_config(config, clock.clone(), metrics).unwrap();
    (clock, Arc::new(service))
}

fn free_user(user_id: &str) -> AdmissionRequest {
    AdmissionRequest::authenticated(AuthContext::new(user_id, None), "10.0.0.1")
}

#[test]
fn test_standard_burst_then_refill() {
    let (clock, service) = create_service(&AdmissionConfig::default());
    let request = free_user("alice");

    let remaining: Vec<u32> = (0..5)
        .map(|_| {
            let decision = service.admit(&request).unwrap();
            assert!(decision.allowed);
            decision.remaining.unwrap()
        })
        .collect();
    assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

    clock.advance(Duration::from_millis(500));
    let denied = service.admit(&request).unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after > Duration::ZERO);

    let report = service.report(&denied);
    let rejection = report.rejection.expect("denied request must be rejected");
    assert_eq!(rejection.error, "rate_limit_exceeded");
    assert!(rejection.message.contains("10 requests per minute"));

    clock.advance(Duration::from_secs(6));
    assert!(service.admit(&request).unwrap().allowed);
}

#[test]
fn test_guest_burst_admission() {
    let (_clock, service) = create_service(&AdmissionConfig::default());
    let request = AdmissionRequest::guest("203.0.113.10");

    assert!(service.admit(&request).unwrap().allowed);
    assert!(service.admit(&request).unwrap().allowed);

    let third = service.admit(&request).unwrap();
    assert!(!third.allowed);
    assert_eq!(third.tier, Tier::Guest);
    assert_eq!(third.limit, Some(3));
}

#[test]
fn test_refill_after_one_token_interval() {
    let (clock, service) = create_service(&AdmissionConfig::default());
    let request = AdmissionRequest::guest("203.0.113.11");

    while service.admit(&request).unwrap().allowed {}

    // 3 per minute => 20 seconds per token
    clock.advance(Duration::from_secs(19));
    assert!(!service.admit(&request).unwrap().allowed);

    clock.advance(Duration::from_secs(20));
    assert!(service.admit(&request).unwrap().allowed);
}

#[test]
fn test_identities_are_isolated() {
    let (_clock, service) = create_service(&AdmissionConfig::default());

    while service.admit(&free_user("alice")).unwrap().allowed {}

    let bob = service.admit(&free_user("bob")).unwrap();
    assert!(bob.allowed);
    assert_eq!(bob.remaining, Some(4));

    let guest = service.admit(&AdmissionRequest::guest("10.0.0.1")).unwrap();
    assert!(guest.allowed);
}

#[test]
fn test_concurrent_first_access_yields_exactly_capacity() {
    let (_clock, service) = create_service(&AdmissionConfig::default());
    let threads = 64;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let service = service.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                service.admit(&free_user("contended")).unwrap().allowed
            })
        })
        .collect();

    let allowed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|allowed| *allowed)
        .count();

    assert_eq!(allowed, 5);
    assert_eq!(service.registry().len(), 1);
    assert_eq!(service.metrics().decisions_total("standard", "denied"), 59.0);
}

#[test]
fn test_unlimited_roles_never_consult_a_bucket() {
    let (_clock, service) = create_service(&AdmissionConfig::default());

    for role in ["user", "admin"] {
        let request = AdmissionRequest::authenticated(AuthContext::new("vip", Some(role)), "10.0.0.2");
        for _ in 0..500 {
            let decision = service.admit(&request).unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.tier, Tier::Unlimited);
        }
    }

    assert!(service.registry().is_empty());
}

#[test]
fn test_evicted_identity_returns_fresh() {
    let (clock, service) = create_service(&AdmissionConfig::default());
    let request = AdmissionRequest::guest("198.51.100.99");

    while service.admit(&request).unwrap().allowed {}

    clock.advance(Duration::from_secs(10 * 60 + 1));
    assert_eq!(service.registry().evict(), 1);
    assert!(!service.registry().contains(Tier::Guest, "198.51.100.99"));

    let decision = service.admit(&request).unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.remaining, Some(1));
}

#[test]
fn test_configured_tiers_from_yaml() {
    let yaml = r#"
tiers:
  standard:
    burst: 1
    requests_per_unit: 1
    unit: second
    remediation:
      action: upgrade
      url: /pricing
  guest:
    burst: 1
    requests_per_unit: 1
    unit: hour
    remediation:
      action: signup
      url: /signup
unlimited_roles: [staff]
"#;
    let config = load_config_from_yaml(yaml).unwrap();
    let (clock, service) = create_service(&config);

    let staff = AdmissionRequest::authenticated(AuthContext::new("s-1", Some("staff")), "10.0.0.3");
    assert_eq!(service.admit(&staff).unwrap().tier, Tier::Unlimited);

    // "user" is no longer privileged under this configuration
    let user = AdmissionRequest::authenticated(AuthContext::new("u-1", Some("user")), "10.0.0.3");
    assert!(service.admit(&user).unwrap().allowed);
    let denied = service.admit(&user).unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Duration::from_secs(1));

    let rejection = service.report(&denied).rejection.unwrap();
    let body = serde_json::to_value(&rejection).unwrap();
    assert_eq!(body["upgrade_url"], "/pricing");
    assert_eq!(body["message"], "Free tier allows 1 requests per second. Upgrade to premium for unlimited access.");

    clock.advance(Duration::from_secs(1));
    assert!(service.admit(&user).unwrap().allowed);
}

#[test]
fn test_capacity_bound_under_mixed_traffic() {
    let (clock, service) = create_service(&AdmissionConfig::default());
    let start = clock.unix_now();

    for step in 0..300u64 {
        clock.advance(Duration::from_millis((step * 733) % 9_000));
        let request = free_user(if step % 3 == 0 { "x" } else { "y" });
        let decision = service.admit(&request).unwrap();
        let remaining = decision.remaining.unwrap();
        assert!(remaining <= 4, "remaining {} exceeds capacity after a consume", remaining);
        assert!(decision.reset_at.unwrap() >= start);
    }
}

#[tokio::test]
async fn test_sweeper_lifecycle() {
    let (clock, service) = create_service(&AdmissionConfig::default());
    service.admit(&AdmissionRequest::guest("192.0.2.50")).unwrap();
    clock.advance(Duration::from_secs(11 * 60));

    let sweeper = EvictionSweeper::start_with_interval(
        service.registry().clone(),
        service.metrics().clone(),
        Duration::from_millis(10),
    );

    for _ in 0..100 {
        if service.registry().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sweeper.stop().await;

    assert!(service.registry().is_empty());
}

#[test]
fn test_shipped_config_matches_defaults() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/admission.yaml");

    let from_file = load_config_from_file(path).unwrap();
    let layered = load_layered_config(Some(path)).unwrap();

    for config in [from_file, layered] {
        assert_eq!(config.tiers.standard.burst, 5);
        assert_eq!(config.tiers.standard.requests_per_unit, 10);
        assert_eq!(config.tiers.guest.burst, 2);
        assert_eq!(config.tiers.guest.requests_per_unit, 3);
        assert_eq!(config.registry.idle_timeout_secs, 600);
        assert_eq!(config.trusted_proxies, AdmissionConfig::default().trusted_proxies);
        assert_eq!(config.unlimited_roles, vec!["user".to_string(), "admin".to_string()]);
    }
}
