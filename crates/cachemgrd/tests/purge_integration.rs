//! Purge integration tests
//!
//! Purges go through the daemon's admin interface or its HTTP listener,
//! with the other mechanism as fallback, and never touch files or state.

use cachemgr_common::{CommandChannel, EnableRequest, PurgeMode, TransitionConflict};
use cachemgr_test::{fixtures::site_fixtures, web_host, FakeHost};
use cachemgrd::{CacheMgr, CacheMgrConfig, HostRegistry, MemoryStateStore, PurgeMechanism};
use std::sync::Arc;

/// Test fixture: example.com enabled on one host
struct TestSetup {
    host: Arc<FakeHost>,
    store: Arc<MemoryStateStore>,
    mgr: CacheMgr,
}

impl TestSetup {
    async fn enabled(request: EnableRequest) -> Self {
        let setup = Self::disabled();
        setup
            .mgr
            .enable("example", &request)
            .await
            .expect("enable failed");
        setup.host.clear_history();
        setup
    }

    fn disabled() -> Self {
        let site = site_fixtures::example_com();
        let host = Arc::new(web_host("web1", &[site.clone()]));
        let mut hosts = HostRegistry::new();
        hosts.register("web1", Arc::clone(&host) as Arc<dyn CommandChannel>);
        let mut config = CacheMgrConfig::default();
        config.sites.push(site);
        let store = Arc::new(MemoryStateStore::new());
        let mgr = CacheMgr::new(config, hosts, store.clone()).expect("Failed to build manager");
        Self { host, store, mgr }
    }
}

#[tokio::test]
async fn test_purge_all_bans_every_hostname() {
    let setup = TestSetup::enabled(EnableRequest::shared(300, "256M")).await;
    let before = setup.host.snapshot();
    let commits = setup.store.commit_count();

    let outcome = setup.mgr.purge("example", &PurgeMode::All).await.unwrap();

    assert_eq!(outcome.mode, "all");
    assert_eq!(outcome.mechanism, PurgeMechanism::Admin);
    assert!(!outcome.fallback_used);
    let commands = setup.host.verifier();
    commands.assert_command_count(1).unwrap();
    commands
        .assert_command_executed(r#"varnishadm -T "127.0.0.1:6082" -S "/etc/varnish/secret""#)
        .unwrap();
    commands
        .assert_command_executed("(example[.]com|www[.]example[.]com)")
        .unwrap();
    assert_eq!(setup.host.snapshot(), before);
    assert_eq!(setup.store.commit_count(), commits);
}

#[tokio::test]
async fn test_purge_single_path_that_is_not_cached_succeeds() {
    let setup = TestSetup::enabled(EnableRequest::shared(300, "256M")).await;

    for _ in 0..2 {
        let outcome = setup
            .mgr
            .purge("example", &PurgeMode::Single("blog/not-cached.html".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome.mechanism, PurgeMechanism::Http);
        assert!(!outcome.fallback_used);
    }

    let commands = setup.host.verifier();
    // One PURGE per hostname and attempt, against the internal endpoint.
    assert_eq!(commands.count_matching("-X PURGE"), 4);
    commands
        .assert_command_executed(r#""http://127.0.0.1:6081/blog/not-cached.html""#)
        .unwrap();
    commands
        .assert_command_executed(r#""Host: www.example.com""#)
        .unwrap();
}

#[tokio::test]
async fn test_purge_pattern_falls_back_to_http_ban() {
    let setup = TestSetup::enabled(EnableRequest::shared(300, "256M")).await;
    setup
        .host
        .fail_when("varnishadm", 1, "Rejected 107: Authentication required");

    let outcome = setup
        .mgr
        .purge("example", &PurgeMode::Pattern("^/assets/".to_string()))
        .await
        .unwrap();

    assert_eq!(outcome.mechanism, PurgeMechanism::Http);
    assert!(outcome.fallback_used);
    let commands = setup.host.verifier();
    commands.assert_command_executed("-X BAN").unwrap();
    commands
        .assert_command_executed(r#""X-Ban-Url: ^/assets/""#)
        .unwrap();
    commands.assert_order("varnishadm", "-X BAN").unwrap();
}

#[tokio::test]
async fn test_purge_fails_when_both_mechanisms_fail() {
    let setup = TestSetup::enabled(EnableRequest::shared(300, "256M")).await;
    setup.host.fail_when("varnishadm", 1, "Rejected 107");
    setup
        .host
        .fail_when("curl", 7, "curl: (7) Failed to connect to 127.0.0.1 port 6081");

    let err = setup.mgr.purge("example", &PurgeMode::All).await.unwrap_err();

    assert_eq!(err.failed_step(), Some("purge-all"));
    assert!(err.to_string().contains("Failed to connect"));
}

#[tokio::test]
async fn test_purge_dedicated_port_targets_public_listener() {
    let setup = TestSetup::enabled(EnableRequest::dedicated(300, "256M", 8080)).await;

    setup
        .mgr
        .purge("example", &PurgeMode::Single("/".to_string()))
        .await
        .unwrap();

    setup
        .host
        .verifier()
        .assert_command_executed(r#""http://127.0.0.1:80/""#)
        .unwrap();
}

#[tokio::test]
async fn test_purge_requires_enabled_site() {
    let setup = TestSetup::disabled();

    let err = setup.mgr.purge("example", &PurgeMode::All).await.unwrap_err();

    assert_eq!(err.transition_conflict(), Some(TransitionConflict::NotEnabled));
    assert!(setup.host.commands().is_empty());
}

#[tokio::test]
async fn test_status_reads_recorded_state_only() {
    let setup = TestSetup::enabled(EnableRequest::shared(300, "256M")).await;

    let status = setup.mgr.status("example").await.unwrap();

    assert_eq!(status.site, site_fixtures::example_com());
    assert!(status.state.enabled);
    assert_eq!(status.state.active_params().map(|p| p.ttl_seconds), Some(300));
    assert!(setup.host.commands().is_empty());
}
