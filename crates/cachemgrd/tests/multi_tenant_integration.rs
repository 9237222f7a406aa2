//! Multi-tenant integration tests
//!
//! Several sites share one cache daemon per host: their policies, include
//! lines and recorded states must stay independent, and the daemon runs
//! exactly while one of them is enabled.

use cachemgr_common::{CacheMgrError, CommandChannel, EnableRequest, Site};
use cachemgr_test::{
    fixtures::site_fixtures, origin_config_path, site_include, site_policy_path, web_host,
    FakeHost, HostVerifier, DAEMON_SERVICE, MASTER_VCL,
};
use cachemgrd::{CacheMgr, CacheMgrConfig, DaemonAction, DesiredStateStore, HostRegistry, MemoryStateStore};
use std::sync::Arc;

/// Test fixture: the catalog's hosts with their sites
struct TestSetup {
    hosts: Vec<Arc<FakeHost>>,
    store: Arc<MemoryStateStore>,
    mgr: CacheMgr,
}

impl TestSetup {
    fn new(sites: &[Site]) -> Self {
        let mut host_ids: Vec<&str> = sites.iter().map(|s| s.host.as_str()).collect();
        host_ids.sort_unstable();
        host_ids.dedup();

        let mut registry = HostRegistry::new();
        let mut hosts = Vec::new();
        for id in host_ids {
            let on_host: Vec<Site> = sites.iter().filter(|s| s.host == id).cloned().collect();
            let host = Arc::new(web_host(id, &on_host));
            registry.register(id, Arc::clone(&host) as Arc<dyn CommandChannel>);
            hosts.push(host);
        }

        let mut config = CacheMgrConfig::default();
        config.sites = sites.to_vec();
        let store = Arc::new(MemoryStateStore::new());
        let mgr = CacheMgr::new(config, registry, store.clone()).expect("Failed to build manager");
        Self { hosts, store, mgr }
    }

    fn host(&self, id: &str) -> &FakeHost {
        self.hosts
            .iter()
            .find(|h| h.host() == id)
            .expect("unknown host")
    }
}

fn shared() -> EnableRequest {
    EnableRequest::shared(300, "256M")
}

#[tokio::test]
async fn test_disabling_one_site_leaves_the_other_untouched() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);
    let host = setup.host("web1");

    setup.mgr.enable(&b.id, &shared()).await.unwrap();
    let b_state = setup.store.get(&b.id).await.unwrap();
    let b_policy = host.file(&site_policy_path(&b)).unwrap();

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    let report = setup.mgr.disable(&a.id).await.unwrap();

    assert_eq!(report.daemon, DaemonAction::Reloaded);
    assert!(host.is_active(DAEMON_SERVICE));
    assert_eq!(setup.store.get(&b.id).await.unwrap(), b_state);

    let verifier = HostVerifier::new(host);
    verifier
        .assert_file_content(&site_policy_path(&b), &b_policy)
        .unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&b), 1).unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&a), 0).unwrap();
    verifier.assert_file_absent(&site_policy_path(&a)).unwrap();

    // Last tenant gone: the daemon stops.
    let report = setup.mgr.disable(&b.id).await.unwrap();
    assert_eq!(report.daemon, DaemonAction::Stopped);
    assert!(!host.is_active(DAEMON_SERVICE));
}

#[tokio::test]
async fn test_second_tenant_reloads_instead_of_restarting() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);
    let host = setup.host("web1");

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    host.clear_history();
    let report = setup.mgr.enable(&b.id, &shared()).await.unwrap();

    assert!(report
        .workflow
        .satisfied
        .contains(&"write-daemon-config".to_string()));
    let commands = host.verifier();
    commands
        .assert_command_executed("systemctl reload \"varnish\"")
        .unwrap();
    commands.assert_command_not_executed("systemctl restart").unwrap();
}

#[tokio::test]
async fn test_concurrent_enables_keep_one_include_each() {
    let (a, b, c) = (
        site_fixtures::example_com(),
        site_fixtures::shop(),
        site_fixtures::blog(),
    );
    let setup = TestSetup::new(&[a.clone(), b.clone(), c.clone()]);

    let request = shared();
    let (ra, rb, rc) = tokio::join!(
        setup.mgr.enable(&a.id, &request),
        setup.mgr.enable(&b.id, &request),
        setup.mgr.enable(&c.id, &request),
    );
    ra.unwrap();
    rb.unwrap();
    rc.unwrap();

    let verifier = HostVerifier::new(setup.host("web1"));
    for site in [&a, &b, &c] {
        verifier
            .assert_line_count(MASTER_VCL, &site_include(site), 1)
            .unwrap();
        verifier.assert_file_exists(&site_policy_path(site)).unwrap();
    }

    let (ra, rb) = tokio::join!(setup.mgr.disable(&a.id), setup.mgr.disable(&b.id));
    ra.unwrap();
    rb.unwrap();

    verifier.assert_line_count(MASTER_VCL, &site_include(&a), 0).unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&b), 0).unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&c), 1).unwrap();
    assert!(setup.host("web1").is_active(DAEMON_SERVICE));
}

#[tokio::test]
async fn test_dedicated_port_requires_exclusive_host() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);
    let host = setup.host("web1");

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    host.clear_history();

    let err = setup
        .mgr
        .enable(&b.id, &EnableRequest::dedicated(300, "256M", 8080))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheMgrError::InvalidConfig { ref field, .. } if field == "topology"));
    assert!(host.commands().is_empty());
    assert!(!setup.store.get(&b.id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_shared_port_refused_next_to_dedicated() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);

    setup
        .mgr
        .enable(&a.id, &EnableRequest::dedicated(300, "256M", 8080))
        .await
        .unwrap();
    let err = setup.mgr.enable(&b.id, &shared()).await.unwrap_err();

    assert!(err.is_rejected_locally());

    // Once the dedicated site is gone the host is free again.
    setup.mgr.disable(&a.id).await.unwrap();
    setup.mgr.enable(&b.id, &shared()).await.unwrap();
}

#[tokio::test]
async fn test_sites_on_other_hosts_do_not_count() {
    let (a, remote) = (site_fixtures::example_com(), site_fixtures::remote());
    let setup = TestSetup::new(&[a.clone(), remote.clone()]);

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    setup
        .mgr
        .enable(&remote.id, &EnableRequest::dedicated(300, "256M", 8080))
        .await
        .unwrap();

    let report = setup.mgr.disable(&a.id).await.unwrap();
    assert_eq!(report.daemon, DaemonAction::Stopped);
    assert!(!setup.host("web1").is_active(DAEMON_SERVICE));
    assert!(setup.host("web2").is_active(DAEMON_SERVICE));
}

#[tokio::test]
async fn test_stray_include_keeps_daemon_running() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);
    let host = setup.host("web1");

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    // Another tenant's include without a recorded enable, e.g. mid-enable.
    let master = host.file(MASTER_VCL).unwrap();
    host.set_file(MASTER_VCL, &format!("{}{}\n", master, site_include(&b)));

    let report = setup.mgr.disable(&a.id).await.unwrap();

    assert_eq!(report.daemon, DaemonAction::Reloaded);
    assert!(host.is_active(DAEMON_SERVICE));
}

#[tokio::test]
async fn test_failed_stop_is_not_fatal() {
    let a = site_fixtures::example_com();
    let setup = TestSetup::new(&[a.clone()]);
    let host = setup.host("web1");

    setup.mgr.enable(&a.id, &shared()).await.unwrap();
    host.fail_when("systemctl stop", 1, "Failed to stop varnish.service: Access denied");

    let report = setup.mgr.disable(&a.id).await.unwrap();

    assert!(matches!(report.daemon, DaemonAction::StopFailed { .. }));
    assert!(!setup.store.get(&a.id).await.unwrap().enabled);
}

/// Runs a dedicated_port enable of `a` next to a shared_port enable of `b`
/// and checks that exactly one of them took the host.
async fn race_topologies(dedicated_first: bool) {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);
    let host = setup.host("web1");
    let origin_a = host.file(&origin_config_path(&a.domain)).unwrap();

    let dedicated = EnableRequest::dedicated(300, "256M", 8080);
    let shared = shared();
    let (ra, rb) = if dedicated_first {
        tokio::join!(setup.mgr.enable(&a.id, &dedicated), setup.mgr.enable(&b.id, &shared))
    } else {
        let (rb, ra) =
            tokio::join!(setup.mgr.enable(&b.id, &shared), setup.mgr.enable(&a.id, &dedicated));
        (ra, rb)
    };

    assert!(ra.is_ok() != rb.is_ok(), "exactly one enable may win: {ra:?} / {rb:?}");
    let loser_err = match (&ra, &rb) {
        (Err(e), _) | (_, Err(e)) => e,
        _ => unreachable!(),
    };
    assert!(matches!(loser_err, CacheMgrError::InvalidConfig { field, .. } if field == "topology"));

    let verifier = HostVerifier::new(host);
    if ra.is_ok() {
        assert!(setup.store.get(&a.id).await.unwrap().enabled);
        assert!(!setup.store.get(&b.id).await.unwrap().enabled);
        verifier.assert_file_absent(&site_policy_path(&b)).unwrap();
        verifier.assert_line_count(MASTER_VCL, &site_include(&b), 0).unwrap();
    } else {
        assert!(setup.store.get(&b.id).await.unwrap().enabled);
        assert!(!setup.store.get(&a.id).await.unwrap().enabled);
        verifier.assert_file_absent(&site_policy_path(&a)).unwrap();
        verifier
            .assert_file_content(&origin_config_path(&a.domain), &origin_a)
            .unwrap();
    }
}

#[tokio::test]
async fn test_concurrent_dedicated_and_shared_enables_cannot_both_win() {
    race_topologies(true).await;
}

#[tokio::test]
async fn test_concurrent_shared_and_dedicated_enables_cannot_both_win() {
    race_topologies(false).await;
}

#[tokio::test]
async fn test_concurrent_dedicated_enables_cannot_both_win() {
    let (a, b) = (site_fixtures::example_com(), site_fixtures::shop());
    let setup = TestSetup::new(&[a.clone(), b.clone()]);

    let req_a = EnableRequest::dedicated(300, "256M", 8080);
    let req_b = EnableRequest::dedicated(300, "256M", 8081);
    let (ra, rb) = tokio::join!(
        setup.mgr.enable(&a.id, &req_a),
        setup.mgr.enable(&b.id, &req_b),
    );

    assert!(ra.is_ok() != rb.is_ok());
    let enabled = [
        setup.store.get(&a.id).await.unwrap().enabled,
        setup.store.get(&b.id).await.unwrap().enabled,
    ];
    assert_eq!(enabled.iter().filter(|e| **e).count(), 1);

    // The claim of a failed enable does not outlive it.
    let loser = if ra.is_ok() { &b } else { &a };
    let winner = if ra.is_ok() { &a } else { &b };
    setup.mgr.disable(&winner.id).await.unwrap();
    setup.mgr.enable(&loser.id, &shared()).await.unwrap();
}
