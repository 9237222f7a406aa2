//! Integration tests for the Enable and Disable workflows
//!
//! Runs the orchestrator against in-memory hosts and checks:
//! - files and services after each workflow
//! - rollback on step failure, compensation failure and cancellation
//! - recorded state in the memory and JSON stores

use async_trait::async_trait;
use cachemgr_common::{
    CacheMgrError, CacheMgrResult, CacheState, CommandChannel, EnableRequest, ExecResult, Site,
    Topology, TransitionConflict,
};
use cachemgr_test::{
    fixtures::{origin_fixtures, site_fixtures},
    origin_backup_path, origin_config_path, seed_origin, site_include, site_policy_path, web_host,
    web_host_with_varnish, FakeHost, HostVerifier, DAEMON_PARAMS, DAEMON_SERVICE, DAEMON_UNIT,
    INSTALL_COMMAND, MASTER_VCL, ORIGIN_SERVICE,
};
use cachemgrd::policy::HostMatch;
use cachemgrd::{
    CacheMgr, CacheMgrConfig, DaemonAction, DesiredStateStore, HostRegistry, JsonStateStore,
    MemoryStateStore,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Test fixture: one host, a site catalog and a memory store
struct TestSetup {
    host: Arc<FakeHost>,
    store: Arc<MemoryStateStore>,
    mgr: CacheMgr,
}

impl TestSetup {
    fn new(host: FakeHost, sites: &[Site]) -> Self {
        let host = Arc::new(host);
        let store = Arc::new(MemoryStateStore::new());
        let mgr = manager(Arc::clone(&host) as Arc<dyn CommandChannel>, sites, store.clone());
        Self { host, store, mgr }
    }

    fn verifier(&self) -> HostVerifier<'_> {
        HostVerifier::new(&self.host)
    }

    async fn state(&self, site: &Site) -> CacheState {
        self.store.get(&site.id).await.expect("store read failed")
    }
}

fn manager(
    channel: Arc<dyn CommandChannel>,
    sites: &[Site],
    store: Arc<dyn DesiredStateStore>,
) -> CacheMgr {
    let mut config = CacheMgrConfig::default();
    config.sites = sites.to_vec();
    let mut hosts = HostRegistry::new();
    hosts.register(channel.host().to_string(), channel);
    CacheMgr::new(config, hosts, store).expect("Failed to build manager")
}

fn shared() -> EnableRequest {
    EnableRequest::shared(300, "256M")
}

#[tokio::test]
async fn test_enable_example_com_shared_port() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);

    let report = setup.mgr.enable(&site.id, &shared()).await.unwrap();

    assert_eq!(
        HostMatch::new(&site).condition("host"),
        r#"host == "example.com" || host == "www.example.com""#
    );
    let policy = setup.host.file(&site_policy_path(&site)).unwrap();
    assert!(policy
        .contains(r#"if (req.http.host == "example.com" || req.http.host == "www.example.com") {"#));
    assert!(policy.contains("set beresp.ttl = 300s;"));

    let verifier = setup.verifier();
    verifier
        .assert_line_count(MASTER_VCL, &site_include(&site), 1)
        .unwrap();
    verifier
        .assert_file_contains(DAEMON_PARAMS, "malloc,256M")
        .unwrap();
    verifier.assert_file_exists(DAEMON_UNIT).unwrap();
    verifier
        .assert_file_contains(&origin_config_path(&site.domain), "# BEGIN cachemgrd:example")
        .unwrap();
    verifier
        .assert_file_exists(&origin_backup_path(&site.domain))
        .unwrap();

    assert!(setup.host.has_binary("varnishd"));
    assert!(setup.host.is_enabled(DAEMON_SERVICE));
    assert!(setup.host.is_active(DAEMON_SERVICE));

    let expected = CacheState::enabled(shared().validate().unwrap());
    assert_eq!(report.state, expected);
    assert_eq!(setup.state(&site).await, expected);
    assert_eq!(
        report.workflow.applied,
        vec![
            "install-cache-daemon",
            "write-daemon-config",
            "write-site-policy",
            "patch-origin-config",
            "validate-origin-config",
            "reload-services",
        ]
    );

    let commands = setup.host.verifier();
    commands.assert_command_executed(INSTALL_COMMAND).unwrap();
    commands
        .assert_order("systemctl restart \"varnish\"", "systemctl reload \"nginx\"")
        .unwrap();
}

#[tokio::test]
async fn test_enable_twice_is_rejected_and_changes_nothing() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);

    setup.mgr.enable(&site.id, &shared()).await.unwrap();
    let after_first = setup.host.snapshot();
    setup.host.clear_history();

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert_eq!(err.transition_conflict(), Some(TransitionConflict::AlreadyEnabled));
    assert!(err.is_rejected_locally());
    assert_eq!(setup.host.snapshot(), after_first);
    assert!(setup.host.commands().is_empty());
    assert_eq!(setup.store.commit_count(), 1);
}

#[tokio::test]
async fn test_rerun_after_lost_state_converges_without_writes() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);

    setup.mgr.enable(&site.id, &shared()).await.unwrap();
    let after_first = setup.host.snapshot();
    setup.store.seed(&site.id, CacheState::default());
    setup.host.clear_history();

    let report = setup.mgr.enable(&site.id, &shared()).await.unwrap();

    assert_eq!(
        report.workflow.satisfied,
        vec![
            "install-cache-daemon",
            "write-daemon-config",
            "write-site-policy",
            "patch-origin-config",
        ]
    );
    assert!(setup.host.writes().is_empty());
    assert_eq!(setup.host.snapshot().files, after_first.files);
    // Unchanged daemon files: reload keeps the other tenants' cache.
    let commands = setup.host.verifier();
    commands
        .assert_command_executed("systemctl reload \"varnish\"")
        .unwrap();
    commands
        .assert_command_not_executed("systemctl restart")
        .unwrap();
}

#[tokio::test]
async fn test_failed_syntax_check_rolls_back_everything() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup
        .host
        .fail_when("nginx -t", 1, "nginx: [emerg] duplicate location \"/\"");
    let before = setup.host.snapshot();

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert!(matches!(err, CacheMgrError::StepFailed { .. }));
    assert_eq!(err.failed_step(), Some("validate-origin-config"));
    assert!(err.to_string().contains("duplicate location"));

    let verifier = setup.verifier();
    verifier.assert_file_absent(&site_policy_path(&site)).unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&site), 0).unwrap();
    verifier
        .assert_file_absent(&origin_backup_path(&site.domain))
        .unwrap();
    assert_eq!(setup.host.snapshot(), before);
    assert!(!setup.state(&site).await.enabled);
    assert_eq!(setup.store.commit_count(), 0);
}

#[tokio::test]
async fn test_failed_origin_patch_keeps_existing_master() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host_with_varnish("web1", &[site.clone()]), &[site.clone()]);
    setup
        .host
        .fail_writes_to(&origin_config_path(&site.domain));
    let before = setup.host.snapshot();

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert_eq!(err.failed_step(), Some("patch-origin-config"));
    assert_eq!(setup.host.snapshot(), before);
    setup.verifier().assert_file_exists(MASTER_VCL).unwrap();
}

#[tokio::test]
async fn test_compensation_failure_is_reported_and_rollback_continues() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup.host.fail_when("nginx -t", 1, "nginx: [emerg] unexpected \"}\"");
    // The forward patch may write; restoring it may not.
    setup
        .host
        .fail_writes_to_after(&origin_config_path(&site.domain), 1);

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert!(matches!(err, CacheMgrError::RollbackPartial { .. }));
    assert_eq!(err.failed_step(), Some("validate-origin-config"));
    let failures = err.rollback_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].step, "patch-origin-config");

    // Earlier steps were still compensated.
    let verifier = setup.verifier();
    verifier.assert_file_absent(&site_policy_path(&site)).unwrap();
    verifier.assert_file_absent(DAEMON_PARAMS).unwrap();
    assert!(!setup.state(&site).await.enabled);
}

#[tokio::test]
async fn test_failed_self_undo_is_reported_as_partial_rollback() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    // The policy is written, the master write fails, and the step cannot
    // take its policy back.
    setup.host.fail_writes_to(MASTER_VCL);
    setup.host.fail_removals_of(&site_policy_path(&site));

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert!(matches!(err, CacheMgrError::RollbackPartial { .. }));
    assert_eq!(err.failed_step(), Some("write-site-policy"));
    let failures = err.rollback_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].step, "write-site-policy");
    assert!(failures[0].error.contains("Read-only file system"));
    assert!(err.to_string().contains("No space left on device"));

    // The leftover is the one reported; earlier steps were compensated.
    let verifier = setup.verifier();
    verifier.assert_file_exists(&site_policy_path(&site)).unwrap();
    verifier.assert_file_absent(DAEMON_PARAMS).unwrap();
    verifier.assert_file_absent(MASTER_VCL).unwrap();
    assert!(!setup.state(&site).await.enabled);
}

#[tokio::test]
async fn test_failed_master_edit_removes_own_policy() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup.host.fail_writes_to(MASTER_VCL);

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert!(matches!(err, CacheMgrError::StepFailed { .. }));
    assert_eq!(err.failed_step(), Some("write-site-policy"));
    setup
        .verifier()
        .assert_file_absent(&site_policy_path(&site))
        .unwrap();
}

#[tokio::test]
async fn test_install_falls_back_to_alternate_source() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup
        .host
        .fail_times(INSTALL_COMMAND, 1, 100, "E: Unable to locate package varnish");

    setup.mgr.enable(&site.id, &shared()).await.unwrap();

    assert!(setup.host.has_binary("varnishd"));
    let commands = setup.host.verifier();
    assert_eq!(commands.count_matching(INSTALL_COMMAND), 2);
    commands
        .assert_command_executed("packagecloud.io/install/repositories/varnishcache")
        .unwrap();
}

#[tokio::test]
async fn test_unreachable_host_fails_without_state_change() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup.host.set_unreachable(true);

    let err = setup.mgr.enable(&site.id, &shared()).await.unwrap_err();

    assert!(err.is_channel_error());
    assert_eq!(err.failed_step(), Some("install-cache-daemon"));
    assert_eq!(setup.store.commit_count(), 0);
}

#[tokio::test]
async fn test_disable_restores_origin_and_stops_unused_daemon() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    let original = setup.host.file(&origin_config_path(&site.domain)).unwrap();

    setup.mgr.enable(&site.id, &shared()).await.unwrap();
    let report = setup.mgr.disable(&site.id).await.unwrap();

    assert_eq!(report.daemon, DaemonAction::Stopped);
    assert_eq!(
        report.workflow.applied,
        vec!["remove-site-policy", "restore-origin-config", "reload-origin"]
    );
    let verifier = setup.verifier();
    verifier
        .assert_file_content(&origin_config_path(&site.domain), &original)
        .unwrap();
    verifier
        .assert_file_absent(&origin_backup_path(&site.domain))
        .unwrap();
    verifier.assert_file_absent(&site_policy_path(&site)).unwrap();
    verifier.assert_line_count(MASTER_VCL, &site_include(&site), 0).unwrap();
    assert!(!setup.host.is_active(DAEMON_SERVICE));
    // Stopped, not uninstalled.
    assert!(setup.host.has_binary("varnishd"));
    assert!(setup.host.is_active(ORIGIN_SERVICE));

    let state = setup.state(&site).await;
    assert!(!state.enabled);
    assert_eq!(state.active_topology(), None);
    assert_eq!(state.params, Some(shared().validate().unwrap()));
}

#[tokio::test]
async fn test_disable_without_backup_strips_marked_block() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    let original = setup.host.file(&origin_config_path(&site.domain)).unwrap();

    setup.mgr.enable(&site.id, &shared()).await.unwrap();
    setup
        .host
        .remove_file(&origin_backup_path(&site.domain), Duration::from_secs(1))
        .await
        .unwrap();
    setup.mgr.disable(&site.id).await.unwrap();

    setup
        .verifier()
        .assert_file_content(&origin_config_path(&site.domain), &original)
        .unwrap();
}

#[tokio::test]
async fn test_existing_root_location_is_parked_and_restored() {
    let site = site_fixtures::shop();
    let host = web_host("web1", &[site.clone()]);
    let original = origin_fixtures::php_server(&[&site.domain], "/var/www/shop");
    seed_origin(&host, &site, &original);
    let setup = TestSetup::new(host, &[site.clone()]);

    setup.mgr.enable(&site.id, &shared()).await.unwrap();

    let patched = setup.host.file(&origin_config_path(&site.domain)).unwrap();
    let active_roots = patched
        .lines()
        .filter(|l| l.trim_start().starts_with("location / {"))
        .count();
    assert_eq!(active_roots, 1);
    assert!(patched.contains("# cachemgrd:shop off: location / {"));
    assert!(patched.contains("# cachemgrd:shop off: try_files $uri $uri/ /index.php?$args;"));
    assert!(patched.contains("    location /static/ {"));

    // Without a backup the markers alone bring the original back.
    setup
        .host
        .remove_file(&origin_backup_path(&site.domain), Duration::from_secs(1))
        .await
        .unwrap();
    setup.mgr.disable(&site.id).await.unwrap();

    setup
        .verifier()
        .assert_file_content(&origin_config_path(&site.domain), &original)
        .unwrap();
}

#[tokio::test]
async fn test_disable_failure_rolls_back_and_keeps_state() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    setup.mgr.enable(&site.id, &shared()).await.unwrap();
    let enabled = setup.host.snapshot();
    setup.host.fail_when("nginx -t", 1, "nginx: [emerg] open() failed");

    let err = setup.mgr.disable(&site.id).await.unwrap_err();

    assert_eq!(err.failed_step(), Some("reload-origin"));
    assert_eq!(setup.host.snapshot(), enabled);
    assert!(setup.state(&site).await.enabled);
}

#[tokio::test]
async fn test_disable_when_disabled_is_rejected_locally() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);

    let err = setup.mgr.disable(&site.id).await.unwrap_err();

    assert_eq!(err.transition_conflict(), Some(TransitionConflict::NotEnabled));
    assert!(setup.host.commands().is_empty());
}

#[tokio::test]
async fn test_invalid_request_touches_nothing() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);

    for request in [
        EnableRequest::shared(300, "0M"),
        EnableRequest::dedicated(300, "256M", 80),
        EnableRequest {
            backend_port: Some(8080),
            ..shared()
        },
    ] {
        let err = setup.mgr.enable(&site.id, &request).await.unwrap_err();
        assert!(err.is_rejected_locally(), "{:?} accepted", request);
    }
    assert!(setup.host.commands().is_empty());
    assert_eq!(setup.store.commit_count(), 0);
}

#[tokio::test]
async fn test_dedicated_port_enable_and_disable() {
    let site = site_fixtures::example_com();
    let host = web_host("web1", &[]);
    let original = origin_fixtures::https_server(&["example.com", "www.example.com"], "/var/www/example");
    seed_origin(&host, &site, &original);
    let setup = TestSetup::new(host, &[site.clone()]);
    let request = EnableRequest::dedicated(600, "1G", 8080);

    let report = setup.mgr.enable(&site.id, &request).await.unwrap();

    assert_eq!(
        report.state.active_topology(),
        Some(Topology::DedicatedPort { backend_port: 8080 })
    );
    let verifier = setup.verifier();
    let config_path = origin_config_path(&site.domain);
    verifier
        .assert_file_contains(&config_path, "listen 127.0.0.1:8080; # cachemgrd:example was: listen 80;")
        .unwrap();
    verifier
        .assert_file_contains(
            &config_path,
            "listen 127.0.0.1:8443 ssl http2; # cachemgrd:example was: listen 443 ssl http2;",
        )
        .unwrap();
    verifier
        .assert_file_contains(DAEMON_PARAMS, "VARNISH_LISTEN=\":80\"")
        .unwrap();
    verifier
        .assert_file_contains(&site_policy_path(&site), ".port = \"8080\";")
        .unwrap();
    // The origin lets go of the public port before the daemon binds it.
    setup
        .host
        .verifier()
        .assert_order("systemctl reload \"nginx\"", "systemctl restart \"varnish\"")
        .unwrap();

    setup.host.clear_history();
    let report = setup.mgr.disable(&site.id).await.unwrap();

    assert_eq!(report.daemon, DaemonAction::Stopped);
    assert_eq!(
        report.workflow.applied,
        vec![
            "remove-site-policy",
            "restore-origin-config",
            "release-public-ports",
            "reload-origin",
        ]
    );
    setup
        .host
        .verifier()
        .assert_order("systemctl stop \"varnish\"", "systemctl reload \"nginx\"")
        .unwrap();
    verifier.assert_file_content(&config_path, &original).unwrap();
    assert!(!setup.host.is_active(DAEMON_SERVICE));
}

#[tokio::test]
async fn test_cancelled_before_start_touches_nothing() {
    let site = site_fixtures::example_com();
    let setup = TestSetup::new(web_host("web1", &[site.clone()]), &[site.clone()]);
    let token = CancellationToken::new();
    token.cancel();

    let err = setup
        .mgr
        .enable_with_cancel(&site.id, &shared(), token)
        .await
        .unwrap_err();

    assert!(
        matches!(err, CacheMgrError::Cancelled { ref before_step } if before_step == "install-cache-daemon")
    );
    assert!(setup.host.commands().is_empty());
    assert_eq!(setup.store.commit_count(), 0);
}

/// Channel that cancels a token once a given file has been written.
struct CancelAfterWrite {
    inner: Arc<FakeHost>,
    path: String,
    token: CancellationToken,
}

#[async_trait]
impl CommandChannel for CancelAfterWrite {
    fn host(&self) -> &str {
        self.inner.host()
    }

    async fn run(&self, command: &str, timeout: Duration) -> CacheMgrResult<ExecResult> {
        self.inner.run(command, timeout).await
    }

    async fn read_file(&self, path: &str, timeout: Duration) -> CacheMgrResult<Option<String>> {
        self.inner.read_file(path, timeout).await
    }

    async fn write_file(&self, path: &str, content: &str, timeout: Duration) -> CacheMgrResult<()> {
        self.inner.write_file(path, content, timeout).await?;
        if path == self.path {
            self.token.cancel();
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str, timeout: Duration) -> CacheMgrResult<()> {
        self.inner.remove_file(path, timeout).await
    }
}

#[tokio::test]
async fn test_cancelled_mid_workflow_rolls_back() {
    let site = site_fixtures::example_com();
    let host = Arc::new(web_host("web1", &[site.clone()]));
    let before = host.snapshot();
    let token = CancellationToken::new();
    let channel = Arc::new(CancelAfterWrite {
        inner: Arc::clone(&host),
        path: site_policy_path(&site),
        token: token.clone(),
    });
    let store = Arc::new(MemoryStateStore::new());
    let mgr = manager(channel, &[site.clone()], store.clone());

    let err = mgr
        .enable_with_cancel(&site.id, &shared(), token)
        .await
        .unwrap_err();

    assert!(
        matches!(err, CacheMgrError::Cancelled { ref before_step } if before_step == "patch-origin-config")
    );
    assert_eq!(host.snapshot(), before);
    assert_eq!(store.commit_count(), 0);
}

#[tokio::test]
async fn test_json_store_records_enable_and_disable() {
    let dir = tempfile::TempDir::new().unwrap();
    let site = site_fixtures::example_com();
    let host: Arc<dyn CommandChannel> = Arc::new(web_host("web1", &[site.clone()]));
    let mgr = manager(
        Arc::clone(&host),
        &[site.clone()],
        Arc::new(JsonStateStore::new(dir.path())),
    );

    let report = mgr.enable(&site.id, &shared()).await.unwrap();

    // A fresh store over the same directory sees the committed state.
    let reopened = JsonStateStore::new(dir.path());
    assert_eq!(reopened.get(&site.id).await.unwrap(), report.state);
    assert!(dir.path().join("example.json").exists());

    mgr.disable(&site.id).await.unwrap();
    let state = reopened.get(&site.id).await.unwrap();
    assert!(!state.enabled);
    assert_eq!(mgr.status(&site.id).await.unwrap().state, state);
}
