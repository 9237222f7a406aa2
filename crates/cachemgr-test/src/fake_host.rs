//! In-memory host behind the [`CommandChannel`] trait.
//!
//! Files live in a map, services and binaries in sets. Commands are split
//! on ` && ` and each part is matched against scripted rules first, then
//! against the few builtins the orchestrator relies on (`command -v`,
//! `systemctl`, `rm -f`). Anything else succeeds with empty output.

use async_trait::async_trait;
use cachemgr_common::{CacheMgrError, CacheMgrResult, CommandChannel, ExecResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use crate::verification::CommandVerifier;

#[derive(Debug, Clone)]
enum RuleAction {
    Fail { exit_code: i32, output: String },
    Respond(String),
    Provide(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    action: RuleAction,
    /// Remaining matches; `None` is unlimited.
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct HostState {
    files: BTreeMap<String, String>,
    binaries: BTreeSet<String>,
    active: BTreeSet<String>,
    enabled: BTreeSet<String>,
    commands: Vec<String>,
    rules: Vec<Rule>,
    /// Path to the number of writes still allowed before they fail.
    failing_writes: BTreeMap<String, usize>,
    failing_removals: BTreeSet<String>,
    writes: Vec<String>,
    unreachable: bool,
}

/// Files and service state of a [`FakeHost`] at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    /// Path to content.
    pub files: BTreeMap<String, String>,
    /// Running services.
    pub active: BTreeSet<String>,
}

/// Scriptable host for workflow tests.
#[derive(Debug)]
pub struct FakeHost {
    host: String,
    state: Mutex<HostState>,
}

impl FakeHost {
    /// Creates an empty host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Host with nginx installed, enabled and running.
    pub fn with_nginx(host: impl Into<String>) -> Self {
        let fake = Self::new(host);
        {
            let mut state = fake.state.lock();
            state.binaries.insert("nginx".to_string());
            state.enabled.insert("nginx".to_string());
            state.active.insert("nginx".to_string());
        }
        fake
    }

    // ---- state setup ----

    /// Places a file.
    pub fn set_file(&self, path: &str, content: &str) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), content.to_string());
    }

    /// Builder form of [`FakeHost::set_file`].
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.set_file(path, content);
        self
    }

    /// Makes a binary resolvable through `command -v`.
    pub fn install_binary(&self, binary: &str) {
        self.state.lock().binaries.insert(binary.to_string());
    }

    /// Sets whether a service runs.
    pub fn set_active(&self, service: &str, active: bool) {
        let mut state = self.state.lock();
        if active {
            state.active.insert(service.to_string());
        } else {
            state.active.remove(service);
        }
    }

    /// Sets whether a service starts on boot.
    pub fn set_enabled(&self, service: &str, enabled: bool) {
        let mut state = self.state.lock();
        if enabled {
            state.enabled.insert(service.to_string());
        } else {
            state.enabled.remove(service);
        }
    }

    /// Makes every operation fail as if the host could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    // ---- scripting ----

    fn add_rule(&self, pattern: &str, action: RuleAction, remaining: Option<usize>) {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            action,
            remaining,
        });
    }

    /// Every command part containing `pattern` exits with `exit_code`.
    pub fn fail_when(&self, pattern: &str, exit_code: i32, output: &str) {
        self.add_rule(
            pattern,
            RuleAction::Fail {
                exit_code,
                output: output.to_string(),
            },
            None,
        );
    }

    /// The next `times` command parts containing `pattern` fail.
    pub fn fail_times(&self, pattern: &str, times: usize, exit_code: i32, output: &str) {
        self.add_rule(
            pattern,
            RuleAction::Fail {
                exit_code,
                output: output.to_string(),
            },
            Some(times),
        );
    }

    /// Command parts containing `pattern` print `stdout` and succeed.
    pub fn respond_when(&self, pattern: &str, stdout: &str) {
        self.add_rule(pattern, RuleAction::Respond(stdout.to_string()), None);
    }

    /// A successful command part containing `pattern` installs `binary`.
    pub fn provides_on(&self, pattern: &str, binary: &str) {
        self.add_rule(pattern, RuleAction::Provide(binary.to_string()), None);
    }

    /// Writes to `path` fail.
    pub fn fail_writes_to(&self, path: &str) {
        self.fail_writes_to_after(path, 0);
    }

    /// Writes to `path` succeed `allowed` more times, then fail.
    pub fn fail_writes_to_after(&self, path: &str, allowed: usize) {
        self.state
            .lock()
            .failing_writes
            .insert(path.to_string(), allowed);
    }

    /// Removing `path` fails; the file stays.
    pub fn fail_removals_of(&self, path: &str) {
        self.state.lock().failing_removals.insert(path.to_string());
    }

    /// Writes to `path` succeed again.
    pub fn allow_writes_to(&self, path: &str) {
        self.state.lock().failing_writes.remove(path);
    }

    /// Removes every scripted rule.
    pub fn clear_rules(&self) {
        self.state.lock().rules.clear();
    }

    // ---- inspection ----

    /// Content of a file.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().files.get(path).cloned()
    }

    /// True if a file exists.
    pub fn has_file(&self, path: &str) -> bool {
        self.state.lock().files.contains_key(path)
    }

    /// True if a service runs.
    pub fn is_active(&self, service: &str) -> bool {
        self.state.lock().active.contains(service)
    }

    /// True if a service starts on boot.
    pub fn is_enabled(&self, service: &str) -> bool {
        self.state.lock().enabled.contains(service)
    }

    /// True if a binary is installed.
    pub fn has_binary(&self, binary: &str) -> bool {
        self.state.lock().binaries.contains(binary)
    }

    /// Every command received, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Paths written, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Forgets received commands and writes.
    pub fn clear_history(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.writes.clear();
    }

    /// Verifier over the commands received so far.
    pub fn verifier(&self) -> CommandVerifier {
        CommandVerifier::new(self.commands())
    }

    /// Current files and running services.
    pub fn snapshot(&self) -> HostSnapshot {
        let state = self.state.lock();
        HostSnapshot {
            files: state.files.clone(),
            active: state.active.clone(),
        }
    }

    fn check_reachable(&self) -> CacheMgrResult<()> {
        if self.state.lock().unreachable {
            return Err(CacheMgrError::channel(&self.host, "connection refused"));
        }
        Ok(())
    }

    /// Runs one part of a `&&` chain.
    fn run_part(state: &mut HostState, part: &str) -> ExecResult {
        let mut provided = Vec::new();
        let mut outcome = None;
        for rule in state.rules.iter_mut() {
            if !part.contains(&rule.pattern) || rule.remaining == Some(0) {
                continue;
            }
            match &rule.action {
                RuleAction::Provide(binary) => provided.push(binary.clone()),
                RuleAction::Fail { exit_code, output } if outcome.is_none() => {
                    outcome = Some(ExecResult::failed(*exit_code, output.clone()));
                }
                RuleAction::Respond(stdout) if outcome.is_none() => {
                    outcome = Some(ExecResult::ok(stdout.clone()));
                }
                _ => continue,
            }
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
        }

        let result = outcome.unwrap_or_else(|| Self::builtin(state, part));
        if result.success() {
            state.binaries.extend(provided);
        }
        result
    }

    fn builtin(state: &mut HostState, part: &str) -> ExecResult {
        let words: Vec<String> = part
            .split_whitespace()
            .map(|w| w.trim_matches('"').to_string())
            .collect();
        let words: Vec<&str> = words.iter().map(String::as_str).collect();

        match words.as_slice() {
            ["command", "-v", binary, ..] => {
                if state.binaries.contains(*binary) {
                    ExecResult::ok(format!("/usr/bin/{}", binary))
                } else {
                    ExecResult::failed(1, "")
                }
            }
            ["systemctl", "is-enabled", "--quiet", unit] => {
                if state.enabled.contains(*unit) {
                    ExecResult::ok("")
                } else {
                    ExecResult::failed(1, "")
                }
            }
            ["systemctl", "is-active", "--quiet", unit] => {
                if state.active.contains(*unit) {
                    ExecResult::ok("")
                } else {
                    ExecResult::failed(3, "")
                }
            }
            ["systemctl", "daemon-reload"] => ExecResult::ok(""),
            ["systemctl", "enable", unit] => {
                state.enabled.insert(unit.to_string());
                ExecResult::ok("")
            }
            ["systemctl", "start" | "restart", unit] => {
                state.active.insert(unit.to_string());
                ExecResult::ok("")
            }
            ["systemctl", "reload", unit] => {
                if state.active.contains(*unit) {
                    ExecResult::ok("")
                } else {
                    ExecResult::failed(1, format!("{}.service is not active, cannot reload.", unit))
                }
            }
            ["systemctl", "stop", unit] => {
                state.active.remove(*unit);
                ExecResult::ok("")
            }
            ["rm", "-f", "--", path] => {
                state.files.remove(*path);
                ExecResult::ok("")
            }
            _ => ExecResult::ok(""),
        }
    }
}

#[async_trait]
impl CommandChannel for FakeHost {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, _timeout: Duration) -> CacheMgrResult<ExecResult> {
        tokio::task::yield_now().await;
        self.check_reachable()?;

        let mut state = self.state.lock();
        state.commands.push(command.to_string());
        debug!(host = %self.host, command = %command, "fake run");

        let mut result = ExecResult::ok("");
        for part in command.split(" && ") {
            result = Self::run_part(&mut state, part.trim());
            if !result.success() {
                break;
            }
        }
        Ok(result)
    }

    async fn read_file(&self, path: &str, _timeout: Duration) -> CacheMgrResult<Option<String>> {
        tokio::task::yield_now().await;
        self.check_reachable()?;
        Ok(self.state.lock().files.get(path).cloned())
    }

    async fn write_file(&self, path: &str, content: &str, _timeout: Duration) -> CacheMgrResult<()> {
        tokio::task::yield_now().await;
        self.check_reachable()?;

        let mut state = self.state.lock();
        if let Some(allowed) = state.failing_writes.get_mut(path) {
            if *allowed > 0 {
                *allowed -= 1;
            } else {
                return Err(CacheMgrError::ShellCommandFailed {
                    command: format!("write {}", path),
                    exit_code: 1,
                    output: "No space left on device".to_string(),
                });
            }
        }
        state.writes.push(path.to_string());
        state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn remove_file(&self, path: &str, _timeout: Duration) -> CacheMgrResult<()> {
        tokio::task::yield_now().await;
        self.check_reachable()?;

        let mut state = self.state.lock();
        if state.failing_removals.contains(path) {
            return Err(CacheMgrError::ShellCommandFailed {
                command: format!("rm -f -- {}", path),
                exit_code: 1,
                output: "Read-only file system".to_string(),
            });
        }
        state.files.remove(path);
        Ok(())
    }
}
