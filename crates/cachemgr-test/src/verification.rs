//! Verification helpers for testing the orchestrator
//!
//! Provides assertion helpers to verify host files and command execution

use crate::FakeHost;
use thiserror::Error;

/// Why a host or command assertion failed
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("Expected file '{path}' not found")]
    FileNotFound { path: String },

    #[error("File '{path}' should not exist")]
    UnexpectedFile { path: String },

    #[error("File '{path}' does not contain '{expected}'")]
    ContentMissing { path: String, expected: String },

    #[error("Expected {expected} occurrences of '{needle}' in '{path}', found {actual}")]
    OccurrenceMismatch {
        path: String,
        needle: String,
        expected: usize,
        actual: usize,
    },

    #[error("File '{path}' differs:\n--- expected\n{expected}\n--- actual\n{actual}")]
    ContentMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("No command contains '{needle}', ran: {ran:?}")]
    CommandMissing { needle: String, ran: Vec<String> },

    #[error("Command '{command}' contains '{needle}'")]
    UnexpectedCommand { needle: String, command: String },

    #[error("Expected '{first}' before '{second}', found at {positions:?}")]
    OrderViolation {
        first: String,
        second: String,
        positions: (Option<usize>, Option<usize>),
    },

    #[error("Expected {expected} commands, found {actual}")]
    CountMismatch { expected: usize, actual: usize },
}

pub type VerifyResult<T> = Result<T, VerificationError>;

/// File state verification helper
pub struct HostVerifier<'a> {
    host: &'a FakeHost,
}

impl<'a> HostVerifier<'a> {
    /// Create a new host verifier
    pub fn new(host: &'a FakeHost) -> Self {
        Self { host }
    }

    /// Verify that a file exists
    pub fn assert_file_exists(&self, path: &str) -> VerifyResult<()> {
        if self.host.has_file(path) {
            Ok(())
        } else {
            Err(VerificationError::FileNotFound {
                path: path.to_string(),
            })
        }
    }

    /// Verify that a file does not exist
    pub fn assert_file_absent(&self, path: &str) -> VerifyResult<()> {
        if self.host.has_file(path) {
            Err(VerificationError::UnexpectedFile {
                path: path.to_string(),
            })
        } else {
            Ok(())
        }
    }

    /// Verify that a file contains a fragment
    pub fn assert_file_contains(&self, path: &str, expected: &str) -> VerifyResult<()> {
        let content = self.host.file(path).ok_or_else(|| VerificationError::FileNotFound {
            path: path.to_string(),
        })?;
        if content.contains(expected) {
            Ok(())
        } else {
            Err(VerificationError::ContentMissing {
                path: path.to_string(),
                expected: expected.to_string(),
            })
        }
    }

    /// Verify the number of lines of a file equal to `line` (trimmed)
    pub fn assert_line_count(&self, path: &str, line: &str, expected: usize) -> VerifyResult<()> {
        let actual = self
            .host
            .file(path)
            .map_or(0, |c| c.lines().filter(|l| l.trim() == line).count());
        if actual == expected {
            Ok(())
        } else {
            Err(VerificationError::OccurrenceMismatch {
                path: path.to_string(),
                needle: line.to_string(),
                expected,
                actual,
            })
        }
    }

    /// Verify that a file holds exactly `expected`
    pub fn assert_file_content(&self, path: &str, expected: &str) -> VerifyResult<()> {
        match self.host.file(path) {
            None => Err(VerificationError::FileNotFound {
                path: path.to_string(),
            }),
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => Err(VerificationError::ContentMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual,
            }),
        }
    }
}

/// Assertions over the commands a [`FakeHost`] ran, in order.
///
/// Matching is by substring, since builders quote their arguments.
pub struct CommandVerifier {
    commands: Vec<String>,
}

impl CommandVerifier {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    fn matching<'a>(&'a self, needle: &'a str) -> impl Iterator<Item = &'a String> + 'a {
        self.commands.iter().filter(move |cmd| cmd.contains(needle))
    }

    fn position(&self, needle: &str) -> Option<usize> {
        self.commands.iter().position(|cmd| cmd.contains(needle))
    }

    /// Some command contains `needle`
    pub fn assert_command_executed(&self, needle: &str) -> VerifyResult<()> {
        match self.position(needle) {
            Some(_) => Ok(()),
            None => Err(VerificationError::CommandMissing {
                needle: needle.to_string(),
                ran: self.commands.clone(),
            }),
        }
    }

    /// No command contains `needle`
    pub fn assert_command_not_executed(&self, needle: &str) -> VerifyResult<()> {
        match self.matching(needle).next() {
            None => Ok(()),
            Some(cmd) => Err(VerificationError::UnexpectedCommand {
                needle: needle.to_string(),
                command: cmd.clone(),
            }),
        }
    }

    /// The first command containing `first` ran before the first one
    /// containing `second`
    pub fn assert_order(&self, first: &str, second: &str) -> VerifyResult<()> {
        match (self.position(first), self.position(second)) {
            (Some(a), Some(b)) if a < b => Ok(()),
            (a, b) => Err(VerificationError::OrderViolation {
                first: first.to_string(),
                second: second.to_string(),
                positions: (a, b),
            }),
        }
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.matching(needle).count()
    }

    /// Exactly `expected` commands ran
    pub fn assert_command_count(&self, expected: usize) -> VerifyResult<()> {
        let actual = self.commands.len();
        if actual == expected {
            return Ok(());
        }
        Err(VerificationError::CountMismatch { expected, actual })
    }

    pub fn captured_commands(&self) -> &[String] {
        &self.commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_verifier() {
        let commands = vec![
            "systemctl restart \"varnish\"".to_string(),
            "nginx -t && systemctl reload \"nginx\"".to_string(),
        ];

        let verifier = CommandVerifier::new(commands);

        assert!(verifier.assert_command_executed("varnish").is_ok());
        assert!(verifier.assert_command_executed("nginx -t").is_ok());
        assert!(verifier.assert_command_not_executed("varnishadm").is_ok());
        assert!(verifier.assert_command_count(2).is_ok());
        assert!(verifier.assert_order("restart", "reload").is_ok());
        assert_eq!(verifier.count_matching("systemctl"), 2);

        assert!(verifier.assert_command_count(3).is_err());
        assert!(verifier.assert_order("reload", "restart").is_err());
        assert!(verifier.assert_command_executed("nonexistent").is_err());
    }

    #[test]
    fn test_host_verifier() {
        let host = FakeHost::new("web1").with_file("/etc/varnish/default.vcl", "vcl 4.1;\ninclude \"a\";\n");
        let verifier = HostVerifier::new(&host);

        assert!(verifier.assert_file_exists("/etc/varnish/default.vcl").is_ok());
        assert!(verifier.assert_file_absent("/etc/varnish/sites/x.vcl").is_ok());
        assert!(verifier
            .assert_line_count("/etc/varnish/default.vcl", "include \"a\";", 1)
            .is_ok());
        assert!(verifier
            .assert_file_contains("/etc/varnish/default.vcl", "vcl 4.1")
            .is_ok());
        assert!(verifier
            .assert_file_content("/etc/varnish/default.vcl", "vcl 4.1;\n")
            .is_err());
    }
}
