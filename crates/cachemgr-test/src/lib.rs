//! Test infrastructure for cachemgrd
//!
//! Provides:
//! - [`FakeHost`], an in-memory host behind the command channel
//! - Site and origin configuration fixtures
//! - Command and file verification helpers

mod fake_host;
pub mod fixtures;
mod verification;

pub use fake_host::{FakeHost, HostSnapshot};
pub use fixtures::*;
pub use verification::*;
