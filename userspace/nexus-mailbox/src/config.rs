// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Runtime configuration for the mailbox layer
//! OWNERS: @runtime
//! STATUS: Functional
//!
//! The configuration is plain data. Hosts either build it in code or load it
//! from a TOML fragment such as:
//!
//! ```toml
//! accept_order = "fifo"
//! copy_failure = "reject"
//! queue_warn_depth = 1024
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Order in which [`crate::ServerChannel::accept`] hands out pending channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptOrder {
    /// Oldest pending connection first, like a listening socket.
    #[default]
    Fifo,
    /// Most recent pending connection first.
    Lifo,
}

/// What happens when an object payload cannot be duplicated during send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyFailurePolicy {
    /// `send` fails with [`crate::Error::CopyFailed`].
    #[default]
    Reject,
    /// The envelope is delivered with empty object contents and a warning is logged.
    DeliverEmpty,
}

/// Tunables applied to every mailbox created by a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MailboxConfig {
    /// Dequeue policy for server channels.
    pub accept_order: AcceptOrder,
    /// Handling of object payloads whose duplication fails.
    pub copy_failure: CopyFailurePolicy,
    /// Queue depth above which a warning is logged; `0` disables the warning.
    pub queue_warn_depth: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            accept_order: AcceptOrder::default(),
            copy_failure: CopyFailurePolicy::default(),
            queue_warn_depth: 1024,
        }
    }
}

/// Errors raised while loading a [`MailboxConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The TOML document did not describe a valid configuration.
    #[error("invalid mailbox config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl MailboxConfig {
    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Overrides the accept order.
    pub fn with_accept_order(mut self, order: AcceptOrder) -> Self {
        self.accept_order = order;
        self
    }

    /// Overrides the copy failure policy.
    pub fn with_copy_failure(mut self, policy: CopyFailurePolicy) -> Self {
        self.copy_failure = policy;
        self
    }

    /// Overrides the queue depth warning threshold.
    pub fn with_queue_warn_depth(mut self, depth: usize) -> Self {
        self.queue_warn_depth = depth;
        self
    }
}
