//! Error taxonomy for a provisioning run.

use crate::config::{ConfigError, PackageSpec};
use crate::fetch::FetchError;
use crate::receipt::ReceiptError;
use std::fmt;
use std::path::PathBuf;

/// A provisioning phase. Each has its own process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Config,
    Packages,
    Tools,
    Checkout,
    Staging,
}

impl Phase {
    /// Process exit code reported when this phase fails.
    pub fn exit_code(self) -> u8 {
        match self {
            Phase::Packages => 1,
            Phase::Tools => 2,
            Phase::Checkout => 3,
            Phase::Staging => 4,
            // EX_CONFIG from sysexits.h
            Phase::Config => 78,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Config => "config",
            Phase::Packages => "packages",
            Phase::Tools => "tools",
            Phase::Checkout => "checkout",
            Phase::Staging => "staging",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A package the package manager could not resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedPackage {
    pub package: PackageSpec,
    pub reason: String,
}

/// Errors from the package phase.
#[derive(Debug, thiserror::Error)]
pub enum PackageInstallError {
    #[error("no supported package manager detected")]
    NoPackageManager,
    #[error("{manager} cannot resolve {} package(s): {}", .packages.len(), unresolved_list(.packages))]
    Unresolvable {
        manager: String,
        packages: Vec<UnresolvedPackage>,
    },
    #[error("{manager}: `{command}` failed: {reason}")]
    Command {
        manager: String,
        command: String,
        reason: String,
    },
}

fn unresolved_list(packages: &[UnresolvedPackage]) -> String {
    packages
        .iter()
        .map(|p| p.package.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from the pinned tool phase.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool}: checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        tool: String,
        expected: String,
        actual: String,
    },
    #[error("{tool}: download failed: {source}")]
    Fetch {
        tool: String,
        #[source]
        source: FetchError,
    },
    #[error("{tool}: install into {} failed: {message}", .prefix.display())]
    Install {
        tool: String,
        prefix: PathBuf,
        message: String,
    },
    #[error("{tool}: no executable '{binary}' under {}", .prefix.display())]
    BinaryNotFound {
        tool: String,
        binary: String,
        prefix: PathBuf,
    },
}

/// Errors from the source checkout phase.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("{url}: clone failed after {attempts} attempt(s): {reason}")]
    Network {
        url: String,
        attempts: u32,
        reason: String,
    },
    #[error("{url}: target {} is not empty and is not a checkout of this repository", .dir.display())]
    Conflict { url: String, dir: PathBuf },
    #[error("{url}: {reason}")]
    Git { url: String, reason: String },
    #[error("{url}: cannot prepare {}: {source}", .dir.display())]
    Io {
        url: String,
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CheckoutError {
    /// Only network failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckoutError::Network { .. })
    }
}

/// Errors from the staging phase.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus {url}: {reason}")]
    Corpus { url: String, reason: String },
    #[error("cannot record run: {0}")]
    Receipt(#[from] ReceiptError),
}

/// Any failure of a provisioning run.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("packages: {0}")]
    Packages(#[from] PackageInstallError),
    #[error("tools: {0}")]
    Tool(#[from] ToolError),
    #[error("checkout: {0}")]
    Checkout(#[from] CheckoutError),
    #[error("staging: {0}")]
    Stage(#[from] StageError),
}

impl ProvisionError {
    /// The phase that failed.
    pub fn phase(&self) -> Phase {
        match self {
            ProvisionError::Config(_) => Phase::Config,
            ProvisionError::Packages(_) => Phase::Packages,
            ProvisionError::Tool(_) => Phase::Tools,
            ProvisionError::Checkout(_) => Phase::Checkout,
            ProvisionError::Stage(_) => Phase::Staging,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.phase().exit_code()
    }
}
