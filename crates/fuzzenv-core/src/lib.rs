//! fuzzenv core: config loading, package managers, and the provisioning
//! state machine.
//!
//! fuzzenv provisions a reproducible fuzzing/build environment from a
//! central `fuzzenv.toml`: OS packages, pinned tools, shallow source
//! checkouts and staged build scripts, in that order.

mod builder;
mod config;
mod ecosystem;
mod environment;
mod error;
mod fetch;
mod plan;
mod process;
mod receipt;
mod retry;

pub use builder::{
    BuildState, PackageInstaller, ProvisionRun, Provisioner, SourceFetcher, Stager, ToolInstaller,
};
pub use config::{
    ConfigError, ConfigFormat, CorpusSeed, EnvironmentSettings, PackageSpec, PinnedTool,
    ProvisionConfig, SourceCheckout, StagedScript,
};
pub use ecosystem::{Ecosystem, SystemPackageManager, detect_ecosystems, detect_primary_ecosystem};
pub use environment::Environment;
pub use error::{
    CheckoutError, PackageInstallError, Phase, ProvisionError, StageError, ToolError,
    UnresolvedPackage,
};
pub use fetch::{FetchError, Fetcher, UrlFetcher};
pub use plan::{Step, plan};
pub use process::{ChildTracker, CommandOutput, CommandRunner, SystemRunner, find_on_path, is_executable};
pub use receipt::{CheckedOut, InstalledTool, Receipt, ReceiptError, SeededCorpus, StagedFile};
pub use retry::RetryPolicy;
