//! The provisioning state machine.
//!
//! A run moves strictly forward through
//! `NotStarted -> PackagesInstalled -> ToolsInstalled -> SourceReady -> Staged`.
//! The first failing phase moves it to `Failed` and nothing after that phase
//! runs. Work already done is left in place.

use crate::config::{CorpusSeed, PackageSpec, PinnedTool, ProvisionConfig, SourceCheckout, StagedScript};
use crate::environment::Environment;
use crate::error::{
    CheckoutError, PackageInstallError, Phase, ProvisionError, StageError, ToolError,
};
use crate::receipt::{CheckedOut, InstalledTool, Receipt, SeededCorpus, StagedFile};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{error, info, warn};

/// Installs OS packages.
pub trait PackageInstaller {
    /// Install all packages, reporting every unresolvable one at once.
    fn install(&self, packages: &[PackageSpec]) -> Result<(), PackageInstallError>;
}

/// Installs pinned tools.
pub trait ToolInstaller {
    /// Download, verify, install and link one tool.
    fn install_tool(&self, env: &Environment, tool: &PinnedTool) -> Result<InstalledTool, ToolError>;
}

/// Produces source checkouts.
pub trait SourceFetcher {
    fn checkout(&self, env: &Environment, checkout: &SourceCheckout) -> Result<CheckedOut, CheckoutError>;
}

/// Places files for the external build driver.
pub trait Stager {
    fn stage_script(
        &self,
        env: &Environment,
        script: &StagedScript,
        variables: &BTreeMap<String, String>,
    ) -> Result<StagedFile, StageError>;

    fn seed_corpus(&self, env: &Environment, corpus: &CorpusSeed) -> Result<SeededCorpus, StageError>;
}

/// Where a provisioning run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    NotStarted,
    PackagesInstalled,
    ToolsInstalled,
    SourceReady,
    /// Terminal success.
    Staged,
    /// Terminal failure in the given phase.
    Failed(Phase),
}

impl BuildState {
    /// The phase that moves the run out of this state.
    pub fn pending_phase(self) -> Option<Phase> {
        match self {
            BuildState::NotStarted => Some(Phase::Packages),
            BuildState::PackagesInstalled => Some(Phase::Tools),
            BuildState::ToolsInstalled => Some(Phase::Checkout),
            BuildState::SourceReady => Some(Phase::Staging),
            BuildState::Staged | BuildState::Failed(_) => None,
        }
    }

    /// The state reached once `phase` completes. Only the pending phase of
    /// the current state may complete.
    pub fn complete(self, phase: Phase) -> Option<BuildState> {
        if self.pending_phase() != Some(phase) {
            return None;
        }
        Some(match phase {
            Phase::Packages => BuildState::PackagesInstalled,
            Phase::Tools => BuildState::ToolsInstalled,
            Phase::Checkout => BuildState::SourceReady,
            Phase::Staging => BuildState::Staged,
            Phase::Config => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        self.pending_phase().is_none()
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildState::NotStarted => f.write_str("NOT_STARTED"),
            BuildState::PackagesInstalled => f.write_str("PACKAGES_INSTALLED"),
            BuildState::ToolsInstalled => f.write_str("TOOLS_INSTALLED"),
            BuildState::SourceReady => f.write_str("SOURCE_READY"),
            BuildState::Staged => f.write_str("STAGED"),
            BuildState::Failed(phase) => write!(f, "FAILED({phase})"),
        }
    }
}

/// Outcome of a provisioning run.
#[derive(Debug)]
pub struct ProvisionRun {
    /// Terminal state.
    pub state: BuildState,
    /// Everything completed before the run stopped.
    pub receipt: Receipt,
    /// The first fatal error, when the run failed.
    pub error: Option<ProvisionError>,
}

impl ProvisionRun {
    pub fn into_result(self) -> Result<Receipt, ProvisionError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.receipt),
        }
    }
}

/// Drives one provisioning run through its phases.
pub struct Provisioner<'a> {
    env: &'a Environment,
    packages: &'a dyn PackageInstaller,
    tools: &'a dyn ToolInstaller,
    sources: &'a dyn SourceFetcher,
    stager: &'a dyn Stager,
    receipt: Receipt,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        env: &'a Environment,
        packages: &'a dyn PackageInstaller,
        tools: &'a dyn ToolInstaller,
        sources: &'a dyn SourceFetcher,
        stager: &'a dyn Stager,
    ) -> Self {
        Self {
            env,
            packages,
            tools,
            sources,
            stager,
            receipt: Receipt::default(),
        }
    }

    /// Run every phase in order, stopping at the first failure.
    pub fn run(mut self, config: &ProvisionConfig) -> ProvisionRun {
        let mut state = BuildState::NotStarted;
        info!(root = %self.env.root.display(), "provisioning started");

        while let Some(phase) = state.pending_phase() {
            if let Err(e) = self.run_phase(phase, config) {
                error!(%phase, error = %e, "provisioning failed");
                return ProvisionRun {
                    state: BuildState::Failed(phase),
                    receipt: self.receipt,
                    error: Some(e),
                };
            }
            // run_phase only ever runs the pending phase
            state = state.complete(phase).unwrap_or(BuildState::Failed(phase));
            info!(%state, "phase complete");
        }

        ProvisionRun {
            state,
            receipt: self.receipt,
            error: None,
        }
    }

    fn run_phase(&mut self, phase: Phase, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        match phase {
            Phase::Packages => self.install_packages(config),
            Phase::Tools => self.install_tools(config),
            Phase::Checkout => self.checkout_sources(config),
            Phase::Staging => self.stage(config),
            Phase::Config => Ok(()),
        }
    }

    fn install_packages(&mut self, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        if !config.packages.is_empty() {
            info!(count = config.packages.len(), "installing packages");
        }
        self.packages.install(&config.packages)?;
        Ok(())
    }

    fn install_tools(&mut self, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        for tool in &config.tools {
            info!(tool = %tool.name, version = %tool.version, "installing pinned tool");
            let installed = self.tools.install_tool(self.env, tool)?;
            self.receipt.tools.insert(tool.name.clone(), installed);
        }
        Ok(())
    }

    fn checkout_sources(&mut self, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        for checkout in &config.checkouts {
            info!(url = %checkout.url, depth = checkout.depth, "checking out source");
            let checked_out = self.sources.checkout(self.env, checkout)?;
            self.receipt
                .checkouts
                .insert(checkout.dir.display().to_string(), checked_out);
        }
        Ok(())
    }

    fn stage(&mut self, config: &ProvisionConfig) -> Result<(), ProvisionError> {
        let variables = config.string_variables();
        for script in &config.scripts {
            info!(src = %script.src.display(), dst = %script.dst.display(), "staging script");
            let staged = self.stager.stage_script(self.env, script, &variables)?;
            self.receipt
                .scripts
                .insert(script.dst.display().to_string(), staged);
        }

        for corpus in &config.corpora {
            match self.stager.seed_corpus(self.env, corpus) {
                Ok(seeded) => {
                    self.receipt
                        .corpora
                        .insert(corpus.dir.display().to_string(), seeded);
                }
                // a missing seed corpus never blocks the build
                Err(e) => warn!(url = %corpus.url, error = %e, "skipping corpus"),
            }
        }

        self.receipt
            .write(self.env.receipt_path())
            .map_err(StageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFormat;
    use std::cell::RefCell;
    use std::path::PathBuf;

    /// Records every call and fails the configured phase.
    #[derive(Default)]
    struct Fake {
        fail: Option<Phase>,
        calls: RefCell<Vec<String>>,
    }

    impl Fake {
        fn failing(phase: Phase) -> Self {
            Self {
                fail: Some(phase),
                ..Default::default()
            }
        }

        fn record(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl PackageInstaller for Fake {
        fn install(&self, packages: &[PackageSpec]) -> Result<(), PackageInstallError> {
            self.record(format!("packages:{}", packages.len()));
            if self.fail == Some(Phase::Packages) {
                return Err(PackageInstallError::NoPackageManager);
            }
            Ok(())
        }
    }

    impl ToolInstaller for Fake {
        fn install_tool(&self, env: &Environment, tool: &PinnedTool) -> Result<InstalledTool, ToolError> {
            self.record(format!("tool:{}", tool.name));
            if self.fail == Some(Phase::Tools) {
                return Err(ToolError::ChecksumMismatch {
                    tool: tool.name.clone(),
                    expected: tool.expected_sha256(),
                    actual: "0".repeat(64),
                });
            }
            Ok(InstalledTool {
                version: tool.version.clone(),
                sha256: tool.expected_sha256(),
                prefix: env.tool_prefix(tool),
                binary: env.tool_prefix(tool).join("bin").join(&tool.name),
                link: env.tool_link(tool),
            })
        }
    }

    impl SourceFetcher for Fake {
        fn checkout(&self, _env: &Environment, checkout: &SourceCheckout) -> Result<CheckedOut, CheckoutError> {
            self.record(format!("checkout:{}", checkout.dir.display()));
            if self.fail == Some(Phase::Checkout) {
                return Err(CheckoutError::Conflict {
                    url: checkout.url.clone(),
                    dir: checkout.dir.clone(),
                });
            }
            Ok(CheckedOut {
                url: checkout.url.clone(),
                depth: checkout.depth,
                head: Some("f".repeat(40)),
            })
        }
    }

    impl Stager for Fake {
        fn stage_script(
            &self,
            env: &Environment,
            script: &StagedScript,
            variables: &BTreeMap<String, String>,
        ) -> Result<StagedFile, StageError> {
            self.record(format!("script:{}:{}", script.dst.display(), variables.len()));
            if self.fail == Some(Phase::Staging) {
                return Err(StageError::Read {
                    path: env.script_source(script),
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(StagedFile {
                source: env.script_source(script),
                bytes: 10,
            })
        }

        fn seed_corpus(&self, _env: &Environment, corpus: &CorpusSeed) -> Result<SeededCorpus, StageError> {
            self.record(format!("corpus:{}", corpus.dir.display()));
            Err(StageError::Corpus {
                url: corpus.url.clone(),
                reason: "HTTP 404".to_string(),
            })
        }
    }

    fn config() -> ProvisionConfig {
        ProvisionConfig::parse(
            r#"
            packages = ["curl"]

            [variables]
            project = "llvm-libc"

            [[tools]]
            name = "cmake"
            version = "3.15.7"
            url = "https://example.com/cmake.tar.gz"
            checksum = "1111111111111111111111111111111111111111111111111111111111111111"

            [[checkouts]]
            url = "https://github.com/llvm/llvm-project.git"
            dir = "llvm-project"

            [[scripts]]
            src = "build.sh"
            dst = "llvm-project/build.sh"

            [[corpora]]
            url = "https://example.com/public.zip"
            dir = "corpus"
            "#,
            ConfigFormat::Toml,
        )
        .unwrap()
    }

    fn run_with(fake: &Fake, root: PathBuf) -> ProvisionRun {
        let env = Environment::at(root);
        Provisioner::new(&env, fake, fake, fake, fake).run(&config())
    }

    #[test]
    fn phases_run_in_order() {
        let temp = tempfile::TempDir::new().unwrap();
        let fake = Fake::default();
        let run = run_with(&fake, temp.path().to_path_buf());

        assert_eq!(run.state, BuildState::Staged);
        assert!(run.error.is_none());
        assert_eq!(
            fake.calls(),
            [
                "packages:1",
                "tool:cmake",
                "checkout:llvm-project",
                "script:llvm-project/build.sh:1",
                "corpus:corpus",
            ]
        );

        // the corpus failure is tolerated and left out of the receipt
        assert!(run.receipt.corpora.is_empty());
        let written = Receipt::from_path(temp.path().join("fuzzenv.receipt.toml")).unwrap();
        assert_eq!(written, run.receipt);
        assert!(written.tools.contains_key("cmake"));
        assert!(written.checkouts.contains_key("llvm-project"));
    }

    #[test]
    fn failed_phase_stops_the_run() {
        let cases = [
            (Phase::Packages, 1),
            (Phase::Tools, 2),
            (Phase::Checkout, 3),
            (Phase::Staging, 4),
        ];

        for (phase, calls_made) in cases {
            let temp = tempfile::TempDir::new().unwrap();
            let fake = Fake::failing(phase);
            let run = run_with(&fake, temp.path().to_path_buf());

            assert_eq!(run.state, BuildState::Failed(phase));
            assert_eq!(fake.calls().len(), calls_made, "{phase}: {:?}", fake.calls());
            let err = run.error.unwrap();
            assert_eq!(err.phase(), phase);
            assert_eq!(err.exit_code(), phase.exit_code());
            assert!(!temp.path().join("fuzzenv.receipt.toml").exists());
        }
    }

    #[test]
    fn checksum_failure_never_reaches_checkout() {
        let temp = tempfile::TempDir::new().unwrap();
        let fake = Fake::failing(Phase::Tools);
        let run = run_with(&fake, temp.path().to_path_buf());

        assert!(!fake.calls().iter().any(|c| c.starts_with("checkout:")));
        assert!(run.receipt.tools.is_empty());
        assert!(matches!(
            run.into_result(),
            Err(ProvisionError::Tool(ToolError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn transitions_only_move_forward() {
        assert_eq!(
            BuildState::NotStarted.complete(Phase::Packages),
            Some(BuildState::PackagesInstalled)
        );
        assert_eq!(BuildState::NotStarted.complete(Phase::Tools), None);
        assert_eq!(BuildState::PackagesInstalled.complete(Phase::Packages), None);
        assert_eq!(
            BuildState::SourceReady.complete(Phase::Staging),
            Some(BuildState::Staged)
        );
        assert_eq!(BuildState::Staged.complete(Phase::Staging), None);
        assert_eq!(BuildState::Failed(Phase::Tools).complete(Phase::Checkout), None);
        assert!(BuildState::Staged.is_terminal());
        assert!(BuildState::Failed(Phase::Tools).is_terminal());
        assert!(!BuildState::ToolsInstalled.is_terminal());
        assert_eq!(BuildState::Failed(Phase::Tools).to_string(), "FAILED(tools)");
    }
}
