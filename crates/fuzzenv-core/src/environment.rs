//! The filesystem locations a provisioning run is allowed to touch.
//!
//! Every phase receives an [`Environment`] instead of consulting ambient
//! state, so tests can point a whole run at a temporary directory.

use crate::config::{CorpusSeed, PinnedTool, ProvisionConfig, SourceCheckout, StagedScript};
use std::path::PathBuf;

/// Resolved directory layout of a provisioned environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    /// Base directory.
    pub root: PathBuf,
    /// Tool symlinks land here.
    pub bin_dir: PathBuf,
    /// Default parent of tool install prefixes.
    pub tools_dir: PathBuf,
    /// Checkouts, staged scripts and corpora.
    pub src_dir: PathBuf,
    /// Directory holding the config; staged script sources resolve here.
    pub config_dir: PathBuf,
    /// Download cache override.
    pub cache_dir: Option<PathBuf>,
}

const RECEIPT_FILE: &str = "fuzzenv.receipt.toml";

impl Environment {
    /// Resolve the `[environment]` section against the config's directory.
    pub fn from_config(config: &ProvisionConfig) -> Self {
        let settings = &config.environment;
        let config_dir = config.base_dir.clone();
        let root = match &settings.root {
            Some(root) => config_dir.join(root),
            None => config_dir.clone(),
        };

        Self {
            bin_dir: root.join(&settings.bin_dir),
            tools_dir: root.join(&settings.tools_dir),
            src_dir: root.join(&settings.src_dir),
            cache_dir: settings.cache_dir.as_ref().map(|d| config_dir.join(d)),
            config_dir,
            root,
        }
    }

    /// Default layout under `root`, with scripts read from `root` as well.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            bin_dir: root.join("bin"),
            tools_dir: root.join("tools"),
            src_dir: root.join("src"),
            config_dir: root.clone(),
            cache_dir: None,
            root,
        }
    }

    /// Install prefix of a pinned tool.
    pub fn tool_prefix(&self, tool: &PinnedTool) -> PathBuf {
        match &tool.prefix {
            Some(prefix) => self.root.join(prefix),
            None => self
                .tools_dir
                .join(format!("{}-{}", tool.name, tool.version)),
        }
    }

    /// Symlink path of a pinned tool.
    pub fn tool_link(&self, tool: &PinnedTool) -> PathBuf {
        self.bin_dir.join(tool.link_name())
    }

    pub fn checkout_dir(&self, checkout: &SourceCheckout) -> PathBuf {
        self.src_dir.join(&checkout.dir)
    }

    pub fn script_source(&self, script: &StagedScript) -> PathBuf {
        self.config_dir.join(&script.src)
    }

    pub fn script_destination(&self, script: &StagedScript) -> PathBuf {
        self.src_dir.join(&script.dst)
    }

    pub fn corpus_dir(&self, corpus: &CorpusSeed) -> PathBuf {
        self.src_dir.join(&corpus.dir)
    }

    /// Where the run receipt is written.
    pub fn receipt_path(&self) -> PathBuf {
        self.root.join(RECEIPT_FILE)
    }
}
