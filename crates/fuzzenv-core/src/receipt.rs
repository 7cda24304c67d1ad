//! Record of a finished run, written to `fuzzenv.receipt.toml`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// What a successful run left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Installed tools, keyed by tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, InstalledTool>,
    /// Checkouts, keyed by directory relative to the source directory.
    #[serde(default)]
    pub checkouts: BTreeMap<String, CheckedOut>,
    /// Staged scripts, keyed by destination relative to the source directory.
    #[serde(default)]
    pub scripts: BTreeMap<String, StagedFile>,
    /// Seeded corpora, keyed by directory relative to the source directory.
    #[serde(default)]
    pub corpora: BTreeMap<String, SeededCorpus>,
}

/// A pinned tool as installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledTool {
    pub version: String,
    /// Verified SHA-256 of the artifact.
    pub sha256: String,
    pub prefix: PathBuf,
    /// Executable the symlink points at.
    pub binary: PathBuf,
    pub link: PathBuf,
}

/// A source tree as checked out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedOut {
    pub url: String,
    pub depth: u32,
    /// Commit at HEAD, when it could be determined.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
}

/// A script as staged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub source: PathBuf,
    pub bytes: u64,
}

/// A corpus as extracted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededCorpus {
    pub url: String,
    pub files: usize,
}

/// Errors that can occur with receipts.
#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("failed to read receipt: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse receipt: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize receipt: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl Receipt {
    /// Load a receipt from a path.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ReceiptError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse a receipt from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ReceiptError> {
        Ok(toml::from_str(s)?)
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String, ReceiptError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write to a file, creating parent directories.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), ReceiptError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_receipt() {
        let toml = r#"
            [tools.cmake]
            version = "3.15.7"
            sha256 = "abc123"
            prefix = "/env/tools/cmake-3.15.7"
            binary = "/env/tools/cmake-3.15.7/cmake-3.15.7-Linux-x86_64/bin/cmake"
            link = "/env/bin/cmake"

            [checkouts.llvm-project]
            url = "https://github.com/llvm/llvm-project.git"
            depth = 1
            head = "0123456789abcdef0123456789abcdef01234567"

            [scripts."llvm-project/build.sh"]
            source = "/work/build.sh"
            bytes = 512
        "#;

        let receipt = Receipt::parse(toml).unwrap();
        assert_eq!(receipt.tools["cmake"].version, "3.15.7");
        assert_eq!(receipt.checkouts["llvm-project"].depth, 1);
        assert_eq!(receipt.scripts["llvm-project/build.sh"].bytes, 512);
        assert!(receipt.corpora.is_empty());
    }

    #[test]
    fn write_then_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("nested").join("fuzzenv.receipt.toml");

        let mut receipt = Receipt::default();
        receipt.checkouts.insert(
            "repo".to_string(),
            CheckedOut {
                url: "https://example.com/repo.git".to_string(),
                depth: 1,
                head: None,
            },
        );
        receipt.write(&path).unwrap();

        let loaded = Receipt::from_path(&path).unwrap();
        assert_eq!(loaded, receipt);
        assert!(!std::fs::read_to_string(&path).unwrap().contains("head"));
    }
}
