//! Provisioning config parsing for `fuzzenv.toml` (or `.json` / `.yaml`).

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use url::Url;

/// A parsed and validated provisioning config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Where the environment lives and how packages get installed.
    pub environment: EnvironmentSettings,
    /// OS packages, installed in one batch.
    pub packages: Vec<PackageSpec>,
    /// Pinned build tools.
    pub tools: Vec<PinnedTool>,
    /// Source trees to clone.
    pub checkouts: Vec<SourceCheckout>,
    /// Scripts copied into the environment for the external build driver.
    pub scripts: Vec<StagedScript>,
    /// Seed corpora extracted next to the sources.
    pub corpora: Vec<CorpusSeed>,
    /// Values substituted into templated scripts.
    pub variables: BTreeMap<String, toml::Value>,
    /// Directory the config was loaded from. Relative paths resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// The `[environment]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentSettings {
    /// Base for the other directories. Defaults to the config's directory.
    pub root: Option<PathBuf>,
    /// Directory that receives tool symlinks; callers put it on PATH.
    pub bin_dir: PathBuf,
    /// Parent of the default tool install prefixes.
    pub tools_dir: PathBuf,
    /// Parent of checkouts, staged scripts and corpora.
    pub src_dir: PathBuf,
    /// Package manager id (`apt`, `dnf`, ...). Detected when absent.
    pub package_manager: Option<String>,
    /// Run package manager commands through sudo.
    pub sudo: bool,
    /// Refresh the package index before installing.
    pub update: bool,
    /// Download cache. Defaults to the user cache directory.
    pub cache_dir: Option<PathBuf>,
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            root: None,
            bin_dir: PathBuf::from("bin"),
            tools_dir: PathBuf::from("tools"),
            src_dir: PathBuf::from("src"),
            package_manager: None,
            sudo: false,
            update: true,
            cache_dir: None,
        }
    }
}

/// An OS package, optionally version-constrained.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "PackageEntry")]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
}

/// Packages may be written as a bare name or as a table.
#[derive(Deserialize)]
#[serde(untagged)]
enum PackageEntry {
    Name(String),
    Table {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
}

impl From<PackageEntry> for PackageSpec {
    fn from(entry: PackageEntry) -> Self {
        match entry {
            PackageEntry::Name(name) => Self {
                name,
                version: None,
            },
            PackageEntry::Table { name, version } => Self { name, version },
        }
    }
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} ({v})", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// A build tool pinned to an exact artifact.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PinnedTool {
    pub name: String,
    pub version: String,
    /// Artifact download location.
    pub url: String,
    /// Expected SHA-256 of the artifact, optionally prefixed with `sha256:`.
    pub checksum: String,
    /// Install prefix. Defaults to `<tools_dir>/<name>-<version>`.
    #[serde(default)]
    pub prefix: Option<PathBuf>,
    /// Symlink name in the bin directory. Defaults to the tool name.
    #[serde(default)]
    pub link: Option<String>,
    /// Executable path relative to the prefix. Searched for when absent.
    #[serde(default)]
    pub bin: Option<PathBuf>,
}

impl PinnedTool {
    /// Name of the symlink created in the bin directory.
    pub fn link_name(&self) -> &str {
        self.link.as_deref().unwrap_or(&self.name)
    }

    /// The expected digest as lowercase hex, without any algorithm prefix.
    pub fn expected_sha256(&self) -> String {
        let raw = self.checksum.trim();
        raw.strip_prefix("sha256:").unwrap_or(raw).to_ascii_lowercase()
    }
}

/// A depth-limited clone of an upstream repository.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceCheckout {
    pub url: String,
    /// Number of commits of history to fetch.
    #[serde(default = "default_depth")]
    pub depth: u32,
    /// Target directory, relative to the source directory.
    pub dir: PathBuf,
    /// Branch or tag to check out instead of the remote HEAD.
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

fn default_depth() -> u32 {
    1
}

/// A script copied into the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagedScript {
    /// Source path, relative to the config's directory.
    pub src: PathBuf,
    /// Destination path, relative to the source directory.
    pub dst: PathBuf,
    /// Substitute `{{key}}` occurrences from `[variables]`.
    #[serde(default)]
    pub template: bool,
}

/// A zipped seed corpus.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorpusSeed {
    pub url: String,
    /// Extraction directory, relative to the source directory.
    pub dir: PathBuf,
}

/// Supported config file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    /// Pick a format from the file extension; anything unknown is TOML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ConfigFormat::Json,
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        }
    }
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConfigFormat::Toml => "TOML",
            ConfigFormat::Json => "JSON",
            ConfigFormat::Yaml => "YAML",
        })
    }
}

/// Errors that can occur when loading a config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format} config: {message}")]
    Parse {
        format: ConfigFormat,
        message: String,
    },
    #[error("{item}: missing required field '{field}'")]
    MissingField { item: String, field: &'static str },
    #[error("{item}: malformed URL '{url}': {reason}")]
    InvalidUrl {
        item: String,
        url: String,
        reason: String,
    },
    #[error("{item}: unsupported URL scheme '{scheme}' in '{url}'")]
    UnsupportedScheme {
        item: String,
        url: String,
        scheme: String,
    },
    #[error("{item}: checksum '{checksum}' is not a SHA-256 hex digest")]
    InvalidChecksum { item: String, checksum: String },
    #[error("{item}: clone depth must be at least 1")]
    InvalidDepth { item: String },
    #[error("{item}: path '{path}' must be relative and stay inside its base directory")]
    InvalidPath { item: String, path: String },
    #[error("unknown package manager '{0}'")]
    UnknownPackageManager(String),
    #[error("tools '{first}' and '{second}' both link '{link}'")]
    DuplicateLink {
        link: String,
        first: String,
        second: String,
    },
}

const SOURCE_SCHEMES: &[&str] = &["http", "https", "git", "ssh", "file"];
const ARTIFACT_SCHEMES: &[&str] = &["http", "https", "file"];

impl ProvisionConfig {
    /// Load and validate a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config = Self::parse(&contents, ConfigFormat::from_path(path))?;
        config.base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(config)
    }

    /// Parse and validate config text. Relative paths resolve against `.`.
    pub fn parse(s: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse { format, message };

        let mut config: ProvisionConfig = match format {
            ConfigFormat::Toml => toml::from_str(s).map_err(|e| parse_err(e.to_string()))?,
            ConfigFormat::Json => serde_json::from_str(s).map_err(|e| parse_err(e.to_string()))?,
            ConfigFormat::Yaml => serde_yaml::from_str(s).map_err(|e| parse_err(e.to_string()))?,
        };
        config.base_dir = PathBuf::from(".");
        config.validate()?;
        Ok(config)
    }

    /// Check every field the loader cannot express through serde alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.environment.package_manager
            && crate::Ecosystem::from_id(id).is_none()
        {
            return Err(ConfigError::UnknownPackageManager(id.clone()));
        }

        for (i, pkg) in self.packages.iter().enumerate() {
            require(&format!("packages[{i}]"), "name", &pkg.name)?;
        }

        let mut links: BTreeMap<&str, &str> = BTreeMap::new();
        for (i, tool) in self.tools.iter().enumerate() {
            let item = format!("tools[{i}]");
            require(&item, "name", &tool.name)?;
            let item = format!("tools[{i}] ({})", tool.name);
            require(&item, "version", &tool.version)?;
            require(&item, "url", &tool.url)?;
            require(&item, "checksum", &tool.checksum)?;
            check_segment(&item, &tool.name)?;
            check_segment(&item, &tool.version)?;
            check_url(&item, &tool.url, ARTIFACT_SCHEMES)?;

            let digest = tool.expected_sha256();
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::InvalidChecksum {
                    item,
                    checksum: tool.checksum.clone(),
                });
            }

            if let Some(prefix) = &tool.prefix
                && !prefix.is_absolute()
            {
                check_relative(&item, prefix)?;
            }
            if let Some(bin) = &tool.bin {
                check_relative(&item, bin)?;
            }

            let link = tool.link_name();
            check_segment(&item, link)?;
            if let Some(first) = links.insert(link, &tool.name) {
                return Err(ConfigError::DuplicateLink {
                    link: link.to_string(),
                    first: first.to_string(),
                    second: tool.name.clone(),
                });
            }
        }

        let mut dirs = HashSet::new();
        for (i, checkout) in self.checkouts.iter().enumerate() {
            let item = format!("checkouts[{i}]");
            require(&item, "url", &checkout.url)?;
            check_url(&item, &checkout.url, SOURCE_SCHEMES)?;
            if checkout.depth == 0 {
                return Err(ConfigError::InvalidDepth { item });
            }
            check_relative(&item, &checkout.dir)?;
            if !dirs.insert(&checkout.dir) {
                return Err(ConfigError::InvalidPath {
                    item,
                    path: checkout.dir.display().to_string(),
                });
            }
        }

        for (i, script) in self.scripts.iter().enumerate() {
            let item = format!("scripts[{i}]");
            if script.src.as_os_str().is_empty() {
                return Err(ConfigError::MissingField { item, field: "src" });
            }
            check_relative(&item, &script.dst)?;
        }

        for (i, corpus) in self.corpora.iter().enumerate() {
            let item = format!("corpora[{i}]");
            require(&item, "url", &corpus.url)?;
            check_url(&item, &corpus.url, ARTIFACT_SCHEMES)?;
            check_relative(&item, &corpus.dir)?;
        }

        Ok(())
    }

    /// Get a variable value as a string.
    pub fn get_variable(&self, name: &str) -> Option<String> {
        self.variables.get(name).and_then(|v| match v {
            toml::Value::String(s) => Some(s.clone()),
            toml::Value::Integer(i) => Some(i.to_string()),
            toml::Value::Float(f) => Some(f.to_string()),
            toml::Value::Boolean(b) => Some(b.to_string()),
            _ => None,
        })
    }

    /// All scalar variables, stringified.
    pub fn string_variables(&self) -> BTreeMap<String, String> {
        self.variables
            .keys()
            .filter_map(|k| self.get_variable(k).map(|v| (k.clone(), v)))
            .collect()
    }
}

/// A value used as a single path component, such as a tool name.
fn check_segment(item: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() || value.contains(['/', '\\']) || value.contains("..") {
        return Err(ConfigError::InvalidPath {
            item: item.to_string(),
            path: value.to_string(),
        });
    }
    Ok(())
}

fn require(item: &str, field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField {
            item: item.to_string(),
            field,
        });
    }
    Ok(())
}

fn check_url(item: &str, raw: &str, schemes: &[&str]) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        item: item.to_string(),
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            item: item.to_string(),
            url: raw.to_string(),
            scheme: url.scheme().to_string(),
        });
    }
    if url.scheme() != "file" && url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidUrl {
            item: item.to_string(),
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn check_relative(item: &str, path: &Path) -> Result<(), ConfigError> {
    let escapes = path.as_os_str().is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(ConfigError::InvalidPath {
            item: item.to_string(),
            path: path.display().to_string(),
        });
    }
    Ok(())
}
