//! Checksum-verified installation of pinned tools.
//!
//! Artifacts are downloaded once into a cache keyed by their SHA-256,
//! verified against the config, unpacked into the tool's prefix, and the
//! tool's executable is linked into the environment's bin directory.

use fuzzenv_core::{
    Environment, Fetcher, InstalledTool, PinnedTool, ToolError, ToolInstaller, UrlFetcher, is_executable,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Marker left in an install prefix, holding the artifact's digest.
const CHECKSUM_MARKER: &str = ".fuzzenv-checksum";

/// Installs pinned tools from verified artifacts.
#[derive(Debug, Clone, Default)]
pub struct ToolStore<F = UrlFetcher> {
    fetcher: F,
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {}: {source}", .path.display())]
    WriteFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("prefix {} holds files fuzzenv did not install", .path.display())]
    PrefixOccupied { path: PathBuf },
    #[error("failed to unpack archive: {0}")]
    Unpack(String),
    #[error("failed to link {}: {source}", .link.display())]
    Link {
        link: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn into_tool_error(self, tool: &PinnedTool, prefix: &Path) -> ToolError {
        ToolError::Install {
            tool: tool.name.clone(),
            prefix: prefix.to_path_buf(),
            message: self.to_string(),
        }
    }
}

impl ToolStore {
    /// A store that downloads with the default [`UrlFetcher`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl<F: Fetcher> ToolStore<F> {
    pub fn with_fetcher(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Artifact bytes, from the download cache when possible.
    fn artifact(&self, tool: &PinnedTool, expected: &str, cache: Option<&Path>) -> Result<Vec<u8>, ToolError> {
        if let Some(cache) = cache
            && let Ok(bytes) = fs::read(cache.join(expected))
        {
            if hash_bytes(&bytes) == expected {
                debug!(tool = %tool.name, "using cached artifact");
                return Ok(bytes);
            }
            warn!(tool = %tool.name, "cached artifact is corrupt, downloading again");
        }

        let bytes = self.fetcher.fetch(&tool.url).map_err(|source| ToolError::Fetch {
            tool: tool.name.clone(),
            source,
        })?;

        let actual = hash_bytes(&bytes);
        if actual != expected {
            return Err(ToolError::ChecksumMismatch {
                tool: tool.name.clone(),
                expected: expected.to_string(),
                actual,
            });
        }

        if let Some(cache) = cache
            && let Err(e) = write_cache(cache, expected, &bytes)
        {
            warn!(tool = %tool.name, error = %e, "cannot cache artifact");
        }
        Ok(bytes)
    }
}

impl<F: Fetcher> ToolInstaller for ToolStore<F> {
    fn install_tool(&self, env: &Environment, tool: &PinnedTool) -> Result<InstalledTool, ToolError> {
        let expected = tool.expected_sha256();
        let prefix = env.tool_prefix(tool);
        let link = env.tool_link(tool);

        if installed_checksum(&prefix).as_deref() == Some(expected.as_str()) {
            info!(tool = %tool.name, prefix = %prefix.display(), "already installed");
        } else {
            check_prefix(&prefix).map_err(|e| e.into_tool_error(tool, &prefix))?;
            let cache = env.cache_dir.clone().or_else(default_cache_dir);
            let bytes = self.artifact(tool, &expected, cache.as_deref())?;
            install_into(&bytes, tool, &prefix, &expected).map_err(|e| e.into_tool_error(tool, &prefix))?;
        }

        let binary = locate_binary(tool, &prefix).ok_or_else(|| ToolError::BinaryNotFound {
            tool: tool.name.clone(),
            binary: tool
                .bin
                .as_ref()
                .map(|b| b.display().to_string())
                .unwrap_or_else(|| tool.link_name().to_string()),
            prefix: prefix.clone(),
        })?;

        activate(&binary, &link).map_err(|e| e.into_tool_error(tool, &prefix))?;
        info!(tool = %tool.name, link = %link.display(), "linked");

        Ok(InstalledTool {
            version: tool.version.clone(),
            sha256: expected,
            prefix,
            binary,
            link,
        })
    }
}

/// `<user cache>/fuzzenv/downloads`.
fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("fuzzenv").join("downloads"))
}

fn write_cache(cache: &Path, digest: &str, bytes: &[u8]) -> Result<(), StoreError> {
    fs::create_dir_all(cache).map_err(|source| StoreError::CreateDir {
        path: cache.to_path_buf(),
        source,
    })?;
    let path = cache.join(digest);
    fs::write(&path, bytes).map_err(|source| StoreError::WriteFile { path, source })
}

/// Digest recorded by a previous install into `prefix`, if any.
fn installed_checksum(prefix: &Path) -> Option<String> {
    fs::read_to_string(prefix.join(CHECKSUM_MARKER))
        .ok()
        .map(|s| s.trim().to_string())
}

/// A prefix may be (re)filled only when it is missing, empty, or holds an
/// earlier fuzzenv install.
fn check_prefix(prefix: &Path) -> Result<(), StoreError> {
    if !prefix.exists() || prefix.join(CHECKSUM_MARKER).is_file() {
        return Ok(());
    }
    let empty = fs::read_dir(prefix)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        Ok(())
    } else {
        Err(StoreError::PrefixOccupied {
            path: prefix.to_path_buf(),
        })
    }
}

/// Replace a previous install in `prefix` with the unpacked artifact.
fn install_into(bytes: &[u8], tool: &PinnedTool, prefix: &Path, digest: &str) -> Result<(), StoreError> {
    check_prefix(prefix)?;
    if prefix.exists() {
        fs::remove_dir_all(prefix).map_err(|source| StoreError::WriteFile {
            path: prefix.to_path_buf(),
            source,
        })?;
    }
    fs::create_dir_all(prefix).map_err(|source| StoreError::CreateDir {
        path: prefix.to_path_buf(),
        source,
    })?;

    if !try_unpack_archive(bytes, prefix)? {
        // Single binary - write with executable permissions
        let bin_path = prefix.join(tool.link_name());
        fs::write(&bin_path, bytes).map_err(|source| StoreError::WriteFile {
            path: bin_path.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&bin_path, fs::Permissions::from_mode(0o755))
                .map_err(|source| StoreError::WriteFile { path: bin_path, source })?;
        }
    }

    let marker = prefix.join(CHECKSUM_MARKER);
    fs::write(&marker, digest).map_err(|source| StoreError::WriteFile { path: marker, source })
}

/// Find the tool's executable inside its prefix.
fn locate_binary(tool: &PinnedTool, prefix: &Path) -> Option<PathBuf> {
    if let Some(bin) = &tool.bin {
        let path = prefix.join(bin);
        return is_executable(&path).then_some(path);
    }

    let name = tool.link_name();
    let mut candidates = vec![prefix.join(name), prefix.join("bin").join(name)];

    // Release tarballs usually wrap everything in one top-level directory.
    if let Ok(entries) = fs::read_dir(prefix) {
        let mut nested: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .map(|p| p.join("bin").join(name))
            .collect();
        nested.sort();
        candidates.extend(nested);
    }

    candidates.push(prefix.join("usr/bin").join(name));
    candidates.push(prefix.join("usr/local/bin").join(name));

    candidates.into_iter().find(|p| is_executable(p))
}

/// Point `link` at `binary`, replacing any existing link.
fn activate(binary: &Path, link: &Path) -> Result<(), StoreError> {
    let link_err = |source| StoreError::Link {
        link: link.to_path_buf(),
        source,
    };

    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    if link.symlink_metadata().is_ok() {
        fs::remove_file(link).map_err(link_err)?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(binary, link).map_err(link_err)?;
    #[cfg(windows)]
    std::os::windows::fs::symlink_file(binary, link).map_err(link_err)?;

    Ok(())
}

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Try to unpack an archive. Returns true if it was an archive.
fn try_unpack_archive(bytes: &[u8], dest: &Path) -> Result<bool, StoreError> {
    // tar.gz
    if bytes.len() > 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let decoder = flate2::read::GzDecoder::new(bytes);
        tar::Archive::new(decoder)
            .unpack(dest)
            .map_err(|e| StoreError::Unpack(e.to_string()))?;
        return Ok(true);
    }

    // tar.xz
    if bytes.len() > 6 && &bytes[0..6] == b"\xfd7zXZ\x00" {
        let decoder = xz2::read::XzDecoder::new(bytes);
        tar::Archive::new(decoder)
            .unpack(dest)
            .map_err(|e| StoreError::Unpack(e.to_string()))?;
        return Ok(true);
    }

    // zip
    if bytes.len() > 4 && &bytes[0..4] == b"PK\x03\x04" {
        let mut archive = zip::ZipArchive::new(io::Cursor::new(bytes))
            .map_err(|e| StoreError::Unpack(e.to_string()))?;
        archive
            .extract(dest)
            .map_err(|e| StoreError::Unpack(e.to_string()))?;
        return Ok(true);
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzenv_core::FetchError;
    use std::cell::Cell;
    use std::collections::HashMap;
    use tempfile::TempDir;

    /// Serves canned bodies and counts requests.
    #[derive(Default)]
    struct StaticFetcher {
        bodies: HashMap<String, Vec<u8>>,
        requests: Cell<usize>,
    }

    impl StaticFetcher {
        fn serving(url: &str, body: Vec<u8>) -> Self {
            let mut fetcher = Self::default();
            fetcher.bodies.insert(url.to_string(), body);
            fetcher
        }
    }

    impl Fetcher for StaticFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.set(self.requests.get() + 1);
            self.bodies.get(url).cloned().ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                code: 404,
            })
        }
    }

    const URL: &str = "https://example.com/cmake-3.15.7-Linux-x86_64.tar.gz";

    /// A gzipped tarball holding `<top>/bin/cmake`.
    fn cmake_tarball() -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let script = b"#!/bin/sh\necho cmake version 3.15.7\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(script.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "cmake-3.15.7-Linux-x86_64/bin/cmake", &script[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn tool(checksum: &str) -> PinnedTool {
        PinnedTool {
            name: "cmake".to_string(),
            version: "3.15.7".to_string(),
            url: URL.to_string(),
            checksum: checksum.to_string(),
            prefix: None,
            link: None,
            bin: None,
        }
    }

    fn env(temp: &TempDir) -> Environment {
        let mut env = Environment::at(temp.path().join("env"));
        env.cache_dir = Some(temp.path().join("cache"));
        env
    }

    #[test]
    fn installs_and_links_tarball() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));

        let installed = store.install_tool(&env, &tool(&digest)).unwrap();

        assert_eq!(installed.sha256, digest);
        assert_eq!(installed.prefix, env.tools_dir.join("cmake-3.15.7"));
        assert_eq!(
            installed.binary,
            installed.prefix.join("cmake-3.15.7-Linux-x86_64/bin/cmake")
        );
        let link = env.bin_dir.join("cmake");
        assert_eq!(installed.link, link);
        assert_eq!(fs::read_link(&link).unwrap(), installed.binary);
    }

    #[test]
    fn checksum_mismatch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, cmake_tarball()));
        let wrong = "0".repeat(64);

        let err = store.install_tool(&env, &tool(&wrong)).unwrap_err();

        assert!(matches!(err, ToolError::ChecksumMismatch { ref expected, .. } if *expected == wrong));
        assert!(!env.tools_dir.join("cmake-3.15.7").exists());
        assert!(env.bin_dir.join("cmake").symlink_metadata().is_err());
        assert!(!temp.path().join("cache").join(&wrong).exists());
    }

    #[test]
    fn checksum_accepts_prefix_and_uppercase() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));

        let pinned = tool(&format!("sha256:{}", digest.to_uppercase()));
        assert!(store.install_tool(&env, &pinned).is_ok());
    }

    #[test]
    fn reinstall_reuses_prefix() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));

        let first = store.install_tool(&env, &tool(&digest)).unwrap();
        let second = store.install_tool(&env, &tool(&digest)).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.fetcher.requests.get(), 1);
    }

    #[test]
    fn cached_artifact_skips_download() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = cmake_tarball();
        let digest = hash_bytes(&body);

        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));
        store.install_tool(&env, &tool(&digest)).unwrap();
        fs::remove_dir_all(env.tools_dir.join("cmake-3.15.7")).unwrap();

        let offline = ToolStore::with_fetcher(StaticFetcher::default());
        offline.install_tool(&env, &tool(&digest)).unwrap();
        assert_eq!(offline.fetcher.requests.get(), 0);
    }

    #[test]
    fn raw_binary_is_made_executable() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = b"#!/bin/sh\necho gn\n".to_vec();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));

        let mut pinned = tool(&digest);
        pinned.link = Some("gn".to_string());
        let installed = store.install_tool(&env, &pinned).unwrap();

        assert_eq!(installed.binary, installed.prefix.join("gn"));
        assert!(is_executable(&installed.binary));
        assert_eq!(installed.link, env.bin_dir.join("gn"));
    }

    #[test]
    fn explicit_bin_must_exist() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));

        let mut pinned = tool(&digest);
        pinned.bin = Some(PathBuf::from("bin/cmake"));
        let err = store.install_tool(&env, &pinned).unwrap_err();
        assert!(matches!(err, ToolError::BinaryNotFound { .. }));
    }

    #[test]
    fn existing_link_is_replaced() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        fs::create_dir_all(&env.bin_dir).unwrap();
        let stale = temp.path().join("old-cmake");
        fs::write(&stale, "old").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(&stale, env.bin_dir.join("cmake")).unwrap();

        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));
        let installed = store.install_tool(&env, &tool(&digest)).unwrap();

        assert_eq!(fs::read_link(env.bin_dir.join("cmake")).unwrap(), installed.binary);
    }

    #[test]
    fn download_failure_is_reported() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let store = ToolStore::with_fetcher(StaticFetcher::default());

        let err = store.install_tool(&env, &tool(&"1".repeat(64))).unwrap_err();
        assert!(matches!(err, ToolError::Fetch { .. }));
    }

    #[test]
    fn occupied_prefix_is_left_alone() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let prefix = temp.path().join("usr-local");
        fs::create_dir_all(prefix.join("lib")).unwrap();
        fs::write(prefix.join("lib/precious.so"), "keep me").unwrap();

        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));
        let mut pinned = tool(&digest);
        pinned.prefix = Some(prefix.clone());

        let err = store.install_tool(&env, &pinned).unwrap_err();

        assert!(matches!(err, ToolError::Install { ref prefix, .. } if prefix.ends_with("usr-local")));
        assert!(err.to_string().contains("did not install"), "{err}");
        assert_eq!(fs::read_to_string(prefix.join("lib/precious.so")).unwrap(), "keep me");
        assert!(env.bin_dir.join("cmake").symlink_metadata().is_err());
        assert_eq!(store.fetcher.requests.get(), 0);
    }

    #[test]
    fn stale_install_is_replaced() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let prefix = env.tools_dir.join("cmake-3.15.7");
        fs::create_dir_all(prefix.join("bin")).unwrap();
        fs::write(prefix.join("bin/cmake-old"), "old").unwrap();
        fs::write(prefix.join(CHECKSUM_MARKER), "2".repeat(64)).unwrap();

        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));
        let installed = store.install_tool(&env, &tool(&digest)).unwrap();

        assert!(!prefix.join("bin/cmake-old").exists());
        assert_eq!(installed_checksum(&prefix).as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn empty_prefix_is_filled() {
        let temp = TempDir::new().unwrap();
        let env = env(&temp);
        let prefix = temp.path().join("opt-cmake");
        fs::create_dir_all(&prefix).unwrap();

        let body = cmake_tarball();
        let digest = hash_bytes(&body);
        let store = ToolStore::with_fetcher(StaticFetcher::serving(URL, body));
        let mut pinned = tool(&digest);
        pinned.prefix = Some(prefix.clone());

        let installed = store.install_tool(&env, &pinned).unwrap();
        assert!(installed.binary.starts_with(&prefix));
    }
}
