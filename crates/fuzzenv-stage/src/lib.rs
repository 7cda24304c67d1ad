//! Places build scripts and seed corpora where the external build driver
//! expects them.

use fuzzenv_core::{
    CorpusSeed, Environment, Fetcher, SeededCorpus, StageError, StagedFile, StagedScript, Stager,
    UrlFetcher,
};
use std::collections::BTreeMap;
use std::fs;
use std::io::Cursor;
use std::path::Path;
use tracing::{debug, info};

/// Copies scripts and extracts corpora into the source directory.
#[derive(Debug, Clone, Default)]
pub struct ScriptStager<F = UrlFetcher> {
    fetcher: F,
}

impl ScriptStager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<F: Fetcher> ScriptStager<F> {
    /// Use `fetcher` to download corpora.
    pub fn with_fetcher(fetcher: F) -> Self {
        Self { fetcher }
    }
}

fn create_parent(path: &Path) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StageError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Render `src` into `dst`, keeping the source's permissions.
fn render(src: &Path, dst: &Path, vars: &BTreeMap<String, String>) -> Result<u64, StageError> {
    let read_err = |source| StageError::Read {
        path: src.to_path_buf(),
        source,
    };
    let write_err = |source| StageError::Write {
        path: dst.to_path_buf(),
        source,
    };

    let template = fs::read_to_string(src).map_err(read_err)?;
    let permissions = fs::metadata(src).map_err(read_err)?.permissions();
    let expanded = substitute(&template, vars);
    fs::write(dst, &expanded).map_err(write_err)?;
    fs::set_permissions(dst, permissions).map_err(write_err)?;
    Ok(expanded.len() as u64)
}

/// Simple variable substitution: replaces `{{key}}` with value.
pub fn substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{key}}}}}"), value);
    }
    result
}

impl<F: Fetcher> Stager for ScriptStager<F> {
    fn stage_script(
        &self,
        env: &Environment,
        script: &StagedScript,
        variables: &BTreeMap<String, String>,
    ) -> Result<StagedFile, StageError> {
        let src = env.script_source(script);
        let dst = env.script_destination(script);

        if !src.is_file() {
            return Err(StageError::Read {
                path: src,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }
        create_parent(&dst)?;

        let bytes = if script.template {
            render(&src, &dst, variables)?
        } else {
            // fs::copy carries the permission bits along
            fs::copy(&src, &dst).map_err(|source| StageError::Write {
                path: dst.clone(),
                source,
            })?
        };

        debug!(src = %src.display(), dst = %dst.display(), bytes, "staged");
        Ok(StagedFile { source: src, bytes })
    }

    fn seed_corpus(&self, env: &Environment, corpus: &CorpusSeed) -> Result<SeededCorpus, StageError> {
        let corpus_err = |reason: String| StageError::Corpus {
            url: corpus.url.clone(),
            reason,
        };

        let bytes = self
            .fetcher
            .fetch(&corpus.url)
            .map_err(|e| corpus_err(e.to_string()))?;
        let mut archive =
            zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| corpus_err(e.to_string()))?;
        let files = archive.file_names().filter(|n| !n.ends_with('/')).count();

        let dir = env.corpus_dir(corpus);
        fs::create_dir_all(&dir).map_err(|source| StageError::Write {
            path: dir.clone(),
            source,
        })?;
        archive
            .extract(&dir)
            .map_err(|e| corpus_err(e.to_string()))?;

        info!(url = %corpus.url, dir = %dir.display(), files, "seeded corpus");
        Ok(SeededCorpus {
            url: corpus.url.clone(),
            files,
        })
    }
}
