//! Shallow git checkouts of upstream sources.

use fuzzenv_core::{
    CheckedOut, CheckoutError, CommandOutput, CommandRunner, Environment, RetryPolicy,
    SourceCheckout, SourceFetcher, SystemRunner,
};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Clones sources with the `git` CLI.
#[derive(Debug, Clone, Default)]
pub struct GitCheckout<R = SystemRunner> {
    runner: R,
    retry: RetryPolicy,
}

impl GitCheckout {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: CommandRunner> GitCheckout<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the retry policy for network failures.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn git(&self, args: &[&str], cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
        let argv: Vec<String> = std::iter::once("git")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect();
        self.runner.run(&argv, cwd)
    }

    /// Commit at HEAD of a checkout.
    fn head(&self, dir: &Path) -> Option<String> {
        let out = self.git(&["rev-parse", "HEAD"], Some(dir)).ok()?;
        let sha = out.stdout.trim();
        (out.success() && !sha.is_empty()).then(|| sha.to_string())
    }

    /// `remote.origin.url` of an existing checkout.
    fn origin(&self, dir: &Path) -> Option<String> {
        let out = self
            .git(&["config", "--get", "remote.origin.url"], Some(dir))
            .ok()?;
        out.success().then(|| out.stdout.trim().to_string())
    }

    fn clone_once(&self, checkout: &SourceCheckout, dir: &Path, attempt: u32) -> Result<(), CheckoutError> {
        let depth = checkout.depth.to_string();
        let dir_arg = dir.to_string_lossy();
        let mut args = vec!["clone", "--depth", depth.as_str(), "--single-branch"];
        if let Some(reference) = &checkout.reference {
            args.extend(["--branch", reference.as_str()]);
        }
        args.extend(["--", checkout.url.as_str(), dir_arg.as_ref()]);

        debug!(url = %checkout.url, attempt, "git clone");
        let out = self.git(&args, None).map_err(|e| CheckoutError::Git {
            url: checkout.url.clone(),
            reason: format!("cannot run git: {e}"),
        })?;

        if out.success() {
            return Ok(());
        }
        Err(classify_failure(&checkout.url, attempt, &out))
    }
}

/// A missing ref will not appear on retry; anything else is treated as
/// a network problem.
fn classify_failure(url: &str, attempt: u32, out: &CommandOutput) -> CheckoutError {
    let stderr = out.stderr.to_ascii_lowercase();
    if stderr.contains("remote branch") && stderr.contains("not found") {
        return CheckoutError::Git {
            url: url.to_string(),
            reason: out.summary(),
        };
    }
    CheckoutError::Network {
        url: url.to_string(),
        attempts: attempt,
        reason: out.summary(),
    }
}

fn is_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// Put `dir` back the way it was before a failed clone.
fn discard_partial(dir: &Path, existed: bool) {
    if dir.exists()
        && let Err(e) = fs::remove_dir_all(dir)
    {
        warn!(dir = %dir.display(), error = %e, "cannot remove partial checkout");
        return;
    }
    if existed && let Err(e) = fs::create_dir(dir) {
        warn!(dir = %dir.display(), error = %e, "cannot restore checkout directory");
    }
}

impl<R: CommandRunner> SourceFetcher for GitCheckout<R> {
    fn checkout(&self, env: &Environment, checkout: &SourceCheckout) -> Result<CheckedOut, CheckoutError> {
        let dir = env.checkout_dir(checkout);
        let existed = dir.exists();

        if existed && !is_empty_dir(&dir) {
            if self.origin(&dir).as_deref() == Some(checkout.url.as_str()) {
                info!(url = %checkout.url, dir = %dir.display(), "already checked out");
                return Ok(CheckedOut {
                    url: checkout.url.clone(),
                    depth: checkout.depth,
                    head: self.head(&dir),
                });
            }
            return Err(CheckoutError::Conflict {
                url: checkout.url.clone(),
                dir,
            });
        }

        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(|source| CheckoutError::Io {
                url: checkout.url.clone(),
                dir: dir.clone(),
                source,
            })?;
        }

        self.retry.run(
            &checkout.url,
            |attempt| {
                let result = self.clone_once(checkout, &dir, attempt);
                if result.is_err() {
                    discard_partial(&dir, existed);
                }
                result
            },
            CheckoutError::is_retryable,
        )?;

        let head = self.head(&dir);
        info!(url = %checkout.url, head = head.as_deref().unwrap_or("unknown"), "checked out");
        Ok(CheckedOut {
            url: checkout.url.clone(),
            depth: checkout.depth,
            head,
        })
    }
}
