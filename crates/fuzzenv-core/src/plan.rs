//! Dry-run view of what a provisioning run would do.

use crate::config::{PackageSpec, ProvisionConfig};
use crate::environment::Environment;
use crate::error::Phase;
use std::fmt;
use std::path::PathBuf;

/// One action of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    InstallPackages {
        packages: Vec<PackageSpec>,
    },
    InstallTool {
        name: String,
        version: String,
        url: String,
        prefix: PathBuf,
        link: PathBuf,
    },
    Clone {
        url: String,
        depth: u32,
        reference: Option<String>,
        dir: PathBuf,
    },
    StageScript {
        src: PathBuf,
        dst: PathBuf,
        template: bool,
    },
    SeedCorpus {
        url: String,
        dir: PathBuf,
    },
}

impl Step {
    /// The phase this step belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Step::InstallPackages { .. } => Phase::Packages,
            Step::InstallTool { .. } => Phase::Tools,
            Step::Clone { .. } => Phase::Checkout,
            Step::StageScript { .. } | Step::SeedCorpus { .. } => Phase::Staging,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::InstallPackages { packages } => {
                let names: Vec<String> = packages.iter().map(ToString::to_string).collect();
                write!(f, "install packages: {}", names.join(", "))
            }
            Step::InstallTool {
                name,
                version,
                url,
                prefix,
                link,
            } => write!(
                f,
                "install {name} {version} from {url} into {} (linked as {})",
                prefix.display(),
                link.display()
            ),
            Step::Clone {
                url,
                depth,
                reference,
                dir,
            } => {
                write!(f, "clone {url} (depth {depth}")?;
                if let Some(r) = reference {
                    write!(f, ", ref {r}")?;
                }
                write!(f, ") into {}", dir.display())
            }
            Step::StageScript { src, dst, template } => {
                let verb = if *template { "render" } else { "copy" };
                write!(f, "{verb} {} to {}", src.display(), dst.display())
            }
            Step::SeedCorpus { url, dir } => {
                write!(f, "seed corpus {} from {url}", dir.display())
            }
        }
    }
}

/// Every step of a run, in execution order.
pub fn plan(config: &ProvisionConfig, env: &Environment) -> Vec<Step> {
    let mut steps = Vec::new();

    if !config.packages.is_empty() {
        steps.push(Step::InstallPackages {
            packages: config.packages.clone(),
        });
    }

    steps.extend(config.tools.iter().map(|tool| Step::InstallTool {
        name: tool.name.clone(),
        version: tool.version.clone(),
        url: tool.url.clone(),
        prefix: env.tool_prefix(tool),
        link: env.tool_link(tool),
    }));

    steps.extend(config.checkouts.iter().map(|c| Step::Clone {
        url: c.url.clone(),
        depth: c.depth,
        reference: c.reference.clone(),
        dir: env.checkout_dir(c),
    }));

    steps.extend(config.scripts.iter().map(|s| Step::StageScript {
        src: env.script_source(s),
        dst: env.script_destination(s),
        template: s.template,
    }));

    steps.extend(config.corpora.iter().map(|c| Step::SeedCorpus {
        url: c.url.clone(),
        dir: env.corpus_dir(c),
    }));

    steps
}
