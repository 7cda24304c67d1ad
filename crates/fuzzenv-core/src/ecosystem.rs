//! OS package manager detection and batched package installation.

use crate::builder::PackageInstaller;
use crate::config::{EnvironmentSettings, PackageSpec};
use crate::error::{PackageInstallError, UnresolvedPackage};
use crate::process::{ChildTracker, CommandRunner, SystemRunner, find_on_path};
use tracing::{debug, info};

/// Known OS package manager ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ecosystem {
    /// Debian/Ubuntu apt
    Apt,
    /// Fedora/RHEL dnf
    Dnf,
    /// Alpine apk
    Apk,
    /// Arch Linux pacman
    Pacman,
    /// macOS/Linux Homebrew
    Brew,
}

impl Ecosystem {
    /// Get the string identifier for this ecosystem.
    pub fn id(&self) -> &'static str {
        match self {
            Ecosystem::Apt => "apt",
            Ecosystem::Dnf => "dnf",
            Ecosystem::Apk => "apk",
            Ecosystem::Pacman => "pacman",
            Ecosystem::Brew => "brew",
        }
    }

    /// Parse from string identifier.
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "apt" | "apt-get" => Some(Ecosystem::Apt),
            "dnf" => Some(Ecosystem::Dnf),
            "apk" => Some(Ecosystem::Apk),
            "pacman" => Some(Ecosystem::Pacman),
            "brew" => Some(Ecosystem::Brew),
            _ => None,
        }
    }

    /// Binary whose presence on PATH signals this ecosystem.
    fn binary(&self) -> &'static str {
        match self {
            Ecosystem::Apt => "apt-get",
            Ecosystem::Dnf => "dnf",
            Ecosystem::Apk => "apk",
            Ecosystem::Pacman => "pacman",
            Ecosystem::Brew => "brew",
        }
    }

    /// Render a package with its version pin in this ecosystem's syntax.
    pub fn package_arg(&self, package: &PackageSpec) -> String {
        match (&package.version, self) {
            (None, _) => package.name.clone(),
            (Some(v), Ecosystem::Dnf) => format!("{}-{v}", package.name),
            (Some(v), Ecosystem::Brew) => format!("{}@{v}", package.name),
            (Some(v), _) => format!("{}={v}", package.name),
        }
    }

    /// Command that refreshes the package index.
    pub fn update_cmd(&self) -> Vec<String> {
        match self {
            Ecosystem::Apt => vec!["apt-get".into(), "update".into()],
            Ecosystem::Dnf => vec!["dnf".into(), "makecache".into()],
            Ecosystem::Apk => vec!["apk".into(), "update".into()],
            Ecosystem::Pacman => vec!["pacman".into(), "-Sy".into()],
            Ecosystem::Brew => vec!["brew".into(), "update".into()],
        }
    }

    /// Command that exits non-zero when a package cannot be resolved.
    pub fn probe_cmd(&self, package: &PackageSpec) -> Vec<String> {
        let arg = self.package_arg(package);
        match self {
            Ecosystem::Apt => vec!["apt-cache".into(), "show".into(), arg],
            Ecosystem::Dnf => vec!["dnf".into(), "info".into(), "-q".into(), arg],
            Ecosystem::Apk => vec!["apk".into(), "add".into(), "--simulate".into(), arg],
            Ecosystem::Pacman => vec!["pacman".into(), "-Si".into(), arg],
            Ecosystem::Brew => vec!["brew".into(), "info".into(), "--formula".into(), arg],
        }
    }

    /// Get the command to install packages.
    pub fn install_cmd(&self, packages: &[String]) -> Vec<String> {
        let mut cmd: Vec<String> = match self {
            Ecosystem::Apt => vec![
                "apt-get".into(),
                "install".into(),
                "-y".into(),
                "--no-install-recommends".into(),
            ],
            Ecosystem::Dnf => vec!["dnf".into(), "install".into(), "-y".into()],
            Ecosystem::Apk => vec!["apk".into(), "add".into(), "--no-cache".into()],
            Ecosystem::Pacman => vec![
                "pacman".into(),
                "-S".into(),
                "--noconfirm".into(),
                "--needed".into(),
            ],
            Ecosystem::Brew => vec!["brew".into(), "install".into()],
        };
        cmd.extend(packages.iter().cloned());
        cmd
    }

    /// Format install command for display.
    pub fn install_cmd_display(&self, packages: &[String], sudo: bool) -> String {
        let cmd = self.install_cmd(packages).join(" ");
        if sudo && self.needs_sudo() {
            format!("sudo {cmd}")
        } else {
            cmd
        }
    }

    /// Whether this ecosystem writes to system locations.
    pub fn needs_sudo(&self) -> bool {
        !matches!(self, Ecosystem::Brew)
    }
}

/// Detect available ecosystems on the current system.
pub fn detect_ecosystems() -> Vec<Ecosystem> {
    [
        Ecosystem::Apt,
        Ecosystem::Dnf,
        Ecosystem::Apk,
        Ecosystem::Pacman,
        Ecosystem::Brew,
    ]
    .into_iter()
    .filter(|e| find_on_path(e.binary()).is_some())
    .collect()
}

/// Detect the primary ecosystem (first available, system managers first).
pub fn detect_primary_ecosystem() -> Option<Ecosystem> {
    detect_ecosystems().into_iter().next()
}

/// Installs packages through the host's package manager.
pub struct SystemPackageManager<R = SystemRunner> {
    ecosystem: Option<Ecosystem>,
    sudo: bool,
    update: bool,
    runner: R,
}

impl SystemPackageManager<SystemRunner> {
    /// Use the configured package manager, or detect one.
    pub fn from_settings(settings: &EnvironmentSettings) -> Self {
        let ecosystem = settings
            .package_manager
            .as_deref()
            .and_then(Ecosystem::from_id)
            .or_else(detect_primary_ecosystem);

        Self {
            ecosystem,
            sudo: settings.sudo,
            update: settings.update,
            runner: SystemRunner::default(),
        }
    }

    /// Register spawned commands with `children`.
    pub fn tracked(mut self, children: ChildTracker) -> Self {
        self.runner = SystemRunner::tracked(children);
        self
    }
}

impl<R: CommandRunner> SystemPackageManager<R> {
    pub fn with_runner(ecosystem: Option<Ecosystem>, runner: R) -> Self {
        Self {
            ecosystem,
            sudo: false,
            update: true,
            runner,
        }
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    pub fn ecosystem(&self) -> Option<Ecosystem> {
        self.ecosystem
    }

    fn command(&self, ecosystem: Ecosystem, mut argv: Vec<String>) -> Vec<String> {
        if self.sudo && ecosystem.needs_sudo() {
            argv.insert(0, "sudo".to_string());
        }
        argv
    }

    /// Run a state-changing command, failing the phase on non-zero exit.
    fn run_checked(&self, ecosystem: Ecosystem, argv: Vec<String>) -> Result<(), PackageInstallError> {
        let argv = self.command(ecosystem, argv);
        let shown = argv.join(" ");
        info!(manager = ecosystem.id(), command = %shown, "running package manager");

        let output = self
            .runner
            .run(&argv, None)
            .map_err(|e| PackageInstallError::Command {
                manager: ecosystem.id().to_string(),
                command: shown.clone(),
                reason: e.to_string(),
            })?;

        if !output.success() {
            return Err(PackageInstallError::Command {
                manager: ecosystem.id().to_string(),
                command: shown,
                reason: output.summary(),
            });
        }
        Ok(())
    }

    /// Probe every package and collect all that cannot be resolved.
    fn unresolved(&self, ecosystem: Ecosystem, packages: &[PackageSpec]) -> Vec<UnresolvedPackage> {
        packages
            .iter()
            .filter_map(|package| {
                let argv = self.command(ecosystem, ecosystem.probe_cmd(package));
                let reason = match self.runner.run(&argv, None) {
                    Ok(out) if out.success() => return None,
                    Ok(out) => out.summary(),
                    Err(e) => e.to_string(),
                };
                debug!(package = %package, %reason, "package not resolvable");
                Some(UnresolvedPackage {
                    package: package.clone(),
                    reason,
                })
            })
            .collect()
    }
}

impl<R: CommandRunner> PackageInstaller for SystemPackageManager<R> {
    fn install(&self, packages: &[PackageSpec]) -> Result<(), PackageInstallError> {
        if packages.is_empty() {
            return Ok(());
        }
        let ecosystem = self.ecosystem.ok_or(PackageInstallError::NoPackageManager)?;

        if self.update {
            self.run_checked(ecosystem, ecosystem.update_cmd())?;
        }

        let unresolved = self.unresolved(ecosystem, packages);
        if !unresolved.is_empty() {
            return Err(PackageInstallError::Unresolvable {
                manager: ecosystem.id().to_string(),
                packages: unresolved,
            });
        }

        let args: Vec<String> = packages.iter().map(|p| ecosystem.package_arg(p)).collect();
        self.run_checked(ecosystem, ecosystem.install_cmd(&args))
    }
}
