//! `fuzzenv check`: validate a config without touching the system.

use super::load_config;
use fuzzenv_core::SystemPackageManager;
use std::path::Path;
use std::process::ExitCode;

pub fn run(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    println!("{}: ok", config_path.display());
    println!(
        "  {} package(s), {} tool(s), {} checkout(s), {} script(s), {} corpus seed(s)",
        config.packages.len(),
        config.tools.len(),
        config.checkouts.len(),
        config.scripts.len(),
        config.corpora.len()
    );

    if !config.packages.is_empty() {
        match SystemPackageManager::from_settings(&config.environment).ecosystem() {
            Some(eco) => println!("  package manager: {}", eco.id()),
            None => {
                println!("  package manager: none detected");
                println!("  hint: set [environment] package_manager or install apt, dnf, apk, pacman or brew");
            }
        }
    }

    ExitCode::SUCCESS
}
