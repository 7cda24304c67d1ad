pub mod check;
pub mod provision;

use fuzzenv_core::{ConfigError, Phase, ProvisionConfig};
use std::path::Path;
use std::process::ExitCode;

/// Load the config, reporting failures the way every command does.
pub fn load_config(path: &Path) -> Result<ProvisionConfig, ExitCode> {
    ProvisionConfig::from_path(path).map_err(|e| {
        eprintln!("error: {e}");
        if let ConfigError::Io { .. } = e {
            eprintln!("hint: pass the config path with --config");
        }
        ExitCode::from(Phase::Config.exit_code())
    })
}
