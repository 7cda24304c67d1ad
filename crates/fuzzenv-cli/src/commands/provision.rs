//! `fuzzenv provision`: run every phase and report the outcome.

use super::load_config;
use fuzzenv_core::{
    ChildTracker, Environment, Phase, ProvisionConfig, ProvisionError, ProvisionRun, Provisioner, Receipt, Step,
    SystemPackageManager, SystemRunner, plan,
};
use fuzzenv_source::GitCheckout;
use fuzzenv_stage::ScriptStager;
use fuzzenv_store::ToolStore;
use std::path::Path;
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Exit code for a run that hit `--timeout`, as coreutils `timeout` uses.
const EXIT_TIMEOUT: u8 = 124;

pub fn dry_run(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let env = Environment::from_config(&config);
    let packages = SystemPackageManager::from_settings(&config.environment);

    let steps = plan(&config, &env);
    if steps.is_empty() {
        println!("nothing to do");
        return ExitCode::SUCCESS;
    }

    println!("Would run:");
    for (i, step) in steps.iter().enumerate() {
        println!("  {}. [{}] {step}", i + 1, step.phase());
        if let Step::InstallPackages { packages: specs } = step {
            match packages.ecosystem() {
                Some(eco) => {
                    let args: Vec<String> = specs.iter().map(|p| eco.package_arg(p)).collect();
                    println!("     $ {}", eco.install_cmd_display(&args, config.environment.sudo));
                }
                None => println!("     (no supported package manager detected)"),
            }
        }
    }
    println!("  {}. write {}", steps.len() + 1, env.receipt_path().display());

    ExitCode::SUCCESS
}

pub fn run(config_path: &Path, timeout: Option<u64>) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    let env = Environment::from_config(&config);
    let children = ChildTracker::new();

    let outcome = match timeout {
        Some(secs) => run_with_deadline(config, env.clone(), children.clone(), Duration::from_secs(secs)),
        None => Ok(provision(&config, &env, children.clone())),
    };

    match outcome {
        Ok(run) => report(run, &env),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            children.terminate();
            eprintln!("error: provisioning did not finish within {}s", timeout.unwrap_or_default());
            eprintln!("hint: work done so far is left in {}", env.root.display());
            ExitCode::from(EXIT_TIMEOUT)
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            eprintln!("error: provisioning aborted without a result");
            ExitCode::FAILURE
        }
    }
}

fn provision(config: &ProvisionConfig, env: &Environment, children: ChildTracker) -> ProvisionRun {
    let packages = SystemPackageManager::from_settings(&config.environment).tracked(children.clone());
    let tools = ToolStore::new();
    let sources = GitCheckout::with_runner(SystemRunner::tracked(children));
    let stager = ScriptStager::new();
    Provisioner::new(env, &packages, &tools, &sources, &stager).run(config)
}

/// Run on a worker thread, giving up once `deadline` passes.
///
/// On timeout the caller terminates `children`; downloads in flight die
/// with the process.
fn run_with_deadline(
    config: ProvisionConfig,
    env: Environment,
    children: ChildTracker,
    deadline: Duration,
) -> Result<ProvisionRun, mpsc::RecvTimeoutError> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let run = provision(&config, &env, children);
        // the receiver is gone once the deadline has passed
        let _ = tx.send(run);
    });
    rx.recv_timeout(deadline)
}

fn report(run: ProvisionRun, env: &Environment) -> ExitCode {
    let state = run.state;
    match run.into_result() {
        Ok(receipt) => {
            print_summary(&receipt, env);
            println!("\n{state}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            if let Some(hint) = hint(&e) {
                eprintln!("hint: {hint}");
            }
            eprintln!("{state}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn hint(e: &ProvisionError) -> Option<&'static str> {
    match e.phase() {
        Phase::Packages => Some("check package names for this distribution, or set [environment] package_manager"),
        Phase::Tools => Some("a checksum mismatch means the artifact changed upstream; verify it before updating the pin"),
        Phase::Checkout => Some("remove or rename the conflicting directory, or check network access to the remote"),
        Phase::Staging => Some("script sources resolve relative to the config file's directory"),
        Phase::Config => None,
    }
}

fn print_summary(receipt: &Receipt, env: &Environment) {
    if !receipt.tools.is_empty() {
        println!("Tools:");
        for (name, tool) in &receipt.tools {
            println!("  {name} {} -> {}", tool.version, tool.link.display());
        }
    }
    if !receipt.checkouts.is_empty() {
        println!("Sources:");
        for (dir, checkout) in &receipt.checkouts {
            let head = checkout.head.as_deref().unwrap_or("unknown");
            println!("  {dir} ({} @ {head})", checkout.url);
        }
    }
    if !receipt.scripts.is_empty() {
        println!("Staged:");
        for (dst, file) in &receipt.scripts {
            println!("  {dst} ({} bytes)", file.bytes);
        }
    }
    if !receipt.corpora.is_empty() {
        println!("Corpora:");
        for (dir, corpus) in &receipt.corpora {
            println!("  {dir} ({} files)", corpus.files);
        }
    }
    println!("\nreceipt: {}", env.receipt_path().display());
    if !receipt.tools.is_empty() {
        println!("add {} to PATH to use the pinned tools", env.bin_dir.display());
    }
}
