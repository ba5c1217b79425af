use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use anyhow::Context;
use clap::Parser;
use entra_setup::{
    BundleStore, DirectoryClient, FileBundleStore, GraphDirectory, MemoryBundleStore,
    MemoryDirectory, ResourceLedger, ResourceOrchestrator, SessionReport, Settings,
    TeardownReport, collect_request, telemetry,
};
use tracing::error;

#[derive(Parser)]
#[command(
    name = "entra-setup",
    version,
    about = "Stage and tear down Entra ID application infrastructure"
)]
struct Cli {
    /// Settings file with the [azure] credentials (defaults to ./setup.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where to write the issued credential bundle (overrides session.bundlePath)
    #[arg(long)]
    bundle_out: Option<PathBuf>,
    /// Write the session report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
    /// Rehearse the session against an in-memory directory
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init();
    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    let mut options = settings.options.clone();
    if let Some(path) = cli.bundle_out {
        options.bundle_path = path;
    }

    let (directory, store): (Arc<dyn DirectoryClient>, Box<dyn BundleStore>) = if cli.dry_run {
        options.user_propagation_delay_secs = 0;
        (
            Arc::new(MemoryDirectory::new()),
            Box::new(MemoryBundleStore::default()),
        )
    } else {
        let credentials = settings.require_credentials()?;
        let directory =
            GraphDirectory::new(credentials, &options).context("building directory client")?;
        (
            Arc::new(directory),
            Box::new(FileBundleStore::new(&options.bundle_path)),
        )
    };

    let request = collect_request(io::stdin().lock(), io::stdout())?;
    let mut orchestrator = ResourceOrchestrator::new(directory, store, options);

    let report = match orchestrator.run(&request).await {
        Ok(report) => report,
        Err(err) => {
            error!(
                target = "provision.session",
                event = "session.abort",
                error = %err,
                "provisioning session aborted"
            );
            if request.teardown && !orchestrator.ledger().is_empty() {
                let teardown = orchestrator.teardown().await;
                print_teardown(&teardown);
            }
            print_remaining(orchestrator.ledger());
            return Err(err).context("provisioning session aborted");
        }
    };

    print_report(&report);
    if let Some(path) = &cli.report {
        write_report(path, &report)?;
    }
    match report.check() {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            eprintln!("warning: {err}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &SessionReport) {
    let app = &report.application;
    println!();
    println!("{} app!", if app.created { "created" } else { "found" });
    if let Some(name) = &app.display_name {
        println!(" - display_name = {name}");
    }
    println!(" - client_id = {}", app.app_id);
    println!(" - object_id = {}", app.object_id);
    println!(" - service_principal_id = {}", app.service_principal_id);
    println!(" - tenant_id = {}", report.tenant_id);
    println!("credentials written to {}", report.bundle_location);

    if !report.grants.declared.is_empty() {
        println!();
        println!(
            "granted {} of {} permissions",
            report.grants.activated.len(),
            report.grants.activated.len() + report.grants.failures.len()
        );
        for failure in &report.grants.failures {
            println!(" ! {} ({}): {}", failure.grant, failure.step, failure.error);
        }
        println!(
            "if admin approval is required, visit: {}",
            report.admin_consent_url
        );
    }

    if let Some(user) = &report.user {
        println!();
        println!("{} user!", if user.created { "created" } else { "using" });
        println!(" - object_id = {}", user.object_id);
        if let Some(upn) = &user.user_principal_name {
            println!(" - user_principal_name = {upn}");
        }
        if let Some(password) = &user.initial_password {
            println!(" - initial_password = {password}");
        }
    }
    if let Some(role) = &report.role {
        println!("user {} is now {}", role.user_id, role.role);
    }
    if let Some(teardown) = &report.teardown {
        print_teardown(teardown);
    }
    println!();
    println!("done!");
}

fn print_teardown(teardown: &TeardownReport) {
    println!();
    for deleted in &teardown.deleted {
        println!("removed {deleted}");
    }
    for failure in &teardown.failures {
        println!(" ! could not remove {failure}");
    }
}

fn print_remaining(ledger: &ResourceLedger) {
    if ledger.is_empty() {
        return;
    }
    println!();
    println!("objects created by this session that still exist:");
    for entry in ledger.entries() {
        println!(" - {entry}");
    }
}

fn write_report(path: &Path, report: &SessionReport) -> anyhow::Result<()> {
    let mut payload = serde_json::to_vec_pretty(report).context("serializing session report")?;
    payload.push(b'\n');
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // the report carries the staged user's initial password
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("creating report file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("writing report file {}", path.display()))?;
    Ok(())
}
