//! Command-line entry point for the unified store migrator.

use std::sync::Arc;

use unistore_migrator::{MigrationOrchestrator, MigrationProgress, MigratorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let mut root = None;
    let mut dry_run = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--root" => root = args.next(),
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let user_data_root = match root {
        Some(path) => std::path::PathBuf::from(path),
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine the user data directory"))?
            .join("unistore"),
    };

    let mut config = MigratorConfig::new(user_data_root);
    config.dry_run = dry_run;

    let orchestrator = MigrationOrchestrator::new(config);
    let report = orchestrator
        .run(Arc::new(|progress: MigrationProgress| {
            log::info!(
                "[{}] {} ({:.0}%)",
                progress.phase.as_str(),
                progress.current_step,
                progress.percentage
            );
        }))
        .await?;

    println!(
        "migration {}: phase={} rows={} duration={}ms",
        if report.success { "succeeded" } else { "failed" },
        report.phase.as_str(),
        report.rows_copied,
        report.duration_ms
    );
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for error in &report.errors {
        eprintln!("error: {}", error);
    }

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
