//! Update, rollback and self-update commands

use anyhow::{anyhow, Result};
use hatch_common::error::EXIT_SUCCESS;
use hatch_common::host::{
    service_for, source_for, Escalating, NoService, ServiceControl, VersionSource,
};
use hatch_common::{
    HatchConfig, HatchError, InstallLayout, RollbackController, SourceConfig, UpdateCheck,
    UpdateEngine, UpdateScope, UpdateTransaction,
};
use owo_colors::OwoColorize;
use semver::Version;

use super::Context;

fn source(config: Option<&SourceConfig>, section: &str) -> Result<Box<dyn VersionSource>> {
    config
        .map(source_for)
        .ok_or_else(|| anyhow!("no update source configured ([{section}] source)"))
}

fn service(ctx: &Context) -> Box<dyn ServiceControl> {
    service_for(ctx.config.update.service.as_deref())
}

pub fn check(ctx: &Context) -> Result<i32> {
    let source = source(ctx.config.update.source.as_ref(), "update")?;
    let service = service(ctx);
    let engine = UpdateEngine::new(
        ctx.layout.clone(),
        ctx.config.clone(),
        source.as_ref(),
        service.as_ref(),
        &Escalating,
    );

    match engine.check_update() {
        UpdateCheck::UpToDate { current } => {
            println!("{} {}", "up to date".green(), current);
        }
        UpdateCheck::UpdateAvailable { current, latest } => {
            let current = current.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string());
            println!("{} {} -> {}", "update available".yellow(), current, latest);
        }
        UpdateCheck::CheckFailed(reason) => return Err(HatchError::CheckFailed(reason).into()),
    }
    Ok(EXIT_SUCCESS)
}

pub fn apply(ctx: &Context, version: Option<Version>) -> Result<i32> {
    let source = source(ctx.config.update.source.as_ref(), "update")?;
    let service = service(ctx);
    let engine = UpdateEngine::new(
        ctx.layout.clone(),
        ctx.config.clone(),
        source.as_ref(),
        service.as_ref(),
        &Escalating,
    );

    let txn = engine.run(version)?;
    print_applied(&txn);
    Ok(EXIT_SUCCESS)
}

pub fn rollback(ctx: &Context, version: Option<Version>) -> Result<i32> {
    let service = service(ctx);
    let outcome = RollbackController::new(
        ctx.layout.clone(),
        ctx.config.modules.clone(),
        service.as_ref(),
        &Escalating,
    )
    .rollback(version.as_ref())?;

    println!(
        "{} {} -> {}",
        "rolled back".green(),
        label(outcome.previous.as_ref()),
        label(outcome.restored.as_ref())
    );
    println!("  from {}", outcome.backup.display());
    Ok(EXIT_SUCCESS)
}

/// Update the framework's own root. Its entry points must stay executable,
/// and no service is restarted.
pub fn self_update(ctx: &Context, version: Option<Version>) -> Result<i32> {
    let root = ctx
        .config
        .self_update
        .root
        .clone()
        .ok_or_else(|| anyhow!("self-update root not configured ([self_update] root)"))?;
    let source = source(ctx.config.self_update.source.as_ref(), "self_update")?;

    let layout = InstallLayout::new(root);
    let config = HatchConfig::load(&layout.config_file())?;
    let engine = UpdateEngine::new(layout, config, source.as_ref(), &NoService, &Escalating)
        .with_scope(UpdateScope::SelfUpdate);

    let txn = engine.run(version)?;
    print_applied(&txn);
    Ok(EXIT_SUCCESS)
}

fn print_applied(txn: &UpdateTransaction) {
    println!(
        "{} {} -> {}",
        "applied".green(),
        label(txn.current_version.as_ref()),
        txn.candidate_version
    );
    if let Some(backup) = &txn.backup_path {
        println!("  backup {}", backup.display());
    }
}

fn label(version: Option<&Version>) -> String {
    version
        .map(Version::to_string)
        .unwrap_or_else(|| "none".to_string())
}
