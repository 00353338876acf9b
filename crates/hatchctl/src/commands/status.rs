use anyhow::Result;
use hatch_common::error::EXIT_SUCCESS;
use hatch_common::host::{service_for, ServiceStatus};
use hatch_common::StatusReport;
use owo_colors::OwoColorize;

use super::Context;

/// Key width for aligned output
const KW: usize = 12;

pub fn show(ctx: &Context, json: bool) -> Result<i32> {
    let service = service_for(ctx.config.update.service.as_deref());
    let report = StatusReport::collect(&ctx.layout, service.as_ref())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}

fn print_kv(key: &str, value: &str) {
    println!("{:width$} {}", key, value, width = KW);
}

fn print_report(report: &StatusReport) {
    print_kv("root", &report.root.display().to_string());
    print_kv(
        "version",
        &report
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "not installed".to_string()),
    );

    let service = match report.service {
        ServiceStatus::Running => report.service.green().to_string(),
        ServiceStatus::Stopped => report.service.dimmed().to_string(),
        ServiceStatus::Unknown => report.service.yellow().to_string(),
    };
    print_kv("service", &service);

    if report.inconsistent {
        print_kv("state", &"INCONSISTENT - run update rollback".red().to_string());
    }
    match &report.lock {
        Some(lock) if report.interrupted => print_kv(
            "lock",
            &format!(
                "{} (pid {} died in {}, next update or rollback recovers)",
                "interrupted".red(),
                lock.pid,
                lock.step
            ),
        ),
        Some(lock) => print_kv(
            "lock",
            &format!("held by pid {} ({}, step {})", lock.pid, lock.txn, lock.step),
        ),
        None => print_kv("lock", "free"),
    }

    println!();
    println!("[MODULES]");
    if report.modules.is_empty() {
        println!("  none");
    }
    for module in &report.modules {
        let state = if module.loaded {
            "loaded".green().to_string()
        } else {
            "available".dimmed().to_string()
        };
        println!("  {:20} {:10} {}", module.name, module.version.to_string(), state);
    }
    if !report.loaded.is_empty() {
        println!("  order: {}", report.loaded.join(" -> "));
    }

    println!();
    println!("[BACKUPS]");
    if report.backups.is_empty() {
        println!("  none");
    }
    for backup in &report.backups {
        let version = backup
            .version
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "  {:10} {}  {}",
            version,
            backup.created_at.format("%Y-%m-%d %H:%M:%S"),
            backup.path.display()
        );
    }
}
