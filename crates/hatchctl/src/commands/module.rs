use std::io::Write;

use anyhow::Result;
use hatch_common::error::EXIT_SUCCESS;
use hatch_common::Runtime;
use owo_colors::OwoColorize;

use super::Context;

pub fn load(ctx: &Context, names: &[String]) -> Result<i32> {
    let mut rt = Runtime::open(ctx.layout.clone(), ctx.config.clone())?;
    let initialized = rt.load(names)?;

    for name in &initialized {
        let version = rt
            .registry()
            .get(name)
            .map(|d| d.version.to_string())
            .unwrap_or_default();
        println!("{} {} {}", "loaded".green(), name, version);
    }
    for name in names.iter().filter(|n| !initialized.contains(n)) {
        println!("{} {}", "already loaded".dimmed(), name);
    }
    Ok(EXIT_SUCCESS)
}

pub fn unload(ctx: &Context, name: &str, force: bool) -> Result<i32> {
    let mut rt = Runtime::open(ctx.layout.clone(), ctx.config.clone())?;
    let unloaded = rt.unload(name, force)?;

    if unloaded.is_empty() {
        println!("{} {}", "not loaded".dimmed(), name);
    }
    for name in &unloaded {
        println!("{} {}", "unloaded".yellow(), name);
    }
    Ok(EXIT_SUCCESS)
}

/// Forward the capability's stdout and exit with its exit code
pub fn call(ctx: &Context, capability: &str, args: &[String]) -> Result<i32> {
    let mut rt = Runtime::open(ctx.layout.clone(), ctx.config.clone())?;
    let output = rt.invoke(capability, args)?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(output.stdout.as_bytes())?;
    stdout.flush()?;
    Ok(output.exit_code)
}
