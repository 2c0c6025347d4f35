//! Development tasks for the sqltx workspace.
//!
//! Run with `cargo xtask <command>`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

/// Crates with concurrency-sensitive tests (FIFO waiters, conflicts,
/// timeouts) that `stress` reruns.
const STRESS_TARGETS: &[(&str, &str)] = &[
    ("sqltx-pool", "pool"),
    ("sqltx", "transaction"),
    ("sqltx", "locking"),
];

#[derive(Parser)]
#[command(name = "xtask", about = "Development tasks for sqltx")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Format check, clippy, tests and unused-dependency check
    Ci,
    /// Check formatting
    Fmt,
    /// Run clippy on every target, warnings denied
    Clippy,
    /// Run tests, optionally for one crate
    Test {
        /// Package to test (e.g. `sqltx-pool`)
        #[arg(short, long)]
        package: Option<String>,
    },
    /// Rerun the concurrency-sensitive integration tests to shake out races
    Stress {
        /// Number of runs
        #[arg(short, long, default_value_t = 20)]
        iterations: u32,
    },
    /// Build API documentation
    Doc,
    /// Find unused dependencies (requires cargo-machete)
    Machete,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;
    sh.change_dir(workspace_root()?);

    match cli.command {
        Command::Ci => {
            println!("Running CI checks...");
            fmt(&sh)?;
            clippy(&sh)?;
            test(&sh, None)?;
            machete(&sh)?;
            println!("All CI checks passed!");
        }
        Command::Fmt => fmt(&sh)?,
        Command::Clippy => clippy(&sh)?,
        Command::Test { package } => test(&sh, package.as_deref())?,
        Command::Stress { iterations } => stress(&sh, iterations)?,
        Command::Doc => doc(&sh)?,
        Command::Machete => machete(&sh)?,
    }

    Ok(())
}

fn workspace_root() -> Result<PathBuf> {
    let output = std::process::Command::new("cargo")
        .args(["locate-project", "--workspace", "--message-format=plain"])
        .output()
        .context("failed to run cargo locate-project")?;

    let manifest = String::from_utf8(output.stdout).context("invalid UTF-8 in cargo output")?;
    Ok(PathBuf::from(manifest.trim())
        .parent()
        .context("workspace manifest has no parent directory")?
        .to_path_buf())
}

fn fmt(sh: &Shell) -> Result<()> {
    println!("Checking formatting...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    Ok(())
}

fn clippy(sh: &Shell) -> Result<()> {
    println!("Running clippy...");
    cmd!(sh, "cargo clippy --workspace --all-features --all-targets -- -D warnings").run()?;
    Ok(())
}

fn test(sh: &Shell, package: Option<&str>) -> Result<()> {
    match package {
        Some(package) => {
            println!("Testing {package}...");
            cmd!(sh, "cargo test -p {package} --all-features").run()?;
        }
        None => {
            println!("Testing workspace...");
            cmd!(sh, "cargo test --workspace --all-features").run()?;
        }
    }
    Ok(())
}

fn stress(sh: &Shell, iterations: u32) -> Result<()> {
    if iterations == 0 {
        bail!("iterations must be at least 1");
    }

    // Build once so the timing-sensitive runs are not competing with rustc.
    cmd!(sh, "cargo test --workspace --no-run").run()?;

    for run in 1..=iterations {
        println!("Stress run {run}/{iterations}");
        for (package, target) in STRESS_TARGETS {
            cmd!(sh, "cargo test -q -p {package} --test {target}")
                .run()
                .with_context(|| format!("{package}/{target} failed on run {run}"))?;
        }
    }

    println!("{iterations} stress runs passed.");
    Ok(())
}

fn doc(sh: &Shell) -> Result<()> {
    println!("Building documentation...");
    cmd!(sh, "cargo doc --workspace --all-features --no-deps").run()?;
    Ok(())
}

fn machete(sh: &Shell) -> Result<()> {
    println!("Checking for unused dependencies...");
    cmd!(sh, "cargo machete").run()?;
    Ok(())
}
