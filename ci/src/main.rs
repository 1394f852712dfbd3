#!/usr/bin/env cargo
//! Taskbridge CI Tool
//!
//! Checks, lints and tests every crate in the workspace

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(
    name = "ci",
    about = "Taskbridge CI tool for checking, linting and testing the workspace",
    long_about = r#"
Taskbridge CI tool for checking, linting and testing the workspace

Examples:
  cargo ci                             # Check compilation (default)
  cargo ci check                       # Check that the workspace compiles
  cargo ci fmt                         # Verify formatting
  cargo ci lint                        # Run clippy with warnings denied
  cargo ci test                        # Run all tests
  cargo ci all                         # Everything above, in order
"#
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Parser)]
enum Commands {
    /// Check that the workspace compiles
    Check,
    /// Verify formatting without rewriting files
    Fmt,
    /// Run clippy on all targets
    Lint,
    /// Run all tests
    Test,
    /// Run every step
    All,
}

fn main() -> Result<()> {
    let args = Args::parse();
    check_rust()?;

    match args.command {
        Some(Commands::Check) | None => run_step(&CHECK),
        Some(Commands::Fmt) => run_step(&FMT),
        Some(Commands::Lint) => run_step(&LINT),
        Some(Commands::Test) => run_step(&TEST),
        Some(Commands::All) => {
            println!("🤖 Taskbridge CI");
            println!("{}", "=".repeat(16));
            for step in [&CHECK, &FMT, &LINT, &TEST] {
                run_step(step)?;
            }
            println!("\n✅ All steps passed!");
            Ok(())
        }
    }
}

/// One cargo invocation against the workspace root.
struct Step {
    label: &'static str,
    args: &'static [&'static str],
}

const CHECK: Step = Step {
    label: "check",
    args: &["check", "--workspace", "--all-targets"],
};

const FMT: Step = Step {
    label: "fmt",
    args: &["fmt", "--all", "--", "--check"],
};

const LINT: Step = Step {
    label: "clippy",
    args: &[
        "clippy",
        "--workspace",
        "--all-targets",
        "--",
        "-D",
        "warnings",
    ],
};

const TEST: Step = Step {
    label: "test",
    args: &["test", "--workspace"],
};

fn check_rust() -> Result<()> {
    if which::which("cargo").is_err() {
        return Err(anyhow!(
            "❌ Error: Cargo not found. Please install Rust first.\n   Visit: https://rustup.rs/"
        ));
    }
    Ok(())
}

fn get_repo_root() -> Result<PathBuf> {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").context(
        "❌ CI tool must be run via cargo. CARGO_MANIFEST_DIR not found.",
    )?;

    let manifest_path = PathBuf::from(manifest_dir);
    // If we're in the ci/ directory, go up to workspace root
    if manifest_path.file_name() == Some(std::ffi::OsStr::new("ci")) {
        if let Some(parent) = manifest_path.parent() {
            return Ok(parent.to_path_buf());
        }
    }
    Ok(manifest_path)
}

fn run_step(step: &Step) -> Result<()> {
    let repo_root = get_repo_root()?;

    println!("\n🦀 Running cargo {}...", step.label);
    println!("   In: {}", repo_root.display());

    // Tests print their own progress, so stream output instead of capturing it.
    let status = Command::new("cargo")
        .args(step.args)
        .current_dir(&repo_root)
        .status()
        .with_context(|| format!("Failed to execute cargo {}", step.label))?;

    if !status.success() {
        return Err(anyhow!("❌ cargo {} failed ({})", step.label, status));
    }

    println!("✅ cargo {} passed!", step.label);
    Ok(())
}
