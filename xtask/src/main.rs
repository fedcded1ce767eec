//! Build automation tasks for paystream
//!
//! Run with: cargo xtask <command>

use clap::{Parser, Subcommand};
use std::process::Command;

/// Fuzz targets under `fuzz/`
const FUZZ_TARGETS: &[&str] = &[
    "fuzz_frame_parser",
    "fuzz_crypto",
    "fuzz_packet_parser",
    "fuzz_address",
];

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "paystream build automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests
    Test,

    /// Run clippy lints
    Lint,

    /// Check formatting
    Fmt,

    /// Run all CI checks
    Ci,

    /// Run the criterion benchmarks
    Bench,

    /// Run fuzz targets for a fixed time each (requires cargo-fuzz and nightly)
    Fuzz {
        /// Single target to run; all targets if omitted
        target: Option<String>,

        /// Seconds per target
        #[arg(long, default_value_t = 60)]
        seconds: u64,
    },

    /// Generate documentation
    Doc,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test => {
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
        }
        Commands::Lint => {
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
        }
        Commands::Fmt => {
            run_command("cargo", &["fmt", "--all", "--check"])?;
        }
        Commands::Ci => {
            println!("Running CI checks...");
            run_command("cargo", &["fmt", "--all", "--check"])?;
            run_command("cargo", &["clippy", "--workspace", "--all-targets", "--", "-D", "warnings"])?;
            run_command("cargo", &["test", "--all-features", "--workspace"])?;
            println!("All CI checks passed!");
        }
        Commands::Bench => {
            run_command("cargo", &["bench", "--workspace"])?;
        }
        Commands::Fuzz { target, seconds } => {
            let targets: Vec<&str> = match &target {
                Some(t) if FUZZ_TARGETS.contains(&t.as_str()) => vec![t.as_str()],
                Some(t) => anyhow::bail!("unknown fuzz target {t}; known: {FUZZ_TARGETS:?}"),
                None => FUZZ_TARGETS.to_vec(),
            };
            let max_time = format!("-max_total_time={seconds}");
            for t in targets {
                println!("Fuzzing {t} for {seconds}s...");
                run_command_in(
                    "fuzz",
                    "cargo",
                    &["+nightly", "fuzz", "run", t, "--", &max_time],
                )?;
            }
        }
        Commands::Doc => {
            run_command("cargo", &["doc", "--workspace", "--no-deps", "--open"])?;
        }
    }

    Ok(())
}

fn run_command(program: &str, args: &[&str]) -> anyhow::Result<()> {
    run_command_in(".", program, args)
}

fn run_command_in(dir: &str, program: &str, args: &[&str]) -> anyhow::Result<()> {
    let status = Command::new(program)
        .args(args)
        .current_dir(dir)
        .status()?;

    if !status.success() {
        anyhow::bail!("{} {:?} failed", program, args);
    }

    Ok(())
}
