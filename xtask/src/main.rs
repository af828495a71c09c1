use anyhow::Result;
use clap::{Parser, Subcommand};
use ota_core::{ImageBuilder, verify_image};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run all tests
    Test,
    /// Run the agent for one boot cycle
    Run,
    /// Generate a test firmware image
    Mkimage {
        /// Version string embedded in the descriptor
        #[arg(long)]
        version: String,
        /// Project name embedded in the descriptor
        #[arg(long, default_value = "ota-demo")]
        project: String,
        /// Payload bytes after the descriptor
        #[arg(long, default_value_t = 4096)]
        size: usize,
        /// Leave out the appended SHA-256
        #[arg(long)]
        no_hash: bool,
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build"], "Build")?;
        }
        Commands::Test => {
            println!("Running tests...");
            cargo(&["test", "--workspace"], "Tests")?;
        }
        Commands::Run => {
            println!("Running agent...");
            cargo(&["run", "-p", "ota-cli", "--", "run"], "Run")?;
        }
        Commands::Mkimage {
            version,
            project,
            size,
            no_hash,
            out,
        } => {
            let payload: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
            let image = ImageBuilder::new(version)
                .project(project)
                .segment(0, payload)
                .hash_appended(!no_hash)
                .build();
            let verified = verify_image(&image)?;
            std::fs::write(out, &image)?;
            println!(
                "Wrote {} ({} bytes, version {})",
                out.display(),
                verified.length,
                verified.metadata.version
            );
        }
    }

    Ok(())
}
