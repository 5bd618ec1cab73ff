// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use shardfetch_app::{AppConfig, FetchOptions};
use shardfetch_downloader::{DownloadOutcome, SourceRef};
use snafu::{ResultExt, Whatever};

mod build_info;

#[derive(Debug, Parser)]
#[clap(
name = "shardfetch",
about= "Parallel chunked blob downloader",
author = build_info::AUTHOR,
version = build_info::VERSION,
long_version = build_info::LONG_VERSION)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Fetch(FetchArgs),
    Inspect(InspectArgs),
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Download a blob in parallel parts through every configured worker.
Examples:

shardfetch fetch --config shardfetch.toml --source dc2/media/movie.mkv
shardfetch fetch --config shardfetch.toml --source dc2/media/movie.mkv --output-dir /tmp --parts 4

")]
struct FetchArgs {
    /// TOML configuration file
    #[arg(long)]
    config:     Option<PathBuf>,
    /// Source reference, `dc<N>/<path>`
    #[arg(long)]
    source:     String,
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,
    /// File name; a timestamped name is generated when omitted
    #[arg(long)]
    name:       Option<String>,
    /// Number of parts, overriding the configuration
    #[arg(long)]
    parts:      Option<usize>,
}

impl FetchArgs {
    async fn run(self) -> Result<(), Whatever> {
        let config = AppConfig::load(self.config.as_deref()).whatever_context("failed to load configuration")?;
        let _guards = shardfetch_common_telemetry::init_global_logging("shardfetch", &config.logging);
        shardfetch_common_telemetry::panic_hook::set_panic_hook();
        tracing::info!(version = build_info::VERSION, "shardfetch starting");

        let options = FetchOptions::builder()
            .source(self.source)
            .output_dir(self.output_dir)
            .maybe_name(self.name)
            .maybe_parts(self.parts)
            .build();

        match config.open().run_fetch(options).await? {
            DownloadOutcome::Completed(result) => {
                println!(
                    "{} ({} bytes, {} parts, {:.1}s)",
                    result.path.display(),
                    result.size,
                    result.parts,
                    result.duration.as_secs_f64()
                );
            }
            DownloadOutcome::Cancelled => println!("cancelled"),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Args)]
#[command(flatten_help = true)]
#[command(long_about = r"

Print the size and datacenter of a stored blob.
Examples:

shardfetch inspect --config shardfetch.toml --source dc2/media/movie.mkv

")]
struct InspectArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    source: String,
}

impl InspectArgs {
    async fn run(self) -> Result<(), Whatever> {
        let config = AppConfig::load(self.config.as_deref()).whatever_context("failed to load configuration")?;
        let info = config.open().inspect(&SourceRef::from(self.source)).await?;
        println!("{}\t{} bytes\t{}", info.path.display(), info.size, info.datacenter);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Whatever> {
    let cli = Cli::parse();
    match cli.commands {
        Commands::Fetch(args) => args.run().await,
        Commands::Inspect(args) => args.run().await,
    }
}
