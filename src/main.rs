// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(
    clippy::all,
    clippy::unwrap_used,
    clippy::unnecessary_unwrap,
    clippy::pedantic
)]

#[macro_use]
extern crate log;

use anyhow::Context;
use clap::Parser;
use gbq_stream::{config::Definition, output::Registry, runner};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, BufReader};

/// Writes newline delimited JSON into a BigQuery table
#[derive(Parser, Debug)]
#[clap(name = "gbq-stream", author, version)]
struct Cli {
    /// Output definition (YAML)
    #[clap(short, long, value_parser = clap::value_parser!(PathBuf))]
    config: PathBuf,
    /// File to read messages from, one JSON document per line. Reads STDIN if omitted
    #[clap(short, long, value_parser = clap::value_parser!(PathBuf))]
    input: Option<PathBuf>,
}

async fn input(path: Option<&Path>) -> anyhow::Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    Ok(match path {
        Some(path) => Box::new(BufReader::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(tokio::io::stdin())),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let definition = Definition::load(&cli.config)?;
    let registry = Registry::with_builtins()?;
    let (ctx, built) = registry.build(&definition.output)?;

    built.output.connect(&ctx).await?;
    let report = runner::run(
        built.output.clone(),
        &ctx,
        input(cli.input.as_deref()).await?,
        built.batch_policy,
        built.max_in_flight,
    )
    .await;
    if let Err(e) = built.output.close(&ctx).await {
        warn!("{ctx} Error closing output: {e}");
    }

    let report = report?;
    if report.failed > 0 {
        anyhow::bail!(
            "{} of {} messages could not be written",
            report.failed,
            report.messages
        );
    }
    Ok(())
}
