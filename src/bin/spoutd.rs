// Copyright 2025 jonefeewang@gmail.com
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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use dotenv::dotenv;
use eventhub_spout::{
    setup_tracing, AppResult, CheckpointStore, FileCheckpointStore, FileLogClient,
    IngestionFrontend, MemoryCheckpointStore, RocksDbCheckpointStore, SpoutConfig, StoreKind,
};
use tokio::runtime;
use tracing::{error, info, warn};

const METRICS_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = SpoutConfig::set_up_config(config_path)?;
    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async {
        let _tracing_guard = setup_tracing(&config.tracing, commandline.verbose)?;
        run(config).await
    })
}

async fn run(config: SpoutConfig) -> AppResult<()> {
    let client = Arc::new(FileLogClient::new(
        &config.source.dir,
        Duration::from_millis(config.source.poll_interval_ms),
    ));
    info!(
        source = %config.source.dir,
        store = ?config.checkpoint.store,
        "starting spout"
    );
    match config.checkpoint.store {
        StoreKind::File => {
            let store = FileCheckpointStore::new(&config.checkpoint.path);
            consume(&config, client, Arc::new(store)).await
        }
        StoreKind::Rocksdb => {
            let store = RocksDbCheckpointStore::open(&config.checkpoint.path)?;
            consume(&config, client, Arc::new(store)).await
        }
        StoreKind::Memory => {
            warn!("memory checkpoint store: progress is lost on exit");
            consume(&config, client, Arc::new(MemoryCheckpointStore::new())).await
        }
    }
}

async fn consume<S: CheckpointStore>(
    config: &SpoutConfig,
    client: Arc<FileLogClient>,
    store: Arc<S>,
) -> AppResult<()> {
    let (frontend, dead_letters) = IngestionFrontend::from_config(config, client, store)?;
    if let Some(mut dead_letters) = dead_letters {
        tokio::spawn(async move {
            while let Some(message) = dead_letters.recv().await {
                error!(
                    id = %message.id,
                    deliveries = message.delivery_count,
                    body = %String::from_utf8_lossy(&message.event.body),
                    "dead letter"
                );
            }
        });
    }
    frontend.open().await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_report = Instant::now();
    let result = loop {
        let next = tokio::select! {
            _ = &mut ctrl_c => {
                info!("ctrl-c received, shutting down");
                break Ok(());
            }
            next = frontend.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                let record = frontend.decode(&message);
                match serde_json::to_string(&record) {
                    Ok(line) => {
                        println!("{}", line);
                        frontend.ack(&message.id);
                    }
                    Err(e) => {
                        warn!(id = %message.id, error = %e, "cannot encode record");
                        frontend.fail(&message.id);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "spout stopped");
                break Err(e);
            }
        }
        if last_report.elapsed() >= METRICS_REPORT_INTERVAL {
            last_report = Instant::now();
            info!(metrics = ?frontend.metrics_snapshot(), "partition metrics");
        }
    };

    frontend.close().await;
    result
}
