// Copyright 2025 coScene
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

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use edge_pipeline::broker::{BrokerClient, BrokerServer, Channel};
use edge_pipeline::config::{apply_sampler_overrides, load_config_with_env, PipelineConfig};
use edge_pipeline::consumer::{EventConsumer, UploadHandler};
use edge_pipeline::logging::init_logging;
use edge_pipeline::sampler::{open_source, BatchProducer};
use edge_pipeline::storage::BackendFactory;
use edge_pipeline::telemetry::{resolve_serial, ProducerSpec, ProducerSupervisor, TelemetryBridge};

/// Edge pipeline - event broker, batch sampler, uploader and telemetry bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Serve the event channels
    Broker,
    /// Sample the voltage source into batch files
    Sampler {
        /// Source ID (overrides config file)
        #[arg(short, long)]
        source_id: Option<String>,

        /// Stop after this many batches
        #[arg(long)]
        max_batches: Option<u64>,
    },
    /// Upload announced batches to the object store
    Uploader,
    /// Publish device state over MQTT and accept start/stop commands
    Telemetry,
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Broker => "broker",
            Role::Sampler { .. } => "sampler",
            Role::Uploader => "uploader",
            Role::Telemetry => "telemetry",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration from file
    let mut config = load_config_with_env(&args.config)?;

    // Apply CLI overrides
    if let Role::Sampler {
        source_id,
        max_batches,
    } = &args.role
    {
        apply_sampler_overrides(&mut config, source_id.as_deref(), *max_batches)?;
    }

    init_logging(&config.logging, args.role.name())?;

    info!("Starting edge pipeline {}", args.role.name());
    info!("Loaded configuration from: {:?}", args.config);

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = match &args.role {
        Role::Broker => run_broker(&config, shutdown).await,
        Role::Sampler { .. } => run_sampler(&config, shutdown).await,
        Role::Uploader => run_uploader(&config, shutdown).await,
        Role::Telemetry => run_telemetry(&config, &args.config, shutdown).await,
    };

    match &result {
        Ok(()) => info!("{} shut down successfully", args.role.name()),
        Err(e) => error!("{} failed: {:#}", args.role.name(), e),
    }
    result
}

/// Cancel on Ctrl+C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = term.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }

    shutdown.cancel();
}

async fn connect_channel(config: &PipelineConfig, name: &str) -> Result<Arc<dyn Channel>> {
    let client = BrokerClient::from_config(&config.broker)
        .await
        .with_context(|| format!("Failed to connect to broker at {}", config.broker.address))?;
    let channel = client
        .channel(name)
        .await
        .with_context(|| format!("Failed to open channel '{}'", name))?;
    info!("Connected to broker channel '{}'", name);
    Ok(Arc::new(channel))
}

async fn run_broker(config: &PipelineConfig, shutdown: CancellationToken) -> Result<()> {
    let server = BrokerServer::new(&config.broker);
    server
        .run(&config.broker.address, shutdown)
        .await
        .context("Broker failed")
}

async fn run_sampler(config: &PipelineConfig, shutdown: CancellationToken) -> Result<()> {
    let source = open_source(&config.sampler.source).await?;
    let channel = connect_channel(config, &config.sampler.channel).await?;

    let mut producer = BatchProducer::new(&config.sampler, source, channel).await?;
    let produced = producer.run(&shutdown).await;
    info!("Produced {} batches", produced);
    Ok(())
}

async fn run_uploader(config: &PipelineConfig, shutdown: CancellationToken) -> Result<()> {
    let store = BackendFactory::create(&config.storage).await?;
    store
        .initialize()
        .await
        .context("Failed to initialize object store")?;
    info!("Object store initialized: {}", store.backend_type());

    let channel = connect_channel(config, &config.uploader.channel).await?;
    let handler = UploadHandler::new(
        store,
        config.uploader.max_retries,
        config.uploader.archive_dir.clone(),
    );

    let consumer = EventConsumer::new(
        channel,
        Arc::new(handler),
        config.uploader.poll_interval(),
        config.uploader.error_delay(),
    );
    consumer.run(shutdown).await;
    Ok(())
}

async fn run_telemetry(
    config: &PipelineConfig,
    config_path: &Path,
    shutdown: CancellationToken,
) -> Result<()> {
    let serial = resolve_serial(&config.telemetry).await?;
    let channel = connect_channel(config, &config.telemetry.channel).await?;

    let spec = producer_spec(config, config_path)?;
    let (supervisor, supervisor_task) = ProducerSupervisor::spawn(spec);

    let bridge = TelemetryBridge::new(&config.telemetry, &serial, channel, supervisor)?;
    let result = bridge.run(shutdown).await;

    // The bridge held the last handle; the supervisor now stops the sampler
    if let Err(e) = supervisor_task.await {
        error!("Supervisor task failed: {}", e);
    }

    result.context("Telemetry session failed")
}

/// Launch this binary's sampler role unless another program is configured.
fn producer_spec(config: &PipelineConfig, config_path: &Path) -> Result<ProducerSpec> {
    let producer = &config.telemetry.producer;
    let (program, args) = match &producer.program {
        Some(program) => (program.clone(), producer.args.clone()),
        None => {
            let exe = std::env::current_exe().context("Failed to locate current executable")?;
            let args = vec![
                "--config".to_string(),
                config_path.to_string_lossy().into_owned(),
                "sampler".to_string(),
            ];
            (exe, args)
        }
    };

    Ok(ProducerSpec {
        program,
        args,
        stop_grace: producer.stop_grace(),
    })
}
