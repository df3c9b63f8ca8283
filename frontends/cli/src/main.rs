mod commands;
mod config;

use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::{parse_args, Command, USAGE};
use config::CliConfig;
use subgrid::{DatasetEngine, DatasetOutcome, EntityService};
use subgrid_webapi::WebApiClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to INFO level, can be overridden with RUST_LOG env var.
    // Logs go to stderr so stdout stays parseable JSON.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();

    opentelemetry::global::set_text_map_propagator(
        opentelemetry_sdk::propagation::TraceContextPropagator::new(),
    );

    let invocation = parse_args(std::env::args().skip(1))?;
    if invocation.command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let cli_config = match &invocation.config_path {
        Some(path) => CliConfig::load_from_file(path)?,
        None => CliConfig::default(),
    };
    let (engine_config, webapi_config) = cli_config.resolve()?;

    let client: Arc<dyn EntityService> = Arc::new(WebApiClient::new(&webapi_config)?);
    let engine = DatasetEngine::new(engine_config, client);
    info!(
        "[subgrid] Connected engine to {} ({:?})",
        webapi_config.base_url,
        engine.config().environment
    );

    match invocation.command {
        Command::Probe => {
            let report = engine.test_connectivity().await;
            print_json(&serde_json::json!({
                "success": report.success,
                "elapsed_ms": report.elapsed.as_millis() as u64,
                "error": report.error.as_ref().map(|e| e.message.clone()),
            }))?;
            if !report.success {
                bail!("Connectivity check failed");
            }
        }
        Command::Schema { entity } => match engine.schemas().get_schema(&entity).await {
            Some(schema) => print_json(schema.as_ref())?,
            None => bail!("No schema available for '{}'", entity),
        },
        Command::Relate { parent, child } => {
            match engine.discover_relationship(&parent, &child).await {
                Some(relationship) => print_json(&relationship)?,
                None => bail!("No relationship found from '{}' to '{}'", parent, child),
            }
        }
        Command::Plan(request) => {
            let descriptor = engine.plan(&request).await;
            print_json(&descriptor)?;
        }
        Command::Query(request) => match engine.load_dataset(&request).await {
            DatasetOutcome::Loaded {
                records,
                total_count,
                next_page_token,
                ..
            } => {
                let rows: Vec<_> = records.iter().collect();
                print_json(&serde_json::json!({
                    "entity": records.entity_type,
                    "records": rows,
                    "total_count": total_count,
                    "next_page_token": next_page_token,
                    "skipped": records.skipped_count,
                    "duplicates": records.duplicate_count,
                }))?;
            }
            ref failed @ DatasetOutcome::Failed { ref report, .. } => {
                eprintln!("{}", report);
                match failed.api_error() {
                    Some(error) => {
                        print_json(&serde_json::json!({ "error": error }))?;
                        bail!("Dataset load failed: {}", error);
                    }
                    None => bail!("Dataset load failed"),
                }
            }
        },
        Command::Help => {}
    }

    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
