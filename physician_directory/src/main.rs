use anyhow::{Context, Result, anyhow};
use clap::Parser;
use serde::Serialize;

use physician_directory::{
    args::{Args, Command},
    common::install_ctrlc_handler,
    models::Coordinates,
    postal::PostalCode,
    service::{DirectoryService, RadiusSearchRequest, SearchCenter},
};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed serializing response")?;
    println!("{out}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let service = DirectoryService::open(args.common.to_config())
        .context("Failed opening directory service")?
        .with_progress(args.common.progress);
    install_ctrlc_handler(service.shutdown_flag());

    let outcome = run(&service, args.cmd).await;
    service.shutdown().await.context("shutdown failed")?;
    outcome
}

async fn run(service: &DirectoryService, cmd: Command) -> Result<()> {
    match cmd {
        Command::Search(cmd) => {
            let center = match (cmd.lat, cmd.lng, cmd.address) {
                (Some(lat), Some(lng), _) => SearchCenter::Coordinates(Coordinates::new(lat, lng)),
                (_, _, Some(address)) => SearchCenter::Address(address),
                _ => return Err(anyhow!("pass --lat/--lng or --address")),
            };
            let mut request = RadiusSearchRequest::new(center, cmd.radius_km);
            request.filters = cmd.filters.to_filters();
            request.refresh = cmd.refresh;
            request.geocode_results = !cmd.no_geocode;
            request.wait_for_enrichment = cmd.wait_enrichment;
            let response = service.radius_search(request).await.context("search failed")?;
            print_json(&response)
        }
        Command::Expand(cmd) => {
            let mut seeds = Vec::with_capacity(cmd.seeds.len());
            for raw in &cmd.seeds {
                seeds.push(
                    PostalCode::parse(raw).ok_or_else(|| anyhow!("not a postal code: {raw:?}"))?,
                );
            }
            let response = service.expand(seeds, Some(cmd.filters.to_filters())).await;
            print_json(&response)
        }
        Command::Enrich(cmd) => {
            let report = match cmd.pending {
                Some(limit) => service.enrich_pending(limit).await?,
                None => service.fetch_enrichment(&cmd.registration_numbers).await,
            };
            print_json(&report)
        }
        Command::Geocode(cmd) => {
            let report = service.geocode_addresses(&cmd.addresses).await;
            print_json(&report)
        }
        Command::Stats => print_json(&service.stats()?),
    }
}
