//! Load an NDJSON file of sales transactions and print the rollup view.
//!
//! Run with: cargo run --example load_ndjson -- sales.ndjson [warehouse.journal] [config.json]

use starload::{
    io::RecordReader, AggregateMaintainer, BatchIngestor, GroupingMode, LoaderConfig, Warehouse,
};
use std::sync::Arc;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let input = args.next().ok_or("usage: load_ndjson <input> [journal] [config]")?;
    let journal = args.next().unwrap_or_else(|| "warehouse.journal".to_string());
    let config = match args.next() {
        Some(path) => LoaderConfig::from_json_file(path)?,
        None => LoaderConfig::default(),
    };

    let warehouse = Arc::new(Warehouse::open(&journal, &config)?);
    let aggregates = Arc::new(AggregateMaintainer::new(warehouse.clone()));
    let ingestor =
        BatchIngestor::new(warehouse.clone(), config)?.with_aggregates(aggregates.clone());

    let report = match ingestor.ingest_reader(RecordReader::open(&input)?) {
        Ok(report) => report,
        Err(err) => {
            if let Some(partial) = err.partial_report() {
                println!("{}", serde_json::to_string_pretty(partial)?);
            }
            return Err(err.into());
        }
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    let rollup = aggregates.refresh(GroupingMode::Rollup)?;
    for row in rollup.rows() {
        println!("{:>8} {:>8} {:>14.2}", row.store, row.product, row.total_sale);
    }

    if !report.succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
