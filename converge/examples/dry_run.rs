//! Plan and apply a resource file against the in-memory hypervisor.
//!
//! Run with: cargo run --example dry_run -- <specs.json> [state_dir] [config.toml]
//!
//! `specs.json` holds an array of resource specifications:
//!
//! ```json
//! [
//!   {"kind": "switch", "name": "lan", "properties": {"name": "lan", "switchType": "Internal"}},
//!   {"kind": "machine", "name": "web", "properties": {"machineName": "web01"}, "dependsOn": ["lan"]}
//! ]
//! ```

use std::env;
use std::error::Error;
use std::sync::Arc;

use hyperv_converge::{
    init_tracing, Change, ConvergeConfig, Converger, DiffOutcome, InMemoryHypervisor,
    JsonFileStateStore, RawSpec,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let state_dir = args.get(2).map(String::as_str).unwrap_or(".converge-state");
    let config = ConvergeConfig::load(args.get(3).map(String::as_str).unwrap_or("converge.toml"))?;
    init_tracing(&config.logging.level);

    let specs: Vec<RawSpec> = serde_json::from_str(&std::fs::read_to_string(&args[1])?)?;
    println!("Loaded {} resource(s) from '{}'", specs.len(), args[1]);

    let converger = Converger::new(
        Arc::new(InMemoryHypervisor::new()),
        Arc::new(JsonFileStateStore::new(state_dir)),
    )
    .with_config(&config);

    let plan = converger.plan(specs).await?;
    println!("Plan:");
    for step in plan.steps() {
        let preview = match &step.preview {
            DiffOutcome::Ready(result) => match &result.change {
                Change::NoChange => "no change".to_string(),
                Change::InPlaceUpdate { changed_fields } => {
                    format!("update {}", changed_fields.join(", "))
                }
                Change::Replace { reason } => format!("replace ({reason})"),
            },
            DiffOutcome::Pending { unresolved } => format!("pending on {} output(s)", unresolved.len()),
        };
        println!("  {:<24} {:<8} {}", step.spec.name(), step.spec.kind(), preview);
    }

    let report = converger.apply(plan).await;
    println!("Result:");
    print!("{report}");
    if !report.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_usage() {
    println!("Usage: dry_run <specs.json> [state_dir] [config.toml]");
    println!();
    println!("Converges the resources against an in-process hypervisor and");
    println!("persists observed state as JSON documents under state_dir.");
}
