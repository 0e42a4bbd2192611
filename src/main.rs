//! Command-line driver: streams a logical replication slot and prints each
//! decoded output-plugin payload to stdout.

use anyhow::Result;
use clap::Parser;
use pg_logical_stream::{
    ConsumerAction, LibpqDriver, ReplicationEvent, ReplicatorConfig, Replicator,
};
use std::collections::HashMap;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "pg_logical_stream",
    about = "Stream a PostgreSQL logical replication slot to stdout",
    version
)]
struct Args {
    /// libpq connection string, e.g. "host=localhost dbname=mydb"
    #[arg(long)]
    conninfo: Option<String>,

    /// Replication slot name
    #[arg(long)]
    slot: String,

    /// Starting LSN, canonical "HH/LL" form or an integer literal
    #[arg(long)]
    start_position: Option<String>,

    /// Stop once progress reaches this LSN
    #[arg(long)]
    end_position: Option<String>,

    /// Seconds between Standby Status Update feedback messages
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    let args = Args::parse();

    let mut options: HashMap<String, String> = HashMap::new();
    options.insert("slot".to_string(), args.slot.clone());
    options.insert(
        "status_interval".to_string(),
        args.status_interval.to_string(),
    );
    if let Some(start) = args.start_position {
        options.insert("start_position".to_string(), start);
    }
    if let Some(end) = args.end_position {
        options.insert("end_position".to_string(), end);
    }
    if let Some(conninfo) = &args.conninfo {
        for token in conninfo.split_whitespace() {
            if let Some((k, v)) = token.split_once('=') {
                options.insert(k.to_string(), v.trim_matches('\'').to_string());
            }
        }
    }

    let config = ReplicatorConfig::from_options(options)?;
    info!(slot = %args.slot, conninfo = %config.conninfo, "connecting");

    // libpq is synchronous; run the session on a dedicated thread rather
    // than blocking whatever called main().
    let result = std::thread::spawn(move || -> Result<()> {
        let driver = LibpqDriver::connect(&config.conninfo)?;
        let mut replicator: Replicator<LibpqDriver> = Replicator::new(config);
        replicator.replicate(driver, |event| match event {
            ReplicationEvent::Data(lsn, payload) => {
                println!("{lsn} {}", String::from_utf8_lossy(payload));
                Ok(ConsumerAction::Continue)
            }
            ReplicationEvent::Feedback => Ok(ConsumerAction::Continue),
        })?;
        Ok(())
    })
    .join()
    .unwrap_or_else(|_| Err(anyhow::anyhow!("replication thread panicked")));

    match result {
        Ok(()) => {
            info!("replication stream ended");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "replication stream failed");
            Err(e)
        }
    }
}
