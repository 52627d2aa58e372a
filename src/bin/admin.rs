#![cfg(not(tarpaulin_include))]

use hackdesk::app::AppState;
use hackdesk::config::Config;
use hackdesk::participant::{self, ParticipantQuery};
use hackdesk::{backup, export, login};
use std::env;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:
  hackdesk-admin add-admin <username> <password>
  hackdesk-admin backup
  hackdesk-admin export <file.csv>";

/// Operator commands against the same data directory the server uses
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hackdesk=info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let config = Config::load()?;

    match args.as_slice() {
        ["add-admin", username, password] => {
            let state = AppState::from_config(config)?;
            let admin = login::create_admin(&state.store, username, password).await?;
            println!("Created admin {}", admin.id);
        }
        ["backup"] => {
            let state = AppState::from_config(config)?;
            let outcome = backup::run_backup(&state).await?;
            println!(
                "Backed up {} participants to {} ({} bytes)",
                outcome.rows, outcome.location, outcome.bytes
            );
        }
        ["export", path] => {
            let state = AppState::from_config(config)?;
            let participants =
                participant::list_participants(&state.store, &ParticipantQuery::default()).await?;
            tokio::fs::write(path, export::participants_csv(&participants)).await?;
            println!("Wrote {} participants to {path}", participants.len());
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
