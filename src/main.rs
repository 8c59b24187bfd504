use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use serde::Serialize;
use tracing::{info, warn};

use place_curator::commands::{self, DedupeOptions, EnrichOptions};
use place_curator::secrets::{
    CredentialVault, CATALOG_TOKEN_ACCOUNT, MODEL_API_KEY_ACCOUNT, VAULT_SERVICE_NAME,
};
use place_curator::{init_tracing, AppConfig, Catalog, HttpCatalogClient, RecordFilter};

#[derive(Parser)]
#[command(
    name = "place-curator",
    about = "Find duplicate places and enrich records in a travel catalog",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the model to complete or correct matching records.
    Enrich {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        max_pages: Option<usize>,
        /// Log and journal proposed updates without writing them.
        #[arg(long)]
        dry_run: bool,
        /// Pause between records, in milliseconds.
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Allow a run with no filter at all.
        #[arg(long)]
        all: bool,
    },

    /// Scan for records sharing a location.
    Dedupe {
        #[command(flatten)]
        filter: FilterArgs,
        /// Distance in metres; 0 matches on coordinates rounded to 6 decimals.
        #[arg(long, default_value = "0")]
        tolerance_m: f64,
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long)]
        max_pages: Option<usize>,
        /// Write the groups to a CSV file.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Delete every member except the lowest id of each group.
        #[arg(long)]
        delete_duplicates: bool,
    },

    /// Delete records by id.
    Delete {
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
    },

    /// Overwrite a record's coordinates.
    SetCoords {
        #[arg(long)]
        id: i64,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
    },

    /// Manage credentials kept in the system keychain.
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Print the effective configuration without secrets.
    Config,
}

#[derive(Args, Debug, Default)]
struct FilterArgs {
    /// ISO country code.
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    city: Option<i64>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    category: Option<String>,
}

impl From<FilterArgs> for RecordFilter {
    fn from(args: FilterArgs) -> Self {
        RecordFilter {
            country_code: args.country,
            city_id: args.city,
            search: args.search,
            category: args.category,
        }
    }
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Read a value from stdin and store it.
    Set { account: Account },
    Clear { account: Account },
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Account {
    ModelApiKey,
    CatalogToken,
}

impl Account {
    fn name(self) -> &'static str {
        match self {
            Account::ModelApiKey => MODEL_API_KEY_ACCOUNT,
            Account::CatalogToken => CATALOG_TOKEN_ACCOUNT,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = AppConfig::from_env();
    let vault = CredentialVault::new(VAULT_SERVICE_NAME);
    let credentials = match vault.resolve(&mut config) {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(?err, "keychain unavailable; using environment credentials only");
            None
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(Arc::clone(&stop));

    match cli.command {
        Commands::Enrich {
            filter,
            page_size,
            max_pages,
            dry_run,
            delay_ms,
            all,
        } => {
            let options = EnrichOptions {
                filter: filter.into(),
                page_size,
                max_pages,
                dry_run,
                delay_ms,
                all,
            };
            let summary = commands::enrich(&config, catalog(&config)?, options, stop).await?;
            print_json(&summary)?;
        }
        Commands::Dedupe {
            filter,
            tolerance_m,
            page_size,
            max_pages,
            report,
            delete_duplicates,
        } => {
            let options = DedupeOptions {
                filter: filter.into(),
                tolerance_m,
                page_size,
                max_pages,
                report,
                delete_duplicates,
            };
            let summary = commands::dedupe(&config, catalog(&config)?, options, stop).await?;
            print_json(&summary)?;
        }
        Commands::Delete { ids } => {
            let counters = commands::delete(&config, catalog(&config)?, ids, stop).await?;
            print_json(&counters)?;
        }
        Commands::SetCoords { id, lat, lng } => {
            let record = commands::set_coordinates(catalog(&config)?, id, lat, lng).await?;
            print_json(&record)?;
        }
        Commands::Credentials { action } => match action {
            CredentialAction::Set { account } => {
                let value = read_secret_line().context("failed to read credential from stdin")?;
                vault.set(account.name(), &SecretString::from(value))?;
                info!(account = account.name(), "credential stored");
            }
            CredentialAction::Clear { account } => {
                vault.clear(account.name())?;
            }
            CredentialAction::Status => {
                print_json(&credentials)?;
            }
        },
        Commands::Config => {
            print_json(&commands::config_report(&config, credentials))?;
        }
    }

    Ok(())
}

fn catalog(config: &AppConfig) -> Result<Arc<dyn Catalog>> {
    Ok(HttpCatalogClient::from_config(config)?.into_shared())
}

fn spawn_interrupt_handler(stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current item");
            stop.store(true, Ordering::SeqCst);
        }
    });
}

fn read_secret_line() -> Result<String> {
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("empty value");
    }
    Ok(value)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
