//! Command-line identity search.
//!
//! Runs one search through the same orchestrator as the HTTP service and
//! prints the result as JSON on stdout. Logs go to stderr. Ctrl-C cancels
//! the search and prints whatever was gathered so far.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use identity_search::config::Config;
use identity_search::credentials::Credential;
use identity_search::models::SearchParams;
use identity_search::orchestrator::{cancellation, SearchOptions, SearchOrchestrator};

#[derive(Parser, Debug)]
#[command(name = "identity-search")]
#[command(
    author,
    version,
    about = "Search identity records across all configured providers",
    long_about = None
)]
struct Cli {
    /// Full name (or part of it)
    #[arg(long)]
    name: Option<String>,

    /// National ID number (16 digits)
    #[arg(long)]
    nik: Option<String>,

    /// Family certificate number (16 digits)
    #[arg(long, alias = "family_cert_number")]
    family_cert_number: Option<String>,

    /// Birth place
    #[arg(long, alias = "tempat_lahir")]
    birth_place: Option<String>,

    /// Birth date, as the provider formats it
    #[arg(long, alias = "tanggal_lahir")]
    birth_date: Option<String>,

    /// Province code
    #[arg(long, alias = "no_prop")]
    province_code: Option<String>,

    /// Regency code
    #[arg(long, alias = "no_kab")]
    regency_code: Option<String>,

    /// District code
    #[arg(long, alias = "no_kec")]
    district_code: Option<String>,

    /// Village code
    #[arg(long, alias = "no_desa")]
    village_code: Option<String>,

    #[arg(long, value_name = "N")]
    page: Option<u32>,

    #[arg(long, value_name = "N")]
    limit: Option<u32>,

    /// Provider A account to use instead of the configured one
    #[arg(long, requires = "password")]
    username: Option<String>,

    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Ignore the cached Provider A token and log in again
    #[arg(long)]
    force_login: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

impl Cli {
    fn params(&self) -> SearchParams {
        SearchParams {
            name: self.name.clone(),
            nik: self.nik.clone(),
            family_cert_number: self.family_cert_number.clone(),
            birth_place: self.birth_place.clone(),
            birth_date: self.birth_date.clone(),
            province_code: self.province_code.clone(),
            regency_code: self.regency_code.clone(),
            district_code: self.district_code.clone(),
            village_code: self.village_code.clone(),
            page: self.page,
            limit: self.limit,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "identity_search=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::from_env()?;
    let orchestrator = SearchOrchestrator::from_config(&config);

    let options = SearchOptions {
        credential: match (&cli.username, &cli.password) {
            (Some(username), Some(password)) => Some(Credential::new(username, password)),
            _ => None,
        },
        force_login: cli.force_login,
    };

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, returning partial results");
            handle.cancel();
        }
    });

    let result = orchestrator.run(&cli.params(), &options, &signal).await?;

    let output = if cli.pretty {
        serde_json::to_string_pretty(&result)?
    } else {
        serde_json::to_string(&result)?
    };
    println!("{}", output);

    if let Some(reason) = &result.reason {
        eprintln!("{}", reason);
    }

    Ok(if result.flags.all_providers_unavailable {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    })
}
