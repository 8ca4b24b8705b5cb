use budget_pipeline::args::{Args, Command, CredentialArgs, LogFormat};
use budget_pipeline::error::exit_code;
use budget_pipeline::{commands, Config, Credentials, Mode, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level, args.common().log_format());
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            error!("Exiting with error: {e:#}");
            ExitCode::from(code)
        }
    }
}

pub async fn main_inner(args: Args) -> Result<()> {
    trace!("{args:?}");
    let home = args.common().budget_home().path();

    // This allows for running the program without hitting the budgeting API. When
    // BUDGET_PIPELINE_TEST_MODE is set and non-empty, then the mode will be Mode::Test,
    // otherwise it will be Mode::Http.
    let mode = Mode::from_env();

    let _: () = match args.command() {
        Command::Init => commands::init(home).await?.print(),

        Command::Run(credential_args) => {
            let credentials = credentials(credential_args)?;
            let config = Config::load(home).await?;
            commands::run(config, credentials, mode).await?.print()
        }

        Command::Fetch(credential_args) => {
            let credentials = credentials(credential_args)?;
            let config = Config::load(home).await?;
            commands::fetch(config, credentials, mode).await?.print()
        }

        Command::Consolidate => commands::consolidate(Config::load(home).await?)
            .await?
            .print(),

        Command::Warehouse => commands::warehouse(Config::load(home).await?)
            .await?
            .print(),

        Command::Query(query_args) => {
            let config = Config::load(home).await?;
            let out = commands::query(config, query_args.clone()).await?;
            out.print();
            if let Some(rows) = out.structure() {
                println!("{rows}");
            }
        }
    };
    Ok(())
}

/// Credentials are checked before anything else so that a misconfigured run never touches the
/// network or the data directories.
fn credentials(args: &CredentialArgs) -> Result<Credentials> {
    Credentials::new(args.api_token(), args.budget_id())
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter, format: LogFormat) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this package only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
