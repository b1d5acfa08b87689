use anyhow::Context;
use clap::{Arg, Command};
use common::config::Settings;
use common::logging::init_tracing;
use std::path::PathBuf;
use std::process;

fn cli() -> Command {
    Command::new("Compliance ETL")
        .version("1.0")
        .about("Incremental source-to-bronze pipelines and CSV ingestion")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Sets a custom config file"),
        )
        .subcommand(
            Command::new("ingest")
                .about("Validate a CSV file and upsert it into its source table")
                .arg(Arg::new("source").long("source").required(true).value_name("NAME"))
                .arg(Arg::new("file").long("file").required(true).value_name("PATH")),
        )
        .subcommand(
            Command::new("run")
                .about("Run one incremental pipeline")
                .arg(Arg::new("pipeline").long("pipeline").required(true).value_name("ID")),
        )
        .subcommand(Command::new("run-all").about("Run every configured pipeline"))
        .subcommand(Command::new("init-db").about("Create bookkeeping and source tables"))
}

async fn dispatch(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|s| s.as_str())
        .unwrap_or("config/etl.toml");
    let settings = Settings::new(config_path)
        .with_context(|| format!("loading config from {}", config_path))?;
    init_tracing(&settings.logging);

    match matches.subcommand() {
        Some(("ingest", args)) => {
            let source = args.get_one::<String>("source").map(String::as_str).unwrap_or_default();
            let file = args.get_one::<String>("file").map(PathBuf::from).unwrap_or_default();
            let outcome = etl::run_ingestion(settings, source, &file)
                .await
                .with_context(|| format!("ingesting {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.result.status.is_durable() {
                anyhow::bail!(
                    "{} was not loaded: {}",
                    file.display(),
                    outcome.result.error_msg.unwrap_or_default()
                );
            }
        }
        Some(("run", args)) => {
            let pipeline = args.get_one::<String>("pipeline").map(String::as_str).unwrap_or_default();
            etl::run_pipeline(settings, pipeline)
                .await
                .with_context(|| format!("running {}", pipeline))?;
        }
        Some(("run-all", _)) => etl::run_all_pipelines(settings).await?,
        Some(("init-db", _)) => etl::init_database(settings).await?,
        _ => anyhow::bail!("No subcommand specified. Use --help for usage information."),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = dispatch(cli().get_matches()).await {
        eprintln!("ETL error: {:#}", e);
        process::exit(1);
    }
}
