use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tabledger::import::convert_log;
use tabledger::utils::parse_money;
use tabledger::{Config, LedgerStore, TransactionRequest};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Parser)]
#[command(name = "tabledger", version, about = "Replicated bar-tab ledger")]
struct Cli {
	/// Configuration file (defaults to $TABLEDGER_CONFIG or tabledger.yaml)
	#[arg(long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Pull upstream changes and load the ledger
	Reload,
	/// Print all member accounts
	Accounts,
	/// Print the visible products
	Products,
	/// Record a cash deposit for a member
	Deposit {
		#[arg(long)]
		member: String,
		#[arg(long, value_parser = parse_amount)]
		amount: Decimal,
	},
	/// Move money from one member to another
	Transfer {
		#[arg(long)]
		payer: String,
		#[arg(long)]
		payee: String,
		#[arg(long, value_parser = parse_amount)]
		amount: Decimal,
	},
	/// Record a purchase
	Buy {
		#[arg(long)]
		member: String,
		/// Items as PRODUCT=COUNT
		#[arg(required = true, value_parser = parse_item)]
		items: Vec<(String, Decimal)>,
	},
	/// Reload periodically until interrupted
	Watch {
		/// Seconds between reloads
		#[arg(long, default_value_t = 60)]
		interval: u64,
	},
	/// Convert a legacy point-of-sale log to ledger text
	ImportSpacebar {
		file: PathBuf,
		/// Accounts that stay open after a rename
		#[arg(long = "keep-open")]
		keep_open: Vec<String>,
	},
}

fn parse_amount(raw: &str) -> Result<Decimal, String> {
	parse_money(raw).map_err(|e| format!("invalid amount {:?}: {}", raw, e))
}

fn parse_item(raw: &str) -> Result<(String, Decimal), String> {
	let (product, count) = raw
		.split_once('=')
		.ok_or_else(|| format!("expected PRODUCT=COUNT, got {:?}", raw))?;
	let count = count
		.trim()
		.parse::<Decimal>()
		.map_err(|e| format!("invalid count {:?}: {}", count, e))?;
	Ok((product.trim().to_string(), count))
}

fn print_json(value: &impl Serialize) -> CliResult {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_writer(std::io::stderr)
		.init();

	let cli = Cli::parse();
	if let Err(e) = run(cli).await {
		error!("{}", e);
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> CliResult {
	let config = Config::load(cli.config.as_deref())?;

	// The importer never touches the data directory
	if let Command::ImportSpacebar { file, keep_open } = &cli.command {
		let log = tokio::fs::read_to_string(file).await?;
		print!("{}", convert_log(&log, config.accounts.clone(), keep_open.clone())?);
		return Ok(());
	}

	let store = LedgerStore::from_config(&config);
	let summary = store.reload().await?;
	info!(
		"Loaded {} accounts and {} products at {}",
		summary.accounts, summary.products, summary.revision
	);

	let request = match cli.command {
		Command::Reload => return print_json(&summary),
		Command::Accounts => return print_json(&store.book().accounts_view()),
		Command::Products => return print_json(&store.book().products_view()),
		Command::Watch { interval } => return watch(&store, interval).await,
		Command::ImportSpacebar { .. } => return Ok(()),
		Command::Deposit { member, amount } => TransactionRequest::Deposit { member, amount },
		Command::Transfer {
			payer,
			payee,
			amount,
		} => TransactionRequest::Transfer {
			payer,
			payee,
			amount,
		},
		Command::Buy { member, items } => TransactionRequest::Purchase {
			buyer: member,
			items,
		},
	};

	let outcome = store.submit(request).await?;
	info!(
		"Committed {} after {} attempt(s)",
		outcome.revision, outcome.attempts
	);
	print_json(&outcome.view())
}

async fn watch(store: &LedgerStore, interval: u64) -> CliResult {
	let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
	// The first tick completes immediately; the initial reload already ran
	ticker.tick().await;

	loop {
		tokio::select! {
			_ = ticker.tick() => {
				match store.reload().await {
					Ok(summary) => info!("Reloaded at {}", summary.revision),
					Err(e) => warn!("Reload failed: {}", e),
				}
				info!("{}", store.status().summary());
			}
			result = tokio::signal::ctrl_c() => {
				result?;
				info!("Interrupted, stopping");
				return Ok(());
			}
		}
	}
}
