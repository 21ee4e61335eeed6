use crate::client::HttpStore;
use crate::holding::HoldingDraft;
use crate::portfolio::{draw_pie_chart, print_holdings, print_metrics, MetricsSource};
use crate::sync::Synchronizer;
use crate::tui::Tab;

use clap::{arg, Command};
use colored::Colorize;
use env_logger::Builder;
use eyre::{bail, eyre, WrapErr};
use log::{info, LevelFilter};
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

mod client;
mod error;
mod holding;
mod portfolio;
mod scheduler;
mod sync;
mod tui;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Config {
    base_url: String,
    holdings_interval_ms: u64,
    metrics_interval_ms: u64,
    request_timeout_ms: u64,
    metrics_source: MetricsSource,
    default_tab: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            holdings_interval_ms: 30_000,
            metrics_interval_ms: 5_000,
            request_timeout_ms: client::DEFAULT_TIMEOUT_MS,
            metrics_source: MetricsSource::Local,
            default_tab: "overview".to_string(),
        }
    }
}

impl Config {
    fn validate(&self) -> eyre::Result<()> {
        if self.base_url.trim().is_empty() {
            bail!("base_url must not be empty");
        }
        for (name, value) in [
            ("holdings_interval_ms", self.holdings_interval_ms),
            ("metrics_interval_ms", self.metrics_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }
        Ok(())
    }
}

fn cli() -> Command {
    Command::new("stockwatch")
        .about("Track stock holdings kept on a remote portfolio service")
        .arg_required_else_help(true)
        .arg(arg!(--url <URL> "Base URL of the portfolio service").global(true))
        .subcommand(Command::new("config").about("Print the path to the config file"))
        .subcommand(
            Command::new("holdings").about("Show your holdings with real-time prices"),
        )
        .subcommand(
            Command::new("metrics")
                .about("Show total value, top holding and distribution")
                .arg(arg!(--remote "Use the metrics reported by the service")),
        )
        .subcommand(
            Command::new("add")
                .about("Add a new holding")
                .arg(arg!(<COMPANY> "Company name"))
                .arg(arg!(<TICKER> "Uppercase ticker symbol"))
                .arg(arg!(<PRICE> "Buy price"))
                .arg(arg!(<QUANTITY> "Number of shares")),
        )
        .subcommand(
            Command::new("edit")
                .about("Edit an existing holding")
                .arg(arg!(<TICKER> "Ticker symbol of the holding to edit"))
                .arg(arg!(<COMPANY> "Company name"))
                .arg(arg!(<PRICE> "Buy price"))
                .arg(arg!(<QUANTITY> "Number of shares")),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a holding")
                .arg(arg!(<TICKER> "Ticker symbol of the holding to delete")),
        )
        .subcommand(
            Command::new("update-price")
                .about("Ask the service to refresh the stored price of a holding")
                .arg(arg!(<TICKER> "Ticker symbol of the holding")),
        )
        .subcommand(
            Command::new("watch")
                .about("Open the live dashboard")
                .arg(arg!(--tab <TAB> "Tab to open on: overview or holdings")),
        )
}

fn init_logging(default: LevelFilter) {
    Builder::new()
        .filter_level(default)
        .parse_default_env()
        .format_timestamp_secs()
        .init();
}

fn required_arg<'a>(matches: &'a clap::ArgMatches, name: &str) -> eyre::Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .ok_or_else(|| eyre!("missing argument {name}"))
}

fn draft_from(matches: &clap::ArgMatches, ticker: &str) -> eyre::Result<HoldingDraft> {
    Ok(HoldingDraft::new(
        required_arg(matches, "COMPANY")?,
        ticker,
        required_arg(matches, "PRICE")?,
        required_arg(matches, "QUANTITY")?,
    ))
}

/// Print the outcome of a mutation. Returns whether it succeeded.
fn report<T>(result: Result<T, error::StoreError>, success: impl FnOnce(T) -> String) -> bool {
    match result {
        Ok(value) => {
            println!("{}", success(value).green());
            true
        }
        Err(error::StoreError::Validation(errors)) => {
            for e in errors.iter() {
                eprintln!("{} {e}", "Invalid:".red().bold());
            }
            false
        }
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e.user_message());
            false
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let matches = cli().get_matches();

    let watching = matches.subcommand_name() == Some("watch");
    init_logging(if watching {
        LevelFilter::Off
    } else {
        LevelFilter::Warn
    });

    let mut cfg: Config =
        confy::load("stockwatch", "config").wrap_err("failed to load configuration")?;
    if let Some(url) = matches.get_one::<String>("url") {
        cfg.base_url.clone_from(url);
    }
    cfg.validate()?;

    if matches.subcommand_matches("config").is_some() {
        let path = confy::get_configuration_file_path("stockwatch", "config")?;
        println!("Your config file is located here: \n{}", path.display());
        return Ok(());
    }

    let store = HttpStore::new(
        &cfg.base_url,
        Duration::from_millis(cfg.request_timeout_ms),
    )?;
    info!("Using portfolio service at {}", store.base_url());
    let sync = Arc::new(Synchronizer::new(store));

    let succeeded = match matches.subcommand() {
        Some(("holdings", _)) => {
            sync.refresh()
                .await
                .wrap_err_with(|| format!("failed to load holdings from {}", cfg.base_url))?;
            print_holdings(&sync.snapshot().holdings, true);
            true
        }
        Some(("metrics", sub)) => {
            let source = if sub.get_flag("remote") {
                sync.refresh_metrics().await?;
                MetricsSource::Remote
            } else {
                sync.refresh().await?;
                MetricsSource::Local
            };
            let snapshot = sync.snapshot();
            let metrics = snapshot.metrics_from(source);
            draw_pie_chart(metrics);
            print_metrics(metrics);
            true
        }
        Some(("add", sub)) => {
            let ticker = required_arg(sub, "TICKER")?;
            let result = sync.create(&draft_from(sub, ticker)?).await;
            report(result, |h| format!("Added {} ({})", h.company_name, h.ticker_symbol))
        }
        Some(("edit", sub)) => {
            let ticker = required_arg(sub, "TICKER")?;
            let result = sync.update(ticker, &draft_from(sub, ticker)?).await;
            report(result, |h| format!("Updated {}", h.ticker_symbol))
        }
        Some(("delete", sub)) => {
            let ticker = required_arg(sub, "TICKER")?;
            report(sync.delete(ticker).await, |_| format!("Deleted {ticker}"))
        }
        Some(("update-price", sub)) => {
            let ticker = required_arg(sub, "TICKER")?;
            report(sync.update_price(ticker).await, |h| {
                format!("Stored price of {} is now {:.2}", h.ticker_symbol, h.price)
            })
        }
        Some(("watch", sub)) => {
            let tab_name = sub
                .get_one::<String>("tab")
                .unwrap_or(&cfg.default_tab);
            let tab = Tab::from_str(tab_name).ok_or_else(|| eyre!("unknown tab {tab_name}"))?;

            tui::run_tui(
                sync,
                Duration::from_millis(cfg.holdings_interval_ms),
                Duration::from_millis(cfg.metrics_interval_ms),
                cfg.metrics_source,
                Some(tab),
            )
            .await
            .map_err(|e| eyre!("dashboard failed: {e}"))?;
            true
        }
        _ => {
            cli().print_help()?;
            true
        }
    };

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}
