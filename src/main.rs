use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use dashtail_stream::HttpBackend;
use dashtail_tail::{ConnectionState, LiveTail, LogRecord, TailStatus};

mod config;

use config::{Config, parse_header};

/// Dashtail - follow a datasource's logs live from the terminal
#[derive(Parser, Debug)]
#[command(name = "dashtail")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Datasource id to tail
    #[arg(value_name = "DATASOURCE")]
    datasource: String,

    /// Log query, in the datasource's query language
    #[arg(value_name = "QUERY")]
    query: String,

    /// Backend base URL
    #[arg(long)]
    url: Option<String>,

    /// Records backfilled on each (re)connect
    #[arg(long)]
    limit: Option<usize>,

    /// Config file (defaults to the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Extra request header, repeatable
    #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_header)]
    headers: Vec<(String, String)>,

    /// Skip the validation query before streaming
    #[arg(long)]
    no_validate: bool,

    /// Window of the validation query, in seconds
    #[arg(long)]
    lookback: Option<u64>,

    /// Maximum records kept in memory
    #[arg(long)]
    max_records: Option<usize>,
}

impl Args {
    /// Merge CLI flags over file configuration
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.backend.url = url.clone();
        }
        for (name, value) in &self.headers {
            config.backend.headers.insert(name.clone(), value.clone());
        }
        if let Some(limit) = self.limit {
            config.tail.limit = limit;
        }
        if let Some(lookback) = self.lookback {
            config.tail.lookback_secs = lookback;
        }
        if let Some(max_records) = self.max_records {
            config.tail.max_records = max_records;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries records
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    args.apply(&mut config);

    let backend =
        HttpBackend::new(&config.backend_config()).context("Failed to create backend client")?;
    let mut tail_config = config.tail_config();
    tail_config.validate = !args.no_validate;

    let (record_tx, mut record_rx) = mpsc::unbounded_channel();
    let mut tail = LiveTail::new(Arc::new(backend), tail_config);
    tail.set_record_sink(record_tx);
    tail.set_datasource(args.datasource.as_str());
    tail.set_query(args.query.as_str());

    let mut status_rx = tail.watch_status();
    tail.start().await.context("Failed to start live tail")?;

    // Validation results are printed before live records
    if let Some(buffer) = tail.buffer() {
        for record in buffer.all() {
            println!("{}", format_record(&record));
        }
    }

    let mut last_printed = TailStatus::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!("run: interrupted");
                tail.stop(false);
                return Ok(());
            }
            Some(record) = record_rx.recv() => {
                println!("{}", format_record(&record));
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let status = status_rx.borrow_and_update().clone();
                if status_line(&status) != status_line(&last_printed) {
                    eprintln!("{}", status_line(&status));
                }
                let finished = status.state == ConnectionState::Idle && !tail.is_live();
                last_printed = status;
                if finished {
                    if let Some(error) = &last_printed.last_error {
                        anyhow::bail!("live tail stopped: {}", error);
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// `timestamp level line {labels}`
fn format_record(record: &LogRecord) -> String {
    let mut out = format!(
        "{} {} {}",
        record.timestamp,
        record.log_level().as_str(),
        record.line
    );
    if !record.labels.is_empty() {
        let labels: Vec<String> = record
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        out.push_str(&format!(" {{{}}}", labels.join(", ")));
    }
    out
}

/// One-line status summary for stderr
fn status_line(status: &TailStatus) -> String {
    let mut line = format!("[{}]", status.state);
    if status.attempt > 0 {
        line.push_str(&format!(" attempt {}", status.attempt));
    }
    if let Some(delay) = status.retry_in {
        line.push_str(&format!(" retry in {}ms", delay.as_millis()));
    }
    if let Some(error) = &status.last_error {
        line.push_str(&format!(": {}", error));
    }
    line
}
