//! Command-line interface for the spdb chunk store.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, TimeZone, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use spdb::{
    hash_data_type, unhash_data_type, unique_latest, Chunk, Config, PutMode, SpdbChunkStore,
};

#[derive(Parser)]
#[command(
    name = "spdb",
    version = env!("CARGO_PKG_VERSION"),
    about = "Day-partitioned chunk store for time-stamped weather products"
)]
struct Cli {
    /// Storage root directory (overrides the config file).
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Optional TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store chunks from payload files or an inline string.
    Put {
        /// Payload files; each becomes one chunk.
        files: Vec<PathBuf>,

        /// Inline payload text instead of files.
        #[arg(long, conflicts_with = "files")]
        text: Option<String>,

        /// Valid time (unix seconds or YYYY-MM-DDTHH:MM:SS, UTC).
        #[arg(short = 't', long)]
        valid: String,

        /// Seconds after the valid time before the data expires.
        #[arg(short, long, default_value_t = 0)]
        expire_after: i64,

        /// Primary type key: a number or a 1-4 character id to hash.
        #[arg(short, long, default_value = "0")]
        data_type: String,

        /// Secondary type key.
        #[arg(long, default_value_t = 0)]
        data_type2: u32,

        /// Put mode.
        #[arg(short, long, value_enum, default_value_t = ModeArg::Over)]
        mode: ModeArg,
    },

    /// Query chunks.
    Get {
        #[command(subcommand)]
        query: GetCommand,
    },

    /// Print the first and last data times in the store.
    Times,

    /// List distinct data times in a range.
    TimeList {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        /// Minimum spacing between listed times, in seconds.
        #[arg(long, default_value_t = 1)]
        min_interval: i64,
    },

    /// Remove chunks at one valid time.
    Erase {
        #[arg(short = 't', long)]
        valid: String,

        /// Primary type key to match (0 = any).
        #[arg(short, long, default_value = "0")]
        data_type: String,

        /// Secondary type key to match (0 = any).
        #[arg(long, default_value_t = 0)]
        data_type2: u32,
    },

    /// Reclaim space abandoned by overwrites and erases.
    Compact {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },

    /// Print the index contents for one day.
    Header {
        /// Any time within the day to inspect.
        #[arg(short = 't', long)]
        time: String,
    },
}

#[derive(Subcommand)]
enum GetCommand {
    /// Chunks stored at exactly the given time.
    Exact {
        #[arg(short = 't', long)]
        time: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Chunks nearest the given time within the margin.
    Closest {
        #[arg(short = 't', long)]
        time: String,

        /// Search margin in seconds.
        #[arg(short, long, default_value_t = 3600)]
        margin: i64,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Newest chunks at or before the given time within the margin.
    Before {
        #[arg(short = 't', long)]
        time: String,

        #[arg(short, long, default_value_t = 3600)]
        margin: i64,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Oldest chunks at or after the given time within the margin.
    After {
        #[arg(short = 't', long)]
        time: String,

        #[arg(short, long, default_value_t = 3600)]
        margin: i64,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// All chunks in a time interval.
    Interval {
        #[arg(long)]
        start: String,

        #[arg(long)]
        end: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Chunks whose validity interval covers the given time.
    Valid {
        #[arg(short = 't', long)]
        time: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// The newest chunks in the store.
    Latest {
        /// Seconds around the newest valid time to include.
        #[arg(short, long, default_value_t = 0)]
        margin: i64,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Args)]
struct FilterArgs {
    /// Primary type key: a number or a 1-4 character id to hash (0 = any).
    #[arg(short, long, default_value = "0")]
    data_type: String,

    /// Secondary type key (0 = any).
    #[arg(long, default_value_t = 0)]
    data_type2: u32,

    /// Keep only the newest chunk per type key.
    #[arg(long)]
    unique: bool,

    /// Print payloads as text along with the metadata.
    #[arg(long)]
    show_data: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Add,
    Over,
    Unique,
}

impl From<ModeArg> for PutMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Add => PutMode::Add,
            ModeArg::Over => PutMode::Over,
            ModeArg::Unique => PutMode::Unique,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(std::env::var("RUST_LOG").unwrap_or_else(
            |_| format!("spdb={}", config.logging.level),
        )))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut store_config = config.store_config();
    if let Some(root) = &cli.root {
        store_config.root = root.clone();
    }
    let mut store = SpdbChunkStore::new(store_config);

    match run(cli.command, &mut store) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Execute one subcommand, returning how many inputs failed.
fn run(command: Command, store: &mut SpdbChunkStore) -> Result<usize> {
    match command {
        Command::Put {
            files,
            text,
            valid,
            expire_after,
            data_type,
            data_type2,
            mode,
        } => {
            let valid_time = parse_time(&valid)?;
            let data_type = parse_data_type(&data_type)?;
            store.set_put_mode(mode.into());

            let mut failed = 0usize;
            let mut payloads: Vec<(String, Vec<u8>)> = Vec::new();
            if let Some(text) = text {
                payloads.push(("inline text".to_string(), text.into_bytes()));
            }
            for file in &files {
                match std::fs::read(file) {
                    Ok(bytes) => payloads.push((file.display().to_string(), bytes)),
                    Err(e) => {
                        eprintln!("put {}: {}", file.display(), e);
                        failed += 1;
                    }
                }
            }
            if payloads.is_empty() && failed == 0 {
                anyhow::bail!("nothing to store: give payload files or --text");
            }

            for (name, payload) in payloads {
                let chunk = Chunk::new(data_type, valid_time, payload)
                    .data_type2(data_type2)
                    .expire_time(valid_time + expire_after);
                match store.put(&chunk) {
                    Ok(()) => println!("stored {}", name),
                    Err(e) => {
                        eprintln!("put {}: {}", name, e);
                        failed += 1;
                    }
                }
            }
            Ok(failed)
        }

        Command::Get { query } => {
            let (chunks, filter) = match query {
                GetCommand::Exact { time, filter } => {
                    let chunks = store.get_exact(
                        parse_time(&time)?,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::Closest {
                    time,
                    margin,
                    filter,
                } => {
                    let chunks = store.get_closest(
                        parse_time(&time)?,
                        margin,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::Before {
                    time,
                    margin,
                    filter,
                } => {
                    let chunks = store.get_first_before(
                        parse_time(&time)?,
                        margin,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::After {
                    time,
                    margin,
                    filter,
                } => {
                    let chunks = store.get_first_after(
                        parse_time(&time)?,
                        margin,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::Interval { start, end, filter } => {
                    let chunks = store.get_interval(
                        parse_time(&start)?,
                        parse_time(&end)?,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::Valid { time, filter } => {
                    let chunks = store.get_valid(
                        parse_time(&time)?,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
                GetCommand::Latest { margin, filter } => {
                    let chunks = store.get_latest(
                        margin,
                        parse_data_type(&filter.data_type)?,
                        filter.data_type2,
                    )?;
                    (chunks, filter)
                }
            };
            let chunks = if filter.unique {
                unique_latest(chunks)
            } else {
                chunks
            };
            print_chunks(&chunks, filter.show_data);
            Ok(0)
        }

        Command::Times => {
            match store.get_times()? {
                Some((first, last)) => {
                    println!("first: {}", format_time(first));
                    println!("last:  {}", format_time(last));
                }
                None => println!("no data"),
            }
            Ok(0)
        }

        Command::TimeList {
            start,
            end,
            min_interval,
        } => {
            let times =
                store.compile_time_list(parse_time(&start)?, parse_time(&end)?, min_interval)?;
            for t in &times {
                println!("{}", format_time(*t));
            }
            println!("{} times", times.len());
            Ok(0)
        }

        Command::Erase {
            valid,
            data_type,
            data_type2,
        } => {
            let removed = store.erase(
                parse_time(&valid)?,
                parse_data_type(&data_type)?,
                data_type2,
            )?;
            println!("erased {} chunks", removed);
            Ok(0)
        }

        Command::Compact { start, end } => {
            let start = match start {
                Some(s) => parse_time(&s)?,
                None => 0,
            };
            let end = match end {
                Some(s) => parse_time(&s)?,
                None => i64::MAX,
            };
            let reclaimed = store.compact(start, end)?;
            println!("reclaimed {} bytes", reclaimed);
            Ok(0)
        }

        Command::Header { time } => {
            let t = parse_time(&time)?;
            let period = store.period_for_time(t)?;
            match period.load_index()? {
                None => println!("no data for {}", format_time(t)),
                Some(index) => {
                    let stats = period.stats()?;
                    println!("period dir: {}", period.dir().display());
                    println!("entries:    {}", stats.entries);
                    println!("data bytes: {}", stats.data_bytes);
                    println!("live bytes: {}", stats.live_bytes);
                    println!("fragmented: {}", stats.fragmented_bytes);
                    println!();
                    println!(
                        "{:<20} {:<20} {:>10} {:>10} {:>10} {:>10}",
                        "valid", "expire", "type", "type2", "offset", "len"
                    );
                    for e in index.entries() {
                        println!(
                            "{:<20} {:<20} {:>10} {:>10} {:>10} {:>10}",
                            format_time(e.valid_time),
                            format_time(e.expire_time),
                            e.data_type,
                            e.data_type2,
                            e.offset,
                            e.len
                        );
                    }
                }
            }
            Ok(0)
        }
    }
}

/// Accept unix seconds or a UTC calendar time.
fn parse_time(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").with_context(|| {
        format!(
            "unrecognized time '{}', want unix seconds or YYYY-MM-DDTHH:MM:SS",
            s
        )
    })?;
    Ok(Utc.from_utc_datetime(&naive).timestamp())
}

/// Accept a numeric type key or a short station/product id to hash.
fn parse_data_type(s: &str) -> Result<u32> {
    if let Ok(value) = s.parse::<u32>() {
        return Ok(value);
    }
    if !s.is_empty() && s.len() <= 4 && s.is_ascii() {
        return Ok(hash_data_type(s));
    }
    anyhow::bail!("data type '{}' is neither a number nor a 1-4 character id", s)
}

fn format_time(t: i64) -> String {
    match Utc.timestamp_opt(t, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => t.to_string(),
    }
}

fn print_chunks(chunks: &[Chunk], show_data: bool) {
    for chunk in chunks {
        let id = unhash_data_type(chunk.data_type);
        let type_label = if id.is_empty() {
            chunk.data_type.to_string()
        } else {
            format!("{} ({})", chunk.data_type, id)
        };
        println!(
            "valid {}  expire {}  type {}  type2 {}  {} bytes",
            format_time(chunk.valid_time),
            format_time(chunk.expire_time),
            type_label,
            chunk.data_type2,
            chunk.payload.len()
        );
        if show_data {
            println!("{}", String::from_utf8_lossy(&chunk.payload));
        }
    }
    println!("{} chunks", chunks.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_time_accepts_both_forms() {
        assert_eq!(parse_time("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(
            parse_time("2023-11-14T22:13:20").unwrap(),
            1_700_000_000
        );
        assert!(parse_time("last tuesday").is_err());
    }

    #[test]
    fn parse_data_type_accepts_numbers_and_ids() {
        assert_eq!(parse_data_type("1001").unwrap(), 1001);
        assert_eq!(parse_data_type("KDEN").unwrap(), hash_data_type("KDEN"));
        assert!(parse_data_type("TOOLONG").is_err());
    }
}
