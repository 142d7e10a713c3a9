//! kvsql CLI
//!
//! Opens an endpoint directly and runs one command against it.

use std::time::Duration;

use clap::{Parser, Subcommand};
use kvsql::{
    with_from_key, with_keys_only, with_limit, with_prefix, with_prev_kv, with_rev, Client,
    Config, ConnectionPool, Context, Event, EventType, GetResponse, Kv, KvError, OpOption,
    Watcher,
};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

/// kvsql CLI
#[derive(Parser, Debug)]
#[command(name = "kvsql")]
#[command(about = "etcd-style key-value store on a SQL table")]
#[command(version)]
struct Args {
    /// Backing store, `<engine>://<path-or-dsn>`
    #[arg(short, long, default_value = "sqlite://./db/state.db")]
    endpoint: String,

    /// Print responses as JSON
    #[arg(long)]
    json: bool,

    /// Lock wait (SQLite) or connect timeout (Postgres) in milliseconds
    #[arg(long, default_value = "5000")]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a key or range of keys
    Get {
        key: String,

        /// Treat the key as a prefix
        #[arg(long)]
        prefix: bool,

        /// Read everything from the key on
        #[arg(long)]
        from_key: bool,

        /// Read as of this revision
        #[arg(long, default_value = "0")]
        rev: i64,

        /// Max keys to return
        #[arg(long, default_value = "0")]
        limit: i64,

        /// Omit values
        #[arg(long)]
        keys_only: bool,
    },

    /// Write a key
    Put {
        key: String,
        value: String,

        /// Expire the key after this many seconds
        #[arg(long)]
        ttl: Option<i64>,

        /// Print the value that was replaced
        #[arg(long)]
        prev_kv: bool,
    },

    /// Delete a key or range of keys
    Del {
        key: String,

        /// Treat the key as a prefix
        #[arg(long)]
        prefix: bool,

        /// Print the deleted values
        #[arg(long)]
        prev_kv: bool,
    },

    /// Stream changes until interrupted or the timeout passes
    Watch {
        key: String,

        /// Treat the key as a prefix
        #[arg(long)]
        prefix: bool,

        /// Replay history from this revision
        #[arg(long, default_value = "0")]
        rev: i64,

        /// Also print the value each event replaced
        #[arg(long)]
        prev_kv: bool,

        /// Stop after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Report the current revision
    Compact {
        #[arg(default_value = "0")]
        rev: i64,
    },

    /// Expire keys and compact history now
    Cleanup {
        /// Most recent revisions to keep
        #[arg(long, default_value = "1000")]
        retain: i64,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kvsql=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> kvsql::Result<()> {
    let retain = match &args.command {
        Commands::Cleanup { retain } => *retain,
        _ => Config::default().compact_min_retain,
    };
    // One-shot commands; the background cleanup thread is not needed
    let config = Config::builder()
        .endpoint(&args.endpoint)
        .busy_timeout_ms(args.busy_timeout_ms)
        .compact_interval_ms(0)
        .compact_min_retain(retain)
        .poll_interval_ms(100)
        .build();

    let pool = ConnectionPool::new();
    let client = Client::new(&pool, config)?;
    let ctx = Context::background();
    let json = args.json;

    match args.command {
        Commands::Get {
            key,
            prefix,
            from_key,
            rev,
            limit,
            keys_only,
        } => {
            let mut opts = Vec::new();
            if prefix {
                opts.push(with_prefix());
            }
            if from_key {
                opts.push(with_from_key());
            }
            if rev > 0 {
                opts.push(with_rev(rev));
            }
            if limit > 0 {
                opts.push(with_limit(limit));
            }
            if keys_only {
                opts.push(with_keys_only());
            }
            let resp = client.kv().get(&ctx, &key, &opts)?;
            if json {
                print_json(&resp)?;
            } else {
                print_get(&resp);
            }
        }

        Commands::Put {
            key,
            value,
            ttl,
            prev_kv,
        } => {
            let mut opts = Vec::new();
            if let Some(ttl) = ttl {
                opts.push(kvsql::with_lease(ttl));
            }
            if prev_kv {
                opts.push(with_prev_kv());
            }
            let resp = client.kv().put(&ctx, &key, value, &opts)?;
            if json {
                print_json(&resp)?;
            } else {
                println!("OK (revision {})", resp.header.revision);
                if let Some(prev) = resp.prev_kv {
                    println!("{}\n{}", prev.key_str(), prev.value_str());
                }
            }
        }

        Commands::Del {
            key,
            prefix,
            prev_kv,
        } => {
            let mut opts = Vec::new();
            if prefix {
                opts.push(with_prefix());
            }
            if prev_kv {
                opts.push(with_prev_kv());
            }
            let resp = client.kv().delete(&ctx, &key, &opts)?;
            if json {
                print_json(&resp)?;
            } else {
                println!("{} (revision {})", resp.deleted, resp.header.revision);
                for kv in &resp.prev_kvs {
                    println!("{}\n{}", kv.key_str(), kv.value_str());
                }
            }
        }

        Commands::Watch {
            key,
            prefix,
            rev,
            prev_kv,
            timeout,
        } => {
            let mut opts: Vec<OpOption> = Vec::new();
            if prefix {
                opts.push(with_prefix());
            }
            if rev > 0 {
                opts.push(with_rev(rev));
            }
            let (ctx, _cancel) = match timeout {
                Some(secs) => ctx.with_timeout(Duration::from_secs(secs)),
                None => ctx.with_cancel(),
            };

            for resp in client.watcher().watch(&ctx, &key, &opts) {
                if json {
                    print_json(&resp)?;
                } else {
                    resp.events.iter().for_each(|e| print_event(e, prev_kv));
                }
                if resp.canceled {
                    tracing::warn!("watch ended: {}", resp.err().unwrap_or("canceled"));
                    break;
                }
            }
        }

        Commands::Compact { rev } => {
            let resp = client.kv().compact(&ctx, rev, &[])?;
            if json {
                print_json(&resp)?;
            } else {
                println!("revision {}", resp.header.revision);
            }
        }

        Commands::Cleanup { .. } => {
            let report = client.backend().cleanup()?;
            println!(
                "expired {} keys, removed {} rows, compact revision {}",
                report.expired, report.compacted, report.compact_revision
            );
        }
    }

    client.close()?;
    pool.close_all()
}

fn print_get(resp: &GetResponse) {
    for kv in &resp.kvs {
        println!("{}", kv.key_str());
        if !kv.value.is_empty() {
            println!("{}", kv.value_str());
        }
    }
    if resp.more {
        println!("... {} keys in range (revision {})", resp.count, resp.header.revision);
    }
}

fn print_event(event: &Event, prev_kv: bool) {
    let kind = match event.kind {
        EventType::Put => "PUT",
        EventType::Delete => "DELETE",
    };
    println!("{} {} (revision {})", kind, event.kv.key_str(), event.kv.mod_revision);
    if prev_kv {
        if let Some(prev) = &event.prev_kv {
            println!("{}", prev.value_str());
        }
    }
    if event.kind == EventType::Put {
        println!("{}", event.kv.value_str());
    }
}

fn print_json<T: Serialize>(value: &T) -> kvsql::Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| KvError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    println!("{line}");
    Ok(())
}
