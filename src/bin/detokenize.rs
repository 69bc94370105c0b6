//! Replace `$`-prefixed Base64 tokenized messages in a log stream with their text.
//!
//! Usage:
//!   detokenize -d tokens.csv [-d more/#.*] [OPTIONS] [INPUT]
//!   device-console | detokenize -d tokens.csv
//!
//! Output is written and flushed as soon as it is available, so the tool can sit at the
//! end of a live pipe. Databases are re-read when their files change.
//!
//! Options:
//!   --database, -d SOURCE  Token database: CSV file or directory, optionally `path#domain-regex`
//!                          (repeatable)
//!   --prefix CHAR          Message prefix (default `$`)
//!   --recursion N          Nested message depth (default 9)
//!   --poll-ms N            Minimum time between database checks (default 1000)
//!   --show-errors          Render failed arguments as diagnostics
//!
//! Logs go to stderr; set RUST_LOG=tokdetok=debug for reload details.

use anyhow::{bail, Context};
use std::fs::File;
use std::io::{self, Read};
use std::time::Duration;
use tokdetok::{AutoUpdatingDetokenizer, DetokenizerOptions, DEFAULT_RECURSION};
use tracing_subscriber::EnvFilter;

struct Args {
    databases: Vec<String>,
    prefix: u8,
    recursion: usize,
    poll: Duration,
    show_errors: bool,
    input: Option<String>,
}

fn take_value(args: &mut Vec<String>, names: &[&str]) -> anyhow::Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| names.contains(&a.as_str())) else {
        return Ok(None);
    };
    args.remove(pos);
    if pos >= args.len() {
        bail!("{} needs a value", names[0]);
    }
    Ok(Some(args.remove(pos)))
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let show_errors = if let Some(pos) = args.iter().position(|a| a == "--show-errors") {
        args.remove(pos);
        true
    } else {
        false
    };

    let mut databases = Vec::new();
    while let Some(db) = take_value(&mut args, &["--database", "-d"])? {
        databases.push(db);
    }
    if databases.is_empty() {
        bail!("usage: detokenize -d DATABASE [-d DATABASE ...] [--prefix C] [--recursion N] [--poll-ms N] [--show-errors] [INPUT]");
    }

    let prefix = match take_value(&mut args, &["--prefix"])? {
        Some(p) if p.len() == 1 => p.as_bytes()[0],
        Some(p) => bail!("--prefix must be a single ASCII character, got {:?}", p),
        None => b'$',
    };
    let recursion = match take_value(&mut args, &["--recursion"])? {
        Some(n) => n.parse().with_context(|| format!("invalid --recursion {:?}", n))?,
        None => DEFAULT_RECURSION,
    };
    let poll = match take_value(&mut args, &["--poll-ms"])? {
        Some(n) => Duration::from_millis(n.parse().with_context(|| format!("invalid --poll-ms {:?}", n))?),
        None => tokdetok::DEFAULT_MIN_POLL_PERIOD,
    };

    if args.len() > 1 {
        bail!("unexpected arguments: {}", args[1..].join(" "));
    }
    Ok(Args { databases, prefix, recursion, poll, show_errors, input: args.pop() })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = parse_args()?;
    let options = DetokenizerOptions {
        show_errors: args.show_errors,
        recursion: args.recursion,
        ..DetokenizerOptions::default()
    };
    let detok = AutoUpdatingDetokenizer::builder(args.databases.iter().cloned())
        .min_poll_period(args.poll)
        .options(options)
        .open()
        .context("opening token databases")?;

    let input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(File::open(path).with_context(|| format!("opening {}", path))?),
        None => Box::new(io::stdin().lock()),
    };
    let stdout = io::stdout().lock();
    match detok.detokenize_base64_live(input, stdout, args.prefix, args.recursion) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other.context("rewriting stream"),
    }
}
