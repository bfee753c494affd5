use std::collections::HashMap;
use std::io::Read;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::debug;

use sqldigest::digest::query_digest_into;
use sqldigest::strip::strip_comments;
use sqldigest::DigestConfig;

#[derive(Parser, Debug)]
#[command(name = "sqldigest", about = "SQL query digesting and comment stripping")]
struct Cli {
    /// SQL statement to process; reads stdin when omitted
    sql: Option<String>,

    /// Strip comments and collapse whitespace instead of digesting
    #[arg(short = 's', long)]
    strip: bool,

    /// Treat every input line as a separate statement
    #[arg(short = 'l', long)]
    lines: bool,

    /// Count identical digests across input lines, highest first
    #[arg(short = 'a', long)]
    aggregate: bool,

    /// Emit one JSON record per statement
    #[arg(long)]
    json: bool,

    /// ASCII-lowercase the output
    #[arg(long)]
    lowercase: bool,

    /// Rewrite the bare token NULL to ?
    #[arg(long)]
    replace_null: bool,

    /// Rewrite digit runs to ? without numeric-literal analysis
    #[arg(long)]
    no_digits: bool,

    /// Placeholders allowed in one list before the rest collapses to ...
    #[arg(long, default_value_t = 3)]
    grouping_limit: usize,

    /// Maximum bytes examined per statement
    #[arg(long, default_value_t = 2048)]
    max_length: usize,
}

#[derive(Serialize)]
struct Record<'a> {
    digest: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    first_comment: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sqldigest=warn".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = DigestConfig {
        max_query_length: cli.max_length,
        lowercase: cli.lowercase,
        replace_null: cli.replace_null,
        no_digits: cli.no_digits,
        grouping_limit: cli.grouping_limit,
    };

    let input = match &cli.sql {
        Some(sql) => sql.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            buf
        }
    };
    debug!("processing {} input bytes", input.len());

    if cli.aggregate {
        aggregate(&input, &cfg);
        return Ok(());
    }

    let mut out = Vec::new();
    if cli.lines {
        for line in input.lines().filter(|l| !l.trim().is_empty()) {
            emit(line.as_bytes(), &cfg, &cli, &mut out)?;
        }
    } else {
        emit(input.trim_end().as_bytes(), &cfg, &cli, &mut out)?;
    }

    Ok(())
}

fn emit(sql: &[u8], cfg: &DigestConfig, cli: &Cli, out: &mut Vec<u8>) -> anyhow::Result<()> {
    if cli.strip {
        *out = strip_comments(sql, cfg);
        println!("{}", String::from_utf8_lossy(out));
        return Ok(());
    }

    let first_comment = query_digest_into(sql, cfg, out);
    let digest = String::from_utf8_lossy(out);
    if cli.json {
        let record = Record {
            digest: digest.as_ref(),
            first_comment: first_comment
                .as_deref()
                .map(|c| String::from_utf8_lossy(c).into_owned()),
        };
        println!("{}", serde_json::to_string(&record)?);
    } else {
        println!("{digest}");
    }
    Ok(())
}

/// Count identical digests across input lines, the way a statistics consumer
/// would key on them. Sorted by count, then digest; pipe-friendly.
fn aggregate(input: &str, cfg: &DigestConfig) {
    let mut counts: HashMap<String, u64> = HashMap::new();
    let mut out = Vec::new();
    for line in input.lines().filter(|l| !l.trim().is_empty()) {
        query_digest_into(line.as_bytes(), cfg, &mut out);
        let digest = String::from_utf8_lossy(&out).into_owned();
        *counts.entry(digest).or_insert(0) += 1;
    }
    let mut rows: Vec<_> = counts.into_iter().collect();
    rows.sort_unstable_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    for (digest, count) in rows {
        println!("{count:>8}  {digest}");
    }
}
