//! Replay a call timeline through a panel's call governor.
//!
//! Loads the panel's saved options (or the defaults), applies command-line
//! overrides, then attempts one call per offset and prints a JSON line with
//! the decision. Useful for checking what a set of limits does to a burst of
//! clicks before saving them.
use anyhow::{bail, Context, Result};
use dashboard_insight_lib::{config, logging, now_ms, CallGovernor, PanelOptions};
use serde::Serialize;

const USAGE: &str = "\
Usage: insight_governor [--panel <id>] [--max <calls>] [--interval <ms>] <offset-ms>...

Each offset is milliseconds after the governor is created. Admitted calls are
recorded, blocked ones are not.

Flags:
  --panel <id>      Load options saved for this panel
  --max <calls>     Override maxCallsPerMinute
  --interval <ms>   Override minIntervalMs
  --help, -h        Show this help";

#[derive(Debug, Default, PartialEq)]
struct Args {
    panel: Option<String>,
    max: Option<u32>,
    interval: Option<u64>,
    offsets: Vec<i64>,
    help: bool,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
    let mut parsed = Args::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => parsed.help = true,
            "--panel" => {
                parsed.panel = Some(iter.next().context("--panel needs a value")?);
            }
            "--max" => {
                let value = iter.next().context("--max needs a value")?;
                parsed.max = Some(value.parse().with_context(|| format!("invalid --max \"{value}\""))?);
            }
            "--interval" => {
                let value = iter.next().context("--interval needs a value")?;
                parsed.interval =
                    Some(value.parse().with_context(|| format!("invalid --interval \"{value}\""))?);
            }
            flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
            offset => {
                let ms: i64 = offset
                    .parse()
                    .with_context(|| format!("invalid offset \"{offset}\""))?;
                if ms < 0 {
                    bail!("offsets must not be negative, got {ms}");
                }
                parsed.offsets.push(ms);
            }
        }
    }
    Ok(parsed)
}

/// One attempted call.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct Decision {
    at: i64,
    admitted: bool,
    wait_ms: u64,
    window_count: u32,
}

fn replay(governor: &mut CallGovernor, base_ms: i64, offsets: &[i64]) -> Result<Vec<Decision>> {
    offsets
        .iter()
        .map(|&offset| {
            let Some(now) = base_ms.checked_add(offset) else {
                bail!("offset {offset} is out of range");
            };
            let admitted = governor.can_call(now);
            let wait_ms = if admitted {
                0
            } else {
                governor.time_until_next_call_ms(now)
            };
            if admitted {
                governor.record_call(now);
            }
            Ok(Decision {
                at: offset,
                admitted,
                wait_ms,
                window_count: governor.window_count(),
            })
        })
        .collect()
}

fn resolve_options(args: &Args) -> Result<PanelOptions> {
    let mut options = match &args.panel {
        Some(id) => config::load_panel_options(id).map_err(anyhow::Error::msg)?,
        None => PanelOptions::default(),
    };
    if let Some(max) = args.max {
        options.max_calls_per_minute = max;
    }
    if let Some(interval) = args.interval {
        options.min_interval_ms = interval;
    }
    options.validate().map_err(anyhow::Error::msg)?;
    Ok(options)
}

fn main() -> Result<()> {
    logging::init_tracing();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        println!("{USAGE}");
        return Ok(());
    }
    if args.offsets.is_empty() {
        bail!("no offsets given\n\n{USAGE}");
    }

    let options = resolve_options(&args)?;
    tracing::info!(
        panel = args.panel.as_deref().unwrap_or("<defaults>"),
        max_calls_per_minute = options.max_calls_per_minute,
        min_interval_ms = options.min_interval_ms,
        "replaying call timeline"
    );

    let base = now_ms();
    let mut governor = CallGovernor::new(options.max_calls_per_minute, options.min_interval_ms, base);
    for decision in replay(&mut governor, base, &args.offsets)? {
        println!("{}", serde_json::to_string(&decision)?);
    }
    Ok(())
}
