#![forbid(unsafe_code)]

use he_conformance::{
    HarnessConfig, emit_parity_json, emit_parity_markdown, read_reverse_bundle, run_reverse_bundle,
};
use std::path::PathBuf;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

/// Returns whether every case matched.
fn run() -> Result<bool, String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let mut config = HarnessConfig::default_paths();
    let mut json = false;
    let mut bundle_path = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--json" => json = true,
            "--bundle" => {
                let value = iter.next().ok_or_else(usage)?;
                bundle_path = Some(PathBuf::from(value));
            }
            "--slot-counts" => {
                let value = iter.next().ok_or_else(usage)?;
                config.slot_counts = parse_slot_counts(value)?;
            }
            "--seed" => {
                let value = iter.next().ok_or_else(usage)?;
                config.key_seed = value
                    .parse::<u64>()
                    .map_err(|err| format!("invalid --seed `{value}`: {err}"))?;
            }
            "-h" | "--help" => {
                println!("{}", usage());
                return Ok(true);
            }
            _ => return Err(usage()),
        }
    }

    let bundle_path = bundle_path.unwrap_or_else(|| config.reverse_bundle_path());
    let bundle = read_reverse_bundle(&bundle_path)
        .map_err(|err| format!("failed to read {}: {err}", bundle_path.display()))?;
    log::info!(
        "running {} cases from {} at slot counts {:?}",
        bundle.cases.len(),
        bundle_path.display(),
        config.slot_counts
    );

    let report = run_reverse_bundle(&config, &bundle);
    if json {
        println!(
            "{}",
            emit_parity_json(&report).map_err(|err| err.to_string())?
        );
    } else {
        print!("{}", emit_parity_markdown(&report));
    }
    Ok(report.is_clean())
}

fn parse_slot_counts(raw: &str) -> Result<Vec<usize>, String> {
    raw.split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .map_err(|err| format!("invalid slot count `{part}`: {err}"))
        })
        .collect()
}

fn usage() -> String {
    "usage: he_reverse_report [--json] [--bundle <path>] [--slot-counts <n,n,...>] [--seed <u64>]"
        .to_owned()
}
