//! Operator command surface for trace databases.
//!
//! Query subcommands read a local `SQLite` trace database directly and print
//! the same JSON bodies the HTTP service returns. `smoke` drives the client
//! SDK against a running service.

#![forbid(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use xray_sdk::{CandidateSample, CaptureMode, ClientConfig, StepType, StructuredMap, TraceClient};
use xray_trace_api::{TraceApi, DEFAULT_RATIO_GT, DEFAULT_RATIO_LT, DEFAULT_RECENT_RUNS};
use xray_trace_domain::RunId;

#[derive(Debug, Parser)]
#[command(name = "xray")]
#[command(about = "Inspect pipeline traces")]
pub struct Cli {
    #[arg(long, global = true, default_value = "./xray.sqlite3")]
    db: PathBuf,

    /// Log filter directive; `RUST_LOG` wins when set.
    #[arg(long, global = true, default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Most recent runs, newest first.
    Runs {
        #[arg(long, default_value_t = DEFAULT_RECENT_RUNS)]
        limit: usize,
    },
    /// Full replay view of one run.
    Trace { run_id: String },
    /// Filter steps that removed more than `--ratio-gt` of their candidates.
    FilterEvents {
        #[arg(long, default_value_t = DEFAULT_RATIO_GT)]
        ratio_gt: f64,
    },
    /// Filter steps that removed less than `--ratio-lt` of their candidates.
    WeakFilters {
        #[arg(long, default_value_t = DEFAULT_RATIO_LT)]
        ratio_lt: f64,
    },
    /// Steps labeled with a failure mode, across all pipelines.
    Failures {
        #[arg(long)]
        mode: Option<String>,
    },
    /// Record a small run through a live service.
    Smoke(SmokeArgs),
}

#[derive(Debug, Args)]
pub struct SmokeArgs {
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    api_url: String,
    /// Sampling verbosity recorded in each step's context: summary, sample or full.
    #[arg(long, default_value = "sample", value_parser = parse_capture_mode)]
    capture_mode: CaptureMode,
}

fn parse_capture_mode(value: &str) -> Result<CaptureMode, String> {
    CaptureMode::parse(value)
        .ok_or_else(|| format!("unknown capture mode `{value}`; expected summary, sample or full"))
}

/// Execute a parsed command, printing JSON to stdout.
///
/// # Errors
/// Returns an error when the database cannot be read or the smoke run could
/// not be delivered.
pub fn run_cli(cli: Cli) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(cli, &mut out)
}

/// Execute a parsed command, writing its JSON output to `out`.
///
/// # Errors
/// See [`run_cli`].
pub fn execute(cli: Cli, out: &mut impl Write) -> Result<()> {
    let api = TraceApi::new(cli.db);
    match cli.command {
        Command::Runs { limit } => print_json(out, &api.list_recent_runs(limit)?),
        Command::Trace { run_id } => print_json(out, &api.get_run_trace(&RunId(run_id))?),
        Command::FilterEvents { ratio_gt } => print_json(out, &api.filter_events_above(ratio_gt)?),
        Command::WeakFilters { ratio_lt } => print_json(out, &api.weak_filters_below(ratio_lt)?),
        Command::Failures { mode } => print_json(out, &api.query_failures(mode.as_deref())?),
        Command::Smoke(args) => run_smoke(&args, out),
    }
}

fn run_smoke(args: &SmokeArgs, out: &mut impl Write) -> Result<()> {
    let client = TraceClient::from_config(ClientConfig {
        capture_mode: args.capture_mode,
        ..ClientConfig::new(args.api_url.as_str())
    });
    let run_id = client.start_run("smoke_test", StructuredMap::new(), StructuredMap::new());

    client.with_step(&run_id, "filter_step", StepType::Filter, StructuredMap::new(), |step| {
        step.log_metrics([("filtered_ratio", json!(0.66))].into_iter().collect());
        step.log_sample(CandidateSample::new("C1").rejection_reason("low_rating"));
        step.log_sample(CandidateSample::new("C2").decision("passed"));
    });

    client.end_run(&run_id, [("result", json!("done"))].into_iter().collect());

    if !client.transport().is_enabled() {
        bail!("trace service at {} did not accept the smoke run", args.api_url);
    }
    tracing::info!(run_id = %run_id, "smoke run recorded");
    print_json(out, &json!({ "run_id": run_id }))
}

fn print_json<T: Serialize>(out: &mut impl Write, value: &T) -> Result<()> {
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xray_trace_domain::{RunIngestRequest, StepIngestRequest};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        }
    }

    fn run_to_json(cli: Cli) -> serde_json::Value {
        let mut out = Vec::new();
        must(execute(cli, &mut out));
        match serde_json::from_slice(&out) {
            Ok(value) => value,
            Err(err) => panic!("cli output is not JSON: {err}"),
        }
    }

    fn seeded_db() -> PathBuf {
        let path = std::env::temp_dir().join(format!("xray-cli-{}.sqlite3", ulid::Ulid::new()));
        let api = TraceApi::new(&path);
        must(api.migrate());
        must(api.ingest_run(RunIngestRequest {
            run_id: "run-1".to_string(),
            pipeline_name: Some("competitor_match_pipeline".to_string()),
            input_summary: None,
            outcome_summary: None,
            started_at: Some("2024-05-01T10:00:00Z".to_string()),
            ended_at: None,
            metadata: None,
        }));
        must(api.ingest_step(StepIngestRequest {
            step_id: "step-1".to_string(),
            run_id: "run-1".to_string(),
            step_name: "filter_candidates".to_string(),
            step_type: StepType::Filter,
            input_summary: None,
            output_summary: None,
            metrics: Some([("filtered_ratio", json!(0.9))].into_iter().collect()),
            reasoning: None,
            context: Some([("failure_mode", json!("over_aggressive_filter"))].into_iter().collect()),
            created_at: "2024-05-01T10:00:01Z".to_string(),
            samples: None,
        }));
        path
    }

    #[test]
    fn query_commands_print_service_shaped_json() {
        let db = seeded_db();
        let db_arg = db.display().to_string();

        let runs = run_to_json(parse(&["xray", "--db", &db_arg, "runs"]));
        assert_eq!(runs["results"][0]["run_id"], json!("run-1"));

        let trace = run_to_json(parse(&["xray", "trace", "run-1", "--db", &db_arg]));
        assert_eq!(trace["steps"][0]["step_id"], json!("step-1"));

        let above = run_to_json(parse(&["xray", "--db", &db_arg, "filter-events"]));
        assert_eq!(above["results"].as_array().map(Vec::len), Some(1));

        let weak = run_to_json(parse(&["xray", "--db", &db_arg, "weak-filters", "--ratio-lt", "0.95"]));
        assert_eq!(weak["results"].as_array().map(Vec::len), Some(1));

        let failures = run_to_json(parse(&[
            "xray",
            "--db",
            &db_arg,
            "failures",
            "--mode",
            "over_aggressive_filter",
        ]));
        assert_eq!(failures["count"], json!(1));

        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn defaults_match_service_defaults() {
        match parse(&["xray", "filter-events"]).command {
            Command::FilterEvents { ratio_gt } => assert!((ratio_gt - 0.83).abs() < f64::EPSILON),
            other => panic!("unexpected command: {other:?}"),
        }
        match parse(&["xray", "runs"]).command {
            Command::Runs { limit } => assert_eq!(limit, 10),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn query_against_missing_database_fails_without_creating_it() {
        let path = std::env::temp_dir().join(format!("xray-cli-missing-{}.sqlite3", ulid::Ulid::new()));
        let db_arg = path.display().to_string();
        let mut out = Vec::new();

        let err = match execute(parse(&["xray", "--db", &db_arg, "trace", "run-1"]), &mut out) {
            Ok(()) => panic!("trace against a missing database should fail"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("does not exist"));
        assert!(out.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn smoke_capture_mode_is_parsed_and_validated() {
        match parse(&["xray", "smoke", "--capture-mode", "full"]).command {
            Command::Smoke(args) => assert_eq!(args.capture_mode, CaptureMode::Full),
            other => panic!("unexpected command: {other:?}"),
        }
        match parse(&["xray", "smoke"]).command {
            Command::Smoke(args) => assert_eq!(args.capture_mode, CaptureMode::Sample),
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["xray", "smoke", "--capture-mode", "verbose"]).is_err());
    }

    #[test]
    fn smoke_against_unreachable_service_fails_without_panicking() {
        let cli = parse(&["xray", "smoke", "--api-url", "http://127.0.0.1:1"]);
        let mut out = Vec::new();
        assert!(execute(cli, &mut out).is_err());
        assert!(out.is_empty());
    }
}
