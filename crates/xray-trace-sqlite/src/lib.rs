#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{
    params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior,
};
use xray_trace_core::{StepFilter, TraceStore};
use xray_trace_domain::{
    format_timestamp, merge_run, now_utc, parse_timestamp, CandidateSample, DateTimeUtc, RunId,
    RunRecord, RunUpdate, StepId, StepRecord, StepType, StructuredMap,
};

const TRACE_SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  pipeline_name TEXT NOT NULL,
  input_summary_json TEXT NOT NULL,
  outcome_summary_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  ended_at TEXT,
  metadata_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS steps (
  step_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  step_name TEXT NOT NULL,
  step_type TEXT NOT NULL,
  input_summary_json TEXT NOT NULL,
  output_summary_json TEXT NOT NULL,
  metrics_json TEXT NOT NULL,
  reasoning TEXT,
  context_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS candidate_samples (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  step_id TEXT NOT NULL,
  candidate_id TEXT NOT NULL,
  attributes_json TEXT NOT NULL,
  decision TEXT,
  score REAL,
  rejection_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id);
CREATE INDEX IF NOT EXISTS idx_steps_type ON steps(step_type);
CREATE INDEX IF NOT EXISTS idx_candidate_samples_step ON candidate_samples(step_id, id);

CREATE TRIGGER IF NOT EXISTS trg_candidate_samples_no_update
BEFORE UPDATE ON candidate_samples
BEGIN
  SELECT RAISE(FAIL, 'candidate_samples is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_candidate_samples_no_delete
BEFORE DELETE ON candidate_samples
BEGIN
  SELECT RAISE(FAIL, 'candidate_samples is append-only');
END;
";

const RUN_COLUMNS: &str = "run_id, pipeline_name, input_summary_json, outcome_summary_json,
    started_at, ended_at, metadata_json";

const STEP_COLUMNS: &str = "step_id, run_id, step_name, step_type, input_summary_json,
    output_summary_json, metrics_json, reasoning, context_json, created_at";

pub struct SqliteTraceStore {
    conn: Connection,
}

impl SqliteTraceStore {
    /// Open or create a `SQLite` trace database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open an existing database for reads only. Never creates the file or
    /// applies the schema, and the connection refuses writes.
    ///
    /// # Errors
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_query_only(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("trace database {} does not exist", path.display());
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA query_only = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open the database and apply the schema in one call.
    ///
    /// # Errors
    /// Returns an error if opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    fn immediate(&self) -> Result<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("failed to start trace write transaction")
    }
}

impl TraceStore for SqliteTraceStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply trace schema")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![TRACE_SCHEMA_VERSION, now],
            )
            .context("failed to record trace migration")?;

        tracing::debug!(version = TRACE_SCHEMA_VERSION, "trace schema ready");
        Ok(())
    }

    fn upsert_run(&self, run: &RunRecord) -> Result<()> {
        let tx = self.immediate()?;
        match read_run(&tx, &run.run_id)? {
            Some(existing) => write_merged_run(&tx, &merge_run(&existing, &run.as_update()))?,
            None => insert_run(&tx, run)?,
        }
        tx.commit().context("failed to commit run upsert")?;
        Ok(())
    }

    fn end_run(&self, update: &RunUpdate) -> Result<usize> {
        let tx = self.immediate()?;
        let Some(existing) = read_run(&tx, &update.run_id)? else {
            return Ok(0);
        };
        write_merged_run(&tx, &merge_run(&existing, update))?;
        tx.commit().context("failed to commit run end")?;
        Ok(1)
    }

    fn replace_step(&self, step: &StepRecord) -> Result<()> {
        write_step(&self.conn, step)
    }

    fn append_samples(&self, step_id: &StepId, samples: &[CandidateSample]) -> Result<()> {
        let tx = self.immediate()?;
        insert_samples(&tx, step_id, samples)?;
        tx.commit().context("failed to commit candidate samples")?;
        Ok(())
    }

    fn record_step(&self, step: &StepRecord, samples: &[CandidateSample]) -> Result<()> {
        let tx = self.immediate()?;
        write_step(&tx, step)?;
        insert_samples(&tx, &step.step_id, samples)?;
        tx.commit().context("failed to commit step ingestion")?;
        Ok(())
    }

    fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        read_run(&self.conn, run_id)
    }

    fn get_steps_for_run(&self, run_id: &RunId) -> Result<Vec<StepRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY rowid ASC"
        ))?;
        let rows = stmt.query_map(params![run_id.as_str()], raw_step)?;
        collect_steps(rows)
    }

    fn get_samples_for_step(&self, step_id: &StepId) -> Result<Vec<CandidateSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT candidate_id, attributes_json, decision, score, rejection_reason
             FROM candidate_samples
             WHERE step_id = ?1
             ORDER BY id ASC",
        )?;

        let mut rows = stmt.query(params![step_id.as_str()])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let attributes_json: String = row.get(1)?;
            out.push(CandidateSample {
                candidate_id: row.get(0)?,
                attributes: decode_map("attributes_json", &attributes_json)?,
                decision: row.get(2)?,
                score: row.get(3)?,
                rejection_reason: row.get(4)?,
            });
        }
        Ok(out)
    }

    fn scan_steps(&self, filter: &StepFilter) -> Result<Vec<StepRecord>> {
        match &filter.step_type {
            Some(step_type) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {STEP_COLUMNS} FROM steps WHERE step_type = ?1 ORDER BY rowid ASC"
                ))?;
                let rows = stmt.query_map(params![step_type.as_str()], raw_step)?;
                collect_steps(rows)
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("SELECT {STEP_COLUMNS} FROM steps ORDER BY rowid ASC"))?;
                let rows = stmt.query_map([], raw_step)?;
                collect_steps(rows)
            }
        }
    }

    fn list_recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let limit = i64::try_from(limit).map_err(|_| anyhow!("limit too large for sqlite"))?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], raw_run)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }
}

struct RawRun {
    run_id: String,
    pipeline_name: String,
    input_summary_json: String,
    outcome_summary_json: String,
    started_at: String,
    ended_at: Option<String>,
    metadata_json: String,
}

impl RawRun {
    fn into_record(self) -> Result<RunRecord> {
        Ok(RunRecord {
            run_id: RunId(self.run_id),
            pipeline_name: self.pipeline_name,
            input_summary: decode_map("input_summary_json", &self.input_summary_json)?,
            outcome_summary: decode_map("outcome_summary_json", &self.outcome_summary_json)?,
            started_at: parse_rfc3339("started_at", &self.started_at)?,
            ended_at: self
                .ended_at
                .map(|value| parse_rfc3339("ended_at", &value))
                .transpose()?,
            metadata: decode_map("metadata_json", &self.metadata_json)?,
        })
    }
}

struct RawStep {
    step_id: String,
    run_id: String,
    step_name: String,
    step_type: String,
    input_summary_json: String,
    output_summary_json: String,
    metrics_json: String,
    reasoning: Option<String>,
    context_json: String,
    created_at: String,
}

impl RawStep {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            step_id: StepId(self.step_id),
            run_id: RunId(self.run_id),
            step_name: self.step_name,
            step_type: StepType::parse(&self.step_type),
            input_summary: decode_map("input_summary_json", &self.input_summary_json)?,
            output_summary: decode_map("output_summary_json", &self.output_summary_json)?,
            metrics: decode_map("metrics_json", &self.metrics_json)?,
            reasoning: self.reasoning,
            context: decode_map("context_json", &self.context_json)?,
            created_at: parse_rfc3339("created_at", &self.created_at)?,
        })
    }
}

fn raw_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        input_summary_json: row.get(2)?,
        outcome_summary_json: row.get(3)?,
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        metadata_json: row.get(6)?,
    })
}

fn raw_step(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawStep> {
    Ok(RawStep {
        step_id: row.get(0)?,
        run_id: row.get(1)?,
        step_name: row.get(2)?,
        step_type: row.get(3)?,
        input_summary_json: row.get(4)?,
        output_summary_json: row.get(5)?,
        metrics_json: row.get(6)?,
        reasoning: row.get(7)?,
        context_json: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn read_run(conn: &Connection, run_id: &RunId) -> Result<Option<RunRecord>> {
    let mut stmt = conn.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"))?;
    stmt.query_row(params![run_id.as_str()], raw_run)
        .optional()?
        .map(RawRun::into_record)
        .transpose()
}

fn insert_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO runs({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            run.run_id.as_str(),
            run.pipeline_name,
            encode_map(&run.input_summary)?,
            encode_map(&run.outcome_summary)?,
            rfc3339(run.started_at)?,
            run.ended_at.map(rfc3339).transpose()?,
            encode_map(&run.metadata)?,
        ],
    )
    .context("failed to insert run")?;
    Ok(())
}

fn write_merged_run(conn: &Connection, run: &RunRecord) -> Result<()> {
    conn.execute(
        "UPDATE runs SET outcome_summary_json = ?2, ended_at = ?3 WHERE run_id = ?1",
        params![
            run.run_id.as_str(),
            encode_map(&run.outcome_summary)?,
            run.ended_at.map(rfc3339).transpose()?,
        ],
    )
    .context("failed to update run")?;
    Ok(())
}

fn write_step(conn: &Connection, step: &StepRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO steps({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(step_id) DO UPDATE SET
                run_id = excluded.run_id,
                step_name = excluded.step_name,
                step_type = excluded.step_type,
                input_summary_json = excluded.input_summary_json,
                output_summary_json = excluded.output_summary_json,
                metrics_json = excluded.metrics_json,
                reasoning = excluded.reasoning,
                context_json = excluded.context_json,
                created_at = excluded.created_at"
        ),
        params![
            step.step_id.as_str(),
            step.run_id.as_str(),
            step.step_name,
            step.step_type.as_str(),
            encode_map(&step.input_summary)?,
            encode_map(&step.output_summary)?,
            encode_map(&step.metrics)?,
            step.reasoning,
            encode_map(&step.context)?,
            rfc3339(step.created_at)?,
        ],
    )
    .context("failed to replace step")?;
    Ok(())
}

fn insert_samples(conn: &Connection, step_id: &StepId, samples: &[CandidateSample]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO candidate_samples(
            step_id, candidate_id, attributes_json, decision, score, rejection_reason
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?;
    for sample in samples {
        stmt.execute(params![
            step_id.as_str(),
            sample.candidate_id,
            encode_map(&sample.attributes)?,
            sample.decision,
            sample.score,
            sample.rejection_reason,
        ])
        .context("failed to insert candidate_samples row")?;
    }
    Ok(())
}

/// Rows arrive in insertion order; the stable sort keeps that order for equal
/// `created_at` values.
fn collect_steps(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<RawStep>>,
) -> Result<Vec<StepRecord>> {
    let mut steps = Vec::new();
    for row in rows {
        steps.push(row?.into_record()?);
    }
    steps.sort_by_key(|step| step.created_at);
    Ok(steps)
}

fn encode_map(map: &StructuredMap) -> Result<String> {
    map.to_json_string()
        .context("failed to serialize structured map")
}

fn decode_map(column: &str, raw: &str) -> Result<StructuredMap> {
    StructuredMap::from_json_str(raw).with_context(|| format!("invalid {column}"))
}

// Stored values are already validated; a failure here is corruption, not bad input.
fn rfc3339(value: DateTimeUtc) -> Result<String> {
    format_timestamp(value).map_err(|err| anyhow!("{err}"))
}

fn parse_rfc3339(column: &str, value: &str) -> Result<DateTimeUtc> {
    parse_timestamp(column, value).map_err(|err| anyhow!("stored {err}"))
}
