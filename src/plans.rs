//! Statement templates for the job lifecycle.
//!
//! Every statement is a pure function of the configured schema name. The
//! [`Plans`] set is built once per schema and shared by the manager, the
//! supervisor, and the schema installer; the schema is the only identifier ever
//! interpolated into statement text and it is validated before use.
//!
//! Each statement carries a [`Command`] so an [`Executor`](crate::db::Executor)
//! can tell what it is running without parsing SQL. Parameter layouts are
//! documented on the generating functions and must match the binds made by the
//! callers.

use crate::{
    Result,
    error::RowQueueError,
    job::{COMPLETED_JOB_PREFIX, JobState},
    schedule::MAX_BACKOFF_EXPONENT,
};

/// Version recorded in the `version` table by a fresh install.
pub const SCHEMA_VERSION: &str = "1";

const MAX_SCHEMA_NAME_BYTES: usize = 63;

/// What a statement does, independent of its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Ddl,
    VersionTableExists,
    GetVersion,
    InsertVersion,
    InsertJob,
    FetchNextJob,
    CompleteJobs,
    FailJobs,
    CancelJobs,
    Expire,
    Archive,
    Purge,
    CountStates,
    DeleteQueue,
    DeleteAllQueues,
}

impl Command {
    /// Statements that produce a result set; the others only report affected rows.
    pub fn returns_rows(&self) -> bool {
        matches!(
            self,
            Command::VersionTableExists
                | Command::GetVersion
                | Command::InsertJob
                | Command::FetchNextJob
                | Command::CompleteJobs
                | Command::FailJobs
                | Command::CancelJobs
                | Command::Expire
                | Command::CountStates
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub command: Command,
    pub text: String,
}

impl Statement {
    fn new(command: Command, text: String) -> Self {
        Self { command, text }
    }
}

/// The full statement set for one schema.
#[derive(Debug, Clone)]
pub struct Plans {
    schema: String,
    pub version_table_exists: Statement,
    pub get_version: Statement,
    pub insert_version: Statement,
    pub insert_job: Statement,
    pub fetch_next_job: Statement,
    pub complete_jobs: Statement,
    pub fail_jobs: Statement,
    pub cancel_jobs: Statement,
    pub expire: Statement,
    pub archive: Statement,
    pub purge: Statement,
    pub count_states: Statement,
    pub delete_queue: Statement,
    pub delete_all_queues: Statement,
}

impl Plans {
    pub fn new(schema: &str) -> Result<Self> {
        validate_schema_name(schema)?;

        Ok(Self {
            schema: schema.to_string(),
            version_table_exists: version_table_exists(schema),
            get_version: get_version(schema),
            insert_version: insert_version(schema),
            insert_job: insert_job(schema),
            fetch_next_job: fetch_next_job(schema),
            complete_jobs: complete_jobs(schema),
            fail_jobs: fail_jobs(schema),
            cancel_jobs: cancel_jobs(schema),
            expire: expire(schema),
            archive: archive(schema),
            purge: purge(schema),
            count_states: count_states(schema),
            delete_queue: delete_queue(schema),
            delete_all_queues: delete_all_queues(schema),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// DDL that installs a fresh schema, in execution order.
    pub fn create(&self) -> Vec<Statement> {
        create(&self.schema)
    }
}

/// Checks that `schema` is a plain SQL identifier.
pub fn validate_schema_name(schema: &str) -> Result<()> {
    let mut chars = schema.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid_start || !valid_rest || schema.len() > MAX_SCHEMA_NAME_BYTES {
        return Err(RowQueueError::validation(format!(
            "schema name must match [A-Za-z_][A-Za-z0-9_]* and be at most {} bytes, got {:?}",
            MAX_SCHEMA_NAME_BYTES, schema
        )));
    }
    Ok(())
}

pub fn create(schema: &str) -> Vec<Statement> {
    vec![
        create_schema(schema),
        create_crypto_extension(),
        create_version_table(schema),
        create_job_state_enum(schema),
        create_job_table(schema),
        clone_job_table_for_archive(schema),
        add_archived_on_to_archive(schema),
        add_primary_key_to_archive(schema),
        create_index_job_name(schema),
        create_index_singleton_on(schema),
        create_index_singleton_key_on(schema),
        create_index_singleton_key(schema),
    ]
}

fn ddl(text: String) -> Statement {
    Statement::new(Command::Ddl, text)
}

fn create_schema(schema: &str) -> Statement {
    ddl(format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
}

fn create_crypto_extension() -> Statement {
    ddl("CREATE EXTENSION IF NOT EXISTS pgcrypto".to_string())
}

fn create_version_table(schema: &str) -> Statement {
    ddl(format!(
        "CREATE TABLE {schema}.version (version text primary key)"
    ))
}

fn create_job_state_enum(schema: &str) -> Statement {
    // ordinal comparisons on state depend on this order
    let states = JobState::ALL
        .iter()
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    ddl(format!("CREATE TYPE {schema}.job_state AS ENUM ({states})"))
}

fn create_job_table(schema: &str) -> Statement {
    ddl(format!(
        r#"
        CREATE TABLE {schema}.job (
            id uuid primary key not null default gen_random_uuid(),
            name text not null,
            priority integer not null default(0),
            data jsonb,
            state {schema}.job_state not null default('created'),
            retry_limit integer not null default(0),
            retry_count integer not null default(0),
            retry_delay integer not null default(0),
            retry_backoff boolean not null default false,
            start_after timestamp with time zone not null default now(),
            started_on timestamp with time zone,
            singleton_key text,
            singleton_on timestamp without time zone,
            expire_in interval not null default interval '15 minutes',
            created_on timestamp with time zone not null default now(),
            completed_on timestamp with time zone
        )
        "#
    ))
}

fn clone_job_table_for_archive(schema: &str) -> Statement {
    ddl(format!("CREATE TABLE {schema}.archive (LIKE {schema}.job)"))
}

fn add_archived_on_to_archive(schema: &str) -> Statement {
    ddl(format!(
        "ALTER TABLE {schema}.archive ADD archived_on timestamptz NOT NULL DEFAULT now()"
    ))
}

fn add_primary_key_to_archive(schema: &str) -> Statement {
    ddl(format!("ALTER TABLE {schema}.archive ADD PRIMARY KEY (id)"))
}

fn create_index_job_name(schema: &str) -> Statement {
    ddl(format!(
        "CREATE INDEX job_name ON {schema}.job (name text_pattern_ops)"
    ))
}

// a key without a window: one queued or active job per key
fn create_index_singleton_key(schema: &str) -> Statement {
    ddl(format!(
        "CREATE UNIQUE INDEX job_singleton_key ON {schema}.job (name, singleton_key) \
         WHERE state < 'completed' AND singleton_on IS NULL"
    ))
}

// a window without a key: one queued, active, or completed job per slot
fn create_index_singleton_on(schema: &str) -> Statement {
    ddl(format!(
        "CREATE UNIQUE INDEX job_singleton_on ON {schema}.job (name, singleton_on) \
         WHERE state < 'expired' AND singleton_key IS NULL"
    ))
}

// both: one queued, active, or completed job per key per slot
fn create_index_singleton_key_on(schema: &str) -> Statement {
    ddl(format!(
        "CREATE UNIQUE INDEX job_singleton_key_on ON {schema}.job (name, singleton_on, singleton_key) \
         WHERE state < 'expired'"
    ))
}

/// Returns one row with a nullable `name` column; null when not installed.
pub fn version_table_exists(schema: &str) -> Statement {
    Statement::new(
        Command::VersionTableExists,
        format!("SELECT to_regclass('{schema}.version')::text AS name"),
    )
}

pub fn get_version(schema: &str) -> Statement {
    Statement::new(
        Command::GetVersion,
        format!("SELECT version FROM {schema}.version"),
    )
}

/// Records [`SCHEMA_VERSION`]; runs in the install transaction after the DDL.
pub fn insert_version(schema: &str) -> Statement {
    Statement::new(
        Command::InsertVersion,
        format!("INSERT INTO {schema}.version (version) VALUES ('{SCHEMA_VERSION}')"),
    )
}

/// Columns returned for a job row; `expire_in` is flattened to whole seconds
/// and `state` to its label.
fn job_columns(alias: &str) -> String {
    [
        "id",
        "name",
        "priority",
        "data",
        "retry_limit",
        "retry_count",
        "retry_delay",
        "retry_backoff",
        "start_after",
        "started_on",
        "singleton_key",
        "singleton_on",
        "created_on",
        "completed_on",
    ]
    .iter()
    .map(|column| format!("{alias}.{column}"))
    .chain([
        format!("{alias}.state::text AS state"),
        format!("extract(epoch from {alias}.expire_in)::integer AS expire_in_seconds"),
    ])
    .collect::<Vec<_>>()
    .join(", ")
}

/// Claims up to `$2` eligible jobs whose name matches the LIKE pattern `$1`.
///
/// Rows locked by a concurrent dequeue are skipped rather than waited on. The
/// claimed rows come back in dequeue order.
pub fn fetch_next_job(schema: &str) -> Statement {
    Statement::new(
        Command::FetchNextJob,
        format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM {schema}.job
                WHERE state < 'active'
                  AND name LIKE $1
                  AND start_after < now()
                ORDER BY priority DESC, created_on, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ), claimed AS (
                UPDATE {schema}.job j SET
                    state = 'active',
                    started_on = now(),
                    retry_count = CASE WHEN j.state = 'retry' THEN j.retry_count + 1 ELSE j.retry_count END
                FROM next_job
                WHERE j.id = next_job.id
                RETURNING {columns}
            )
            SELECT * FROM claimed
            ORDER BY priority DESC, created_on, id
            "#,
            columns = job_columns("j"),
        ),
    )
}

/// Inserts a new job, or nothing when a singleton index rejects it.
///
/// `$1` id, `$2` name, `$3` priority, `$4` retry_limit, `$5` absolute
/// start_after (nullable), `$6` start_after delay in seconds (nullable), `$7`
/// expire_in seconds, `$8` data, `$9` singleton_key, `$10` singleton window
/// seconds (nullable), `$11` singleton offset seconds, `$12` retry_delay, `$13`
/// retry_backoff. Returns the id when a row was inserted.
pub fn insert_job(schema: &str) -> Statement {
    Statement::new(
        Command::InsertJob,
        format!(
            r#"
            INSERT INTO {schema}.job (
                id,
                name,
                priority,
                state,
                retry_limit,
                start_after,
                expire_in,
                data,
                singleton_key,
                singleton_on,
                retry_delay,
                retry_backoff
            )
            VALUES (
                $1,
                $2,
                $3,
                'created',
                $4,
                COALESCE($5::timestamptz, now() + COALESCE($6::integer, 0) * interval '1 second'),
                $7::integer * interval '1 second',
                $8::jsonb,
                $9::text,
                CASE
                    WHEN $10::integer IS NOT NULL
                    THEN 'epoch'::timestamp + '1 second'::interval * ($10::integer * floor((date_part('epoch', now()) + $11::integer) / $10::integer))
                    ELSE NULL
                END,
                $12,
                $13
            )
            ON CONFLICT DO NOTHING
            RETURNING id
            "#
        ),
    )
}

fn completion_envelope(response: &str) -> String {
    format!(
        r#"jsonb_build_object(
                    'request', jsonb_build_object('id', id, 'name', name, 'data', data),
                    'response', {response},
                    'state', state,
                    'retryCount', retry_count,
                    'createdOn', created_on,
                    'startedOn', started_on,
                    'completedOn', completed_on,
                    'failed', CASE WHEN state = 'completed' THEN false ELSE true END
                )"#
    )
}

const RETRY_COMPLETED_ON: &str = r#"CASE
                    WHEN retry_count < retry_limit THEN NULL
                    ELSE now()
                END"#;

fn retry_start_after() -> String {
    format!(
        r#"CASE
                    WHEN retry_count = retry_limit THEN start_after
                    WHEN NOT retry_backoff THEN now() + retry_delay * interval '1 second'
                    ELSE now() + (
                        retry_delay * 2 ^ LEAST({max}, retry_count + 1) / 2
                        + retry_delay * 2 ^ LEAST({max}, retry_count + 1) / 2 * random()
                    ) * interval '1 second'
                END"#,
        max = MAX_BACKOFF_EXPONENT
    )
}

/// Completes the active jobs among `$1` (uuid[]) with response `$2` (jsonb).
///
/// Returns the ids of transitioned rows and fans out one completion event per
/// row that is not itself a completion event.
pub fn complete_jobs(schema: &str) -> Statement {
    Statement::new(
        Command::CompleteJobs,
        format!(
            r#"
            WITH results AS (
                UPDATE {schema}.job
                SET completed_on = now(),
                    state = 'completed'
                WHERE id IN (SELECT UNNEST($1::uuid[]))
                  AND state = 'active'
                RETURNING *
            ), completion_jobs AS (
                INSERT INTO {schema}.job (name, data)
                SELECT
                    '{prefix}' || name,
                    {envelope}
                FROM results
                WHERE NOT starts_with(name, '{prefix}')
            )
            SELECT id FROM results
            "#,
            prefix = COMPLETED_JOB_PREFIX,
            envelope = completion_envelope("$2::jsonb"),
        ),
    )
}

/// Fails the unfinished jobs among `$1` (uuid[]) with response `$2` (jsonb).
///
/// Jobs with retries left move to `retry`; the rest become `failed` and fan out
/// a completion event.
pub fn fail_jobs(schema: &str) -> Statement {
    Statement::new(
        Command::FailJobs,
        format!(
            r#"
            WITH results AS (
                UPDATE {schema}.job
                SET state = CASE
                        WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state
                        ELSE 'failed'::{schema}.job_state
                    END,
                    completed_on = {completed_on},
                    start_after = {start_after}
                WHERE id IN (SELECT UNNEST($1::uuid[]))
                  AND state < 'completed'
                RETURNING *
            ), completion_jobs AS (
                INSERT INTO {schema}.job (name, data)
                SELECT
                    '{prefix}' || name,
                    {envelope}
                FROM results
                WHERE state = 'failed'
                  AND NOT starts_with(name, '{prefix}')
            )
            SELECT id FROM results
            "#,
            completed_on = RETRY_COMPLETED_ON,
            start_after = retry_start_after(),
            prefix = COMPLETED_JOB_PREFIX,
            envelope = completion_envelope("$2::jsonb"),
        ),
    )
}

/// Reclaims active jobs that outlived `expire_in`, using the retry rules.
pub fn expire(schema: &str) -> Statement {
    Statement::new(
        Command::Expire,
        format!(
            r#"
            WITH results AS (
                UPDATE {schema}.job
                SET state = CASE
                        WHEN retry_count < retry_limit THEN 'retry'::{schema}.job_state
                        ELSE 'expired'::{schema}.job_state
                    END,
                    completed_on = {completed_on},
                    start_after = {start_after}
                WHERE state = 'active'
                  AND (started_on + expire_in) < now()
                RETURNING *
            ), completion_jobs AS (
                INSERT INTO {schema}.job (name, data)
                SELECT
                    '{prefix}' || name,
                    {envelope}
                FROM results
                WHERE state = 'expired'
                  AND NOT starts_with(name, '{prefix}')
            )
            SELECT id FROM results
            "#,
            completed_on = RETRY_COMPLETED_ON,
            start_after = retry_start_after(),
            prefix = COMPLETED_JOB_PREFIX,
            envelope = completion_envelope("NULL::jsonb"),
        ),
    )
}

/// Cancels the unfinished jobs among `$1` (uuid[]); returns their ids.
pub fn cancel_jobs(schema: &str) -> Statement {
    Statement::new(
        Command::CancelJobs,
        format!(
            r#"
            UPDATE {schema}.job
            SET completed_on = now(),
                state = 'cancelled'
            WHERE id IN (SELECT UNNEST($1::uuid[]))
              AND state < 'completed'
            RETURNING id
            "#
        ),
    )
}

/// Moves finished jobs, and completion events nobody consumed, older than `$1`
/// seconds into the archive.
pub fn archive(schema: &str) -> Statement {
    const COLUMNS: &str = "id, name, priority, data, state, retry_limit, retry_count, retry_delay, \
                           retry_backoff, start_after, started_on, singleton_key, singleton_on, \
                           expire_in, created_on, completed_on";
    Statement::new(
        Command::Archive,
        format!(
            r#"
            WITH archived_rows AS (
                DELETE FROM {schema}.job
                WHERE completed_on + $1::integer * interval '1 second' < now()
                   OR (
                        state = 'created'
                        AND starts_with(name, '{prefix}')
                        AND created_on + $1::integer * interval '1 second' < now()
                   )
                RETURNING *
            )
            INSERT INTO {schema}.archive ({COLUMNS})
            SELECT {COLUMNS}
            FROM archived_rows
            "#,
            prefix = COMPLETED_JOB_PREFIX,
        ),
    )
}

/// Deletes archived rows older than `$1` seconds.
pub fn purge(schema: &str) -> Statement {
    Statement::new(
        Command::Purge,
        format!(
            "DELETE FROM {schema}.archive WHERE archived_on + $1::integer * interval '1 second' < now()"
        ),
    )
}

/// Job counts by name and state with rollup totals; null columns mark totals.
pub fn count_states(schema: &str) -> Statement {
    Statement::new(
        Command::CountStates,
        format!(
            r#"
            SELECT name, state::text AS state, count(*)::bigint AS size
            FROM {schema}.job
            WHERE NOT starts_with(name, '{prefix}')
            GROUP BY ROLLUP(name), ROLLUP(state)
            "#,
            prefix = COMPLETED_JOB_PREFIX,
        ),
    )
}

/// `$1` queue name.
pub fn delete_queue(schema: &str) -> Statement {
    Statement::new(
        Command::DeleteQueue,
        format!("DELETE FROM {schema}.job WHERE name = $1"),
    )
}

pub fn delete_all_queues(schema: &str) -> Statement {
    Statement::new(
        Command::DeleteAllQueues,
        format!("TRUNCATE {schema}.job"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_name_validation() {
        assert!(validate_schema_name("rowqueue").is_ok());
        assert!(validate_schema_name("_jobs_2").is_ok());
        assert!(validate_schema_name("").is_err());
        assert!(validate_schema_name("2jobs").is_err());
        assert!(validate_schema_name("jobs; DROP TABLE users").is_err());
        assert!(validate_schema_name("public.job").is_err());
        assert!(validate_schema_name(&"a".repeat(64)).is_err());
        assert!(Plans::new("bad-name").is_err());
    }

    #[test]
    fn test_plans_are_scoped_to_schema() {
        let plans = Plans::new("jobs").unwrap();
        assert_eq!(plans.schema(), "jobs");
        assert!(plans.insert_job.text.contains("INSERT INTO jobs.job"));
        assert!(plans.fetch_next_job.text.contains("FROM jobs.job"));
        assert!(plans.purge.text.contains("jobs.archive"));
        assert_eq!(plans.fetch_next_job.command, Command::FetchNextJob);
        assert_eq!(plans.delete_all_queues.text, "TRUNCATE jobs.job");
    }

    #[test]
    fn test_state_enum_declares_ordinal_order() {
        let create = create("jobs");
        let enum_ddl = create
            .iter()
            .find(|s| s.text.contains("CREATE TYPE"))
            .unwrap();
        assert!(enum_ddl.text.contains(
            "('created', 'retry', 'active', 'completed', 'expired', 'cancelled', 'failed')"
        ));
    }

    #[test]
    fn test_create_order_and_singleton_indices() {
        let statements = create("jobs");
        assert!(statements.iter().all(|s| s.command == Command::Ddl));
        assert!(statements[0].text.contains("CREATE SCHEMA IF NOT EXISTS jobs"));

        let position = |needle: &str| statements.iter().position(|s| s.text.contains(needle)).unwrap();
        assert!(position("CREATE TYPE") < position("CREATE TABLE jobs.job"));
        assert!(position("CREATE TABLE jobs.job") < position("CREATE TABLE jobs.archive"));

        let unique: Vec<_> = statements
            .iter()
            .filter(|s| s.text.contains("CREATE UNIQUE INDEX"))
            .collect();
        assert_eq!(unique.len(), 3);
        assert!(unique.iter().any(|s| s.text.contains("state < 'completed' AND singleton_on IS NULL")));
        assert!(unique.iter().any(|s| s.text.contains("state < 'expired' AND singleton_key IS NULL")));
    }

    #[test]
    fn test_dequeue_uses_skip_locked_and_deterministic_order() {
        let text = fetch_next_job("jobs").text;
        assert!(text.contains("FOR UPDATE SKIP LOCKED"));
        assert!(text.contains("ORDER BY priority DESC, created_on, id"));
        assert!(text.contains("WHEN j.state = 'retry' THEN j.retry_count + 1"));
        assert!(text.contains("expire_in_seconds"));
    }

    #[test]
    fn test_backoff_cap_is_interpolated() {
        let text = fail_jobs("jobs").text;
        assert!(text.contains(&format!("LEAST({}, retry_count + 1)", MAX_BACKOFF_EXPONENT)));
        assert!(expire("jobs").text.contains("'expired'::jobs.job_state"));
    }

    #[test]
    fn test_completion_fan_out_skips_completion_jobs() {
        for statement in [complete_jobs("jobs"), fail_jobs("jobs"), expire("jobs")] {
            assert!(statement
                .text
                .contains(&format!("NOT starts_with(name, '{}')", COMPLETED_JOB_PREFIX)));
            assert!(statement.text.contains("'retryCount', retry_count"));
            assert!(statement.command.returns_rows());
        }
        assert!(complete_jobs("jobs").text.contains("'response', $2::jsonb"));
        assert!(expire("jobs").text.contains("'response', NULL::jsonb"));
    }

    #[test]
    fn test_row_returning_commands() {
        assert!(Command::InsertJob.returns_rows());
        assert!(Command::CancelJobs.returns_rows());
        assert!(!Command::Archive.returns_rows());
        assert!(!Command::Purge.returns_rows());
        assert!(!Command::Ddl.returns_rows());
    }
}
