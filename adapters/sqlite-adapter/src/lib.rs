//! sqlite-adapter: relational implementation of the `StudyStorage` port.
//!
//! Purpose
//! - Provide a file-based storage that several processes can share through
//!   SQLite's own locking.
//! - Implements `StudyStorage` and `HeartbeatStorage` from the `domain` crate.
//! - [`CachedStorage`] wraps [`RdbStorage`] with a read cache for finished
//!   trials, which never change once written.
//!
//! Notes
//! - Uses `rusqlite` with the `bundled` feature for portability.
//! - Connection URLs have the form `sqlite:///{path}`; `sqlite:///:memory:`
//!   opens a private in-memory database.
//! - Datetimes are stored through `rusqlite`'s chrono support, attribute
//!   values and distributions as JSON text.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::validate::{
    ensure_unfinished, generate_study_name, validate_directions, validate_heartbeat,
    validate_intermediate_value, validate_param, validate_study_name, validate_values,
};
use domain::{
    Attrs, Clock, CoreError, Distribution, FrozenStudy, FrozenTrial, HeartbeatStorage,
    StudyDirection, StudyId, StudyStorage, SystemClock, TrialId, TrialState,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

mod cached;

pub use cached::CachedStorage;

/// Settings applied to the underlying SQLite connection.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// How long a statement waits on a locked database before failing.
    pub connect_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Options accepted by [`RdbStorage::new`].
#[derive(Clone, Debug, Default)]
pub struct RdbOptions {
    pub engine: EngineOptions,
    /// Seconds between heartbeats of a running trial; `None` disables them.
    pub heartbeat_interval: Option<u64>,
    /// Seconds without a heartbeat before a running trial counts as stale.
    /// Defaults to twice the interval.
    pub grace_period: Option<u64>,
}

/// SQLite-backed study storage.
pub struct RdbStorage {
    url: String,
    conn: Mutex<Connection>,
    heartbeat_interval: Option<u64>,
    grace_period: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl RdbStorage {
    /// Open (or create) the database the URL points at and ensure schema.
    pub fn new(url: &str, options: RdbOptions) -> Result<Self, CoreError> {
        validate_heartbeat(options.heartbeat_interval, options.grace_period)?;
        let path = sqlite_path_from_url(url)?;
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(map_sqerr)?;
        conn.busy_timeout(options.engine.connect_timeout)
            .map_err(map_sqerr)?;
        init_schema(&conn)?;
        tracing::debug!(%url, "opened relational storage");
        Ok(Self {
            url: url.to_string(),
            conn: Mutex::new(conn),
            heartbeat_interval: options.heartbeat_interval,
            grace_period: options.grace_period,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source used for trial datetimes and heartbeats.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("mutex poisoned".into()))
    }

    /// Trials of a study except the ids in `excluded`, ordered by number.
    pub fn get_trials_excluding(
        &self,
        study_id: StudyId,
        excluded: &BTreeSet<TrialId>,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        let ids: Vec<i64> = excluded.iter().map(|t| t.0).collect();
        let ids = serde_json::to_string(&ids)?;
        let trials = load_trials(&conn, &Scope::StudyExcluding(study_id, ids))?;
        Ok(filter_states(trials, states))
    }
}

fn sqlite_path_from_url(url: &str) -> Result<&str, CoreError> {
    url.strip_prefix("sqlite:///")
        .filter(|p| !p.is_empty())
        .ok_or_else(|| CoreError::InvalidArgument(format!("unsupported database url: {url}")))
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        CREATE TABLE IF NOT EXISTS studies (
            study_id INTEGER PRIMARY KEY AUTOINCREMENT,
            study_name TEXT NOT NULL UNIQUE
        );
        CREATE TABLE IF NOT EXISTS study_directions (
            study_id INTEGER NOT NULL REFERENCES studies(study_id) ON DELETE CASCADE,
            objective INTEGER NOT NULL,
            direction TEXT NOT NULL,
            PRIMARY KEY (study_id, objective)
        );
        CREATE TABLE IF NOT EXISTS study_user_attributes (
            study_id INTEGER NOT NULL REFERENCES studies(study_id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (study_id, key)
        );
        CREATE TABLE IF NOT EXISTS study_system_attributes (
            study_id INTEGER NOT NULL REFERENCES studies(study_id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (study_id, key)
        );
        CREATE TABLE IF NOT EXISTS trials (
            trial_id INTEGER PRIMARY KEY AUTOINCREMENT,
            number INTEGER NOT NULL,
            study_id INTEGER NOT NULL REFERENCES studies(study_id) ON DELETE CASCADE,
            state TEXT NOT NULL,
            datetime_start TEXT,
            datetime_complete TEXT,
            UNIQUE (study_id, number)
        );
        CREATE INDEX IF NOT EXISTS idx_trials_study ON trials(study_id);
        CREATE TABLE IF NOT EXISTS trial_params (
            trial_id INTEGER NOT NULL REFERENCES trials(trial_id) ON DELETE CASCADE,
            param_name TEXT NOT NULL,
            param_value REAL NOT NULL,
            distribution_json TEXT NOT NULL,
            PRIMARY KEY (trial_id, param_name)
        );
        CREATE TABLE IF NOT EXISTS trial_values (
            trial_id INTEGER NOT NULL REFERENCES trials(trial_id) ON DELETE CASCADE,
            objective INTEGER NOT NULL,
            value REAL NOT NULL,
            PRIMARY KEY (trial_id, objective)
        );
        CREATE TABLE IF NOT EXISTS trial_intermediate_values (
            trial_id INTEGER NOT NULL REFERENCES trials(trial_id) ON DELETE CASCADE,
            step INTEGER NOT NULL,
            value REAL NOT NULL,
            PRIMARY KEY (trial_id, step)
        );
        CREATE TABLE IF NOT EXISTS trial_user_attributes (
            trial_id INTEGER NOT NULL REFERENCES trials(trial_id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (trial_id, key)
        );
        CREATE TABLE IF NOT EXISTS trial_system_attributes (
            trial_id INTEGER NOT NULL REFERENCES trials(trial_id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value_json TEXT NOT NULL,
            PRIMARY KEY (trial_id, key)
        );
        CREATE TABLE IF NOT EXISTS trial_heartbeats (
            trial_id INTEGER PRIMARY KEY REFERENCES trials(trial_id) ON DELETE CASCADE,
            heartbeat TEXT NOT NULL
        );
        "#,
    )
    .map_err(map_sqerr)
}

fn map_sqerr<E: std::fmt::Display>(e: E) -> CoreError {
    CoreError::Repository(format!("sqlite error: {e}"))
}

fn ensure_study(conn: &Connection, study_id: StudyId) -> Result<(), CoreError> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT study_id FROM studies WHERE study_id = ?1",
            params![study_id.0],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqerr)?;
    found
        .map(|_| ())
        .ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
}

/// Owning study and current state of a trial.
fn trial_header(conn: &Connection, trial_id: TrialId) -> Result<(StudyId, TrialState), CoreError> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT study_id, state FROM trials WHERE trial_id = ?1",
            params![trial_id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(map_sqerr)?;
    let (study_id, state) = row.ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))?;
    Ok((StudyId(study_id), parse_state(&state)?))
}

fn unfinished_trial_study(conn: &Connection, trial_id: TrialId) -> Result<StudyId, CoreError> {
    let (study_id, state) = trial_header(conn, trial_id)?;
    ensure_unfinished(trial_id, state)?;
    Ok(study_id)
}

fn parse_state(s: &str) -> Result<TrialState, CoreError> {
    TrialState::parse(s).ok_or_else(|| CoreError::Repository(format!("bad trial state in db: {s}")))
}

fn load_directions(conn: &Connection, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
    let mut stmt = conn
        .prepare("SELECT direction FROM study_directions WHERE study_id = ?1 ORDER BY objective")
        .map_err(map_sqerr)?;
    let mut rows = stmt.query(params![study_id.0]).map_err(map_sqerr)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        let s: String = row.get(0).map_err(map_sqerr)?;
        let d = StudyDirection::parse(&s)
            .ok_or_else(|| CoreError::Repository(format!("bad direction in db: {s}")))?;
        out.push(d);
    }
    Ok(out)
}

/// `table` is one of the `*_attributes` tables, keyed by `owner_column`.
fn load_attrs(
    conn: &Connection,
    table: &str,
    owner_column: &str,
    owner_id: i64,
) -> Result<Attrs, CoreError> {
    let sql = format!("SELECT key, value_json FROM {table} WHERE {owner_column} = ?1");
    let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
    let mut rows = stmt.query(params![owner_id]).map_err(map_sqerr)?;
    let mut out = Attrs::new();
    while let Some(row) = rows.next().map_err(map_sqerr)? {
        let key: String = row.get(0).map_err(map_sqerr)?;
        let json: String = row.get(1).map_err(map_sqerr)?;
        out.insert(key, serde_json::from_str(&json)?);
    }
    Ok(out)
}

fn upsert_attr(
    conn: &Connection,
    table: &str,
    owner_column: &str,
    owner_id: i64,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), CoreError> {
    let sql = format!(
        "INSERT INTO {table}({owner_column}, key, value_json) VALUES (?1, ?2, ?3) \
         ON CONFLICT({owner_column}, key) DO UPDATE SET value_json = excluded.value_json"
    );
    conn.execute(&sql, params![owner_id, key, serde_json::to_string(value)?])
        .map_err(map_sqerr)?;
    Ok(())
}

fn load_study(conn: &Connection, study_id: StudyId, study_name: String) -> Result<FrozenStudy, CoreError> {
    Ok(FrozenStudy {
        study_id,
        study_name,
        directions: load_directions(conn, study_id)?,
        user_attrs: load_attrs(conn, "study_user_attributes", "study_id", study_id.0)?,
        system_attrs: load_attrs(conn, "study_system_attributes", "study_id", study_id.0)?,
    })
}

/// Which trials a bulk load covers.
enum Scope {
    Study(StudyId),
    /// Study trials minus a JSON array of trial ids.
    StudyExcluding(StudyId, String),
    Trial(TrialId),
}

impl Scope {
    fn filter(&self) -> (&'static str, Vec<SqlValue>) {
        match self {
            Scope::Study(id) => ("t.study_id = ?1", vec![SqlValue::Integer(id.0)]),
            Scope::StudyExcluding(id, ids) => (
                "t.study_id = ?1 AND t.trial_id NOT IN (SELECT value FROM json_each(?2))",
                vec![SqlValue::Integer(id.0), SqlValue::Text(ids.clone())],
            ),
            Scope::Trial(id) => ("t.trial_id = ?1", vec![SqlValue::Integer(id.0)]),
        }
    }
}

fn load_trials(conn: &Connection, scope: &Scope) -> Result<Vec<FrozenTrial>, CoreError> {
    let (filter, args) = scope.filter();
    let mut trials: BTreeMap<i64, FrozenTrial> = BTreeMap::new();
    {
        let sql = format!(
            "SELECT t.trial_id, t.number, t.state, t.datetime_start, t.datetime_complete \
             FROM trials t WHERE {filter}"
        );
        let mut stmt = conn.prepare(&sql).map_err(map_sqerr)?;
        let mut rows = stmt.query(params_from_iter(args.iter())).map_err(map_sqerr)?;
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            let trial_id: i64 = row.get(0).map_err(map_sqerr)?;
            let number: i64 = row.get(1).map_err(map_sqerr)?;
            let state: String = row.get(2).map_err(map_sqerr)?;
            let datetime_start: Option<DateTime<Utc>> = row.get(3).map_err(map_sqerr)?;
            let datetime_complete: Option<DateTime<Utc>> = row.get(4).map_err(map_sqerr)?;
            trials.insert(
                trial_id,
                FrozenTrial {
                    trial_id: TrialId(trial_id),
                    number: number as u64,
                    state: parse_state(&state)?,
                    values: None,
                    datetime_start,
                    datetime_complete,
                    params: BTreeMap::new(),
                    distributions: BTreeMap::new(),
                    user_attrs: Attrs::new(),
                    system_attrs: Attrs::new(),
                    intermediate_values: BTreeMap::new(),
                },
            );
        }
    }
    if trials.is_empty() {
        return Ok(Vec::new());
    }

    let children = Children {
        conn,
        filter,
        args: &args,
    };
    children.for_each(
        &mut trials,
        "trial_params",
        "c.param_name, c.param_value, c.distribution_json",
        "c.param_name",
        |trial, row| {
            let name: String = row.get(1).map_err(map_sqerr)?;
            let value: f64 = row.get(2).map_err(map_sqerr)?;
            let json: String = row.get(3).map_err(map_sqerr)?;
            let distribution: Distribution = serde_json::from_str(&json)?;
            trial.params.insert(name.clone(), value);
            trial.distributions.insert(name, distribution);
            Ok(())
        },
    )?;
    children.for_each(
        &mut trials,
        "trial_values",
        "c.value",
        "c.objective",
        |trial, row| {
            let value: f64 = row.get(1).map_err(map_sqerr)?;
            trial.values.get_or_insert_with(Vec::new).push(value);
            Ok(())
        },
    )?;
    children.for_each(
        &mut trials,
        "trial_intermediate_values",
        "c.step, c.value",
        "c.step",
        |trial, row| {
            let step: i64 = row.get(1).map_err(map_sqerr)?;
            let value: f64 = row.get(2).map_err(map_sqerr)?;
            trial.intermediate_values.insert(step as u64, value);
            Ok(())
        },
    )?;
    for (table, system) in [
        ("trial_user_attributes", false),
        ("trial_system_attributes", true),
    ] {
        children.for_each(&mut trials, table, "c.key, c.value_json", "c.key", |trial, row| {
            let key: String = row.get(1).map_err(map_sqerr)?;
            let json: String = row.get(2).map_err(map_sqerr)?;
            let attrs = if system {
                &mut trial.system_attrs
            } else {
                &mut trial.user_attrs
            };
            attrs.insert(key, serde_json::from_str(&json)?);
            Ok(())
        })?;
    }

    let mut out: Vec<_> = trials.into_values().collect();
    out.sort_by_key(|t| t.number);
    Ok(out)
}

/// Loads rows of a per-trial child table for every trial in a scope.
struct Children<'a> {
    conn: &'a Connection,
    filter: &'a str,
    args: &'a [SqlValue],
}

impl Children<'_> {
    fn for_each<F>(
        &self,
        trials: &mut BTreeMap<i64, FrozenTrial>,
        table: &str,
        columns: &str,
        order_by: &str,
        mut apply: F,
    ) -> Result<(), CoreError>
    where
        F: FnMut(&mut FrozenTrial, &rusqlite::Row<'_>) -> Result<(), CoreError>,
    {
        let sql = format!(
            "SELECT c.trial_id, {columns} FROM {table} c JOIN trials t ON t.trial_id = c.trial_id \
             WHERE {} ORDER BY c.trial_id, {order_by}",
            self.filter
        );
        let mut stmt = self.conn.prepare(&sql).map_err(map_sqerr)?;
        let mut rows = stmt
            .query(params_from_iter(self.args.iter()))
            .map_err(map_sqerr)?;
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            let trial_id: i64 = row.get(0).map_err(map_sqerr)?;
            if let Some(trial) = trials.get_mut(&trial_id) {
                apply(trial, row)?;
            }
        }
        Ok(())
    }
}

fn filter_states(trials: Vec<FrozenTrial>, states: Option<&[TrialState]>) -> Vec<FrozenTrial> {
    match states {
        Some(states) => trials
            .into_iter()
            .filter(|t| states.contains(&t.state))
            .collect(),
        None => trials,
    }
}

fn insert_trial_records(conn: &Connection, trial_id: i64, trial: &FrozenTrial) -> Result<(), CoreError> {
    for (name, value) in &trial.params {
        let Some(distribution) = trial.distributions.get(name) else {
            continue;
        };
        conn.execute(
            "INSERT INTO trial_params(trial_id, param_name, param_value, distribution_json) VALUES (?1, ?2, ?3, ?4)",
            params![trial_id, name, value, serde_json::to_string(distribution)?],
        )
        .map_err(map_sqerr)?;
    }
    if let Some(values) = &trial.values {
        for (objective, value) in values.iter().enumerate() {
            conn.execute(
                "INSERT INTO trial_values(trial_id, objective, value) VALUES (?1, ?2, ?3)",
                params![trial_id, objective as i64, value],
            )
            .map_err(map_sqerr)?;
        }
    }
    for (step, value) in &trial.intermediate_values {
        conn.execute(
            "INSERT INTO trial_intermediate_values(trial_id, step, value) VALUES (?1, ?2, ?3)",
            params![trial_id, *step as i64, value],
        )
        .map_err(map_sqerr)?;
    }
    for (key, value) in &trial.user_attrs {
        upsert_attr(conn, "trial_user_attributes", "trial_id", trial_id, key, value)?;
    }
    for (key, value) in &trial.system_attrs {
        upsert_attr(conn, "trial_system_attributes", "trial_id", trial_id, key, value)?;
    }
    Ok(())
}

impl StudyStorage for RdbStorage {
    fn create_new_study(
        &self,
        directions: &[StudyDirection],
        study_name: Option<&str>,
    ) -> Result<StudyId, CoreError> {
        validate_directions(directions)?;
        let name = match study_name {
            Some(n) => {
                validate_study_name(n)?;
                n.to_string()
            }
            None => generate_study_name(),
        };
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let res = tx.execute(
            "INSERT INTO studies(study_name) VALUES (?1)",
            params![name],
        );
        if let Err(e) = res {
            if let rusqlite::Error::SqliteFailure(err, _) = &e {
                if err.code == rusqlite::ErrorCode::ConstraintViolation {
                    return Err(CoreError::DuplicatedStudy(name));
                }
            }
            return Err(map_sqerr(e));
        }
        let study_id = tx.last_insert_rowid();
        for (objective, direction) in directions.iter().enumerate() {
            tx.execute(
                "INSERT INTO study_directions(study_id, objective, direction) VALUES (?1, ?2, ?3)",
                params![study_id, objective as i64, direction.as_str()],
            )
            .map_err(map_sqerr)?;
        }
        tx.commit().map_err(map_sqerr)?;
        Ok(StudyId(study_id))
    }

    fn delete_study(&self, study_id: StudyId) -> Result<(), CoreError> {
        let conn = self.conn()?;
        let changed = conn
            .execute("DELETE FROM studies WHERE study_id = ?1", params![study_id.0])
            .map_err(map_sqerr)?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("study {study_id}")));
        }
        Ok(())
    }

    fn set_study_user_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        upsert_attr(&conn, "study_user_attributes", "study_id", study_id.0, key, &value)
    }

    fn set_study_system_attr(
        &self,
        study_id: StudyId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        upsert_attr(&conn, "study_system_attributes", "study_id", study_id.0, key, &value)
    }

    fn get_study_id_from_name(&self, study_name: &str) -> Result<StudyId, CoreError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT study_id FROM studies WHERE study_name = ?1",
                params![study_name],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        found
            .map(StudyId)
            .ok_or_else(|| CoreError::NotFound(format!("study named {study_name}")))
    }

    fn get_study_name_from_id(&self, study_id: StudyId) -> Result<String, CoreError> {
        let conn = self.conn()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT study_name FROM studies WHERE study_id = ?1",
                params![study_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        found.ok_or_else(|| CoreError::NotFound(format!("study {study_id}")))
    }

    fn get_study_directions(&self, study_id: StudyId) -> Result<Vec<StudyDirection>, CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        load_directions(&conn, study_id)
    }

    fn get_study_user_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        load_attrs(&conn, "study_user_attributes", "study_id", study_id.0)
    }

    fn get_study_system_attrs(&self, study_id: StudyId) -> Result<Attrs, CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        load_attrs(&conn, "study_system_attributes", "study_id", study_id.0)
    }

    fn get_all_studies(&self) -> Result<Vec<FrozenStudy>, CoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT study_id, study_name FROM studies ORDER BY study_id")
            .map_err(map_sqerr)?;
        let mut rows = stmt.query([]).map_err(map_sqerr)?;
        let mut heads = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            let id: i64 = row.get(0).map_err(map_sqerr)?;
            let name: String = row.get(1).map_err(map_sqerr)?;
            heads.push((StudyId(id), name));
        }
        heads
            .into_iter()
            .map(|(id, name)| load_study(&conn, id, name))
            .collect()
    }

    fn create_new_trial(
        &self,
        study_id: StudyId,
        template: Option<&FrozenTrial>,
    ) -> Result<TrialId, CoreError> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        ensure_study(&tx, study_id)?;
        let number: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM trials WHERE study_id = ?1",
                params![study_id.0],
                |row| row.get(0),
            )
            .map_err(map_sqerr)?;
        let (state, datetime_start, datetime_complete) = match template {
            Some(t) => (t.state, t.datetime_start, t.datetime_complete),
            None => (TrialState::Running, Some(now), None),
        };
        tx.execute(
            "INSERT INTO trials(number, study_id, state, datetime_start, datetime_complete) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![number, study_id.0, state.as_str(), datetime_start, datetime_complete],
        )
        .map_err(map_sqerr)?;
        let trial_id = tx.last_insert_rowid();
        if let Some(t) = template {
            insert_trial_records(&tx, trial_id, t)?;
        }
        tx.commit().map_err(map_sqerr)?;
        Ok(TrialId(trial_id))
    }

    fn set_trial_param(
        &self,
        trial_id: TrialId,
        name: &str,
        internal_value: f64,
        distribution: &Distribution,
    ) -> Result<(), CoreError> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let study_id = unfinished_trial_study(&tx, trial_id)?;
        let recorded: Option<String> = tx
            .query_row(
                "SELECT p.distribution_json FROM trial_params p JOIN trials t ON t.trial_id = p.trial_id \
                 WHERE t.study_id = ?1 AND p.param_name = ?2 LIMIT 1",
                params![study_id.0, name],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        let recorded: Option<Distribution> = recorded
            .map(|json| serde_json::from_str(&json))
            .transpose()?;
        validate_param(name, internal_value, distribution, recorded.as_ref())?;
        tx.execute(
            "INSERT INTO trial_params(trial_id, param_name, param_value, distribution_json) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(trial_id, param_name) DO UPDATE SET param_value = excluded.param_value, \
             distribution_json = excluded.distribution_json",
            params![trial_id.0, name, internal_value, serde_json::to_string(distribution)?],
        )
        .map_err(map_sqerr)?;
        tx.commit().map_err(map_sqerr)?;
        Ok(())
    }

    fn get_trial_id_from_study_id_trial_number(
        &self,
        study_id: StudyId,
        number: u64,
    ) -> Result<TrialId, CoreError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT trial_id FROM trials WHERE study_id = ?1 AND number = ?2",
                params![study_id.0, number as i64],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqerr)?;
        found.map(TrialId).ok_or_else(|| {
            CoreError::NotFound(format!("trial number {number} in study {study_id}"))
        })
    }

    fn set_trial_state_values(
        &self,
        trial_id: TrialId,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool, CoreError> {
        let now = self.clock.now();
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqerr)?;
        let (study_id, current) = trial_header(&tx, trial_id)?;
        if let Some(values) = values {
            validate_values(values, load_directions(&tx, study_id)?.len())?;
        }
        ensure_unfinished(trial_id, current)?;
        if state == TrialState::Running && current != TrialState::Waiting {
            return Ok(false);
        }
        let updated = if state == TrialState::Running {
            tx.execute(
                "UPDATE trials SET state = ?1, datetime_start = ?2 WHERE trial_id = ?3",
                params![state.as_str(), now, trial_id.0],
            )
        } else if state.is_finished() {
            tx.execute(
                "UPDATE trials SET state = ?1, datetime_complete = ?2 WHERE trial_id = ?3",
                params![state.as_str(), now, trial_id.0],
            )
        } else {
            tx.execute(
                "UPDATE trials SET state = ?1 WHERE trial_id = ?2",
                params![state.as_str(), trial_id.0],
            )
        };
        updated.map_err(map_sqerr)?;
        if let Some(values) = values {
            tx.execute("DELETE FROM trial_values WHERE trial_id = ?1", params![trial_id.0])
                .map_err(map_sqerr)?;
            for (objective, value) in values.iter().enumerate() {
                tx.execute(
                    "INSERT INTO trial_values(trial_id, objective, value) VALUES (?1, ?2, ?3)",
                    params![trial_id.0, objective as i64, value],
                )
                .map_err(map_sqerr)?;
            }
        }
        tx.commit().map_err(map_sqerr)?;
        Ok(true)
    }

    fn set_trial_intermediate_value(
        &self,
        trial_id: TrialId,
        step: u64,
        value: f64,
    ) -> Result<(), CoreError> {
        validate_intermediate_value(value)?;
        let conn = self.conn()?;
        unfinished_trial_study(&conn, trial_id)?;
        conn.execute(
            "INSERT INTO trial_intermediate_values(trial_id, step, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(trial_id, step) DO UPDATE SET value = excluded.value",
            params![trial_id.0, step as i64, value],
        )
        .map_err(map_sqerr)?;
        Ok(())
    }

    fn set_trial_user_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        unfinished_trial_study(&conn, trial_id)?;
        upsert_attr(&conn, "trial_user_attributes", "trial_id", trial_id.0, key, &value)
    }

    fn set_trial_system_attr(
        &self,
        trial_id: TrialId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn()?;
        unfinished_trial_study(&conn, trial_id)?;
        upsert_attr(&conn, "trial_system_attributes", "trial_id", trial_id.0, key, &value)
    }

    fn get_trial(&self, trial_id: TrialId) -> Result<FrozenTrial, CoreError> {
        let conn = self.conn()?;
        load_trials(&conn, &Scope::Trial(trial_id))?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::NotFound(format!("trial {trial_id}")))
    }

    fn get_all_trials(
        &self,
        study_id: StudyId,
        states: Option<&[TrialState]>,
    ) -> Result<Vec<FrozenTrial>, CoreError> {
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        Ok(filter_states(load_trials(&conn, &Scope::Study(study_id))?, states))
    }
}

impl HeartbeatStorage for RdbStorage {
    fn record_heartbeat(&self, trial_id: TrialId) -> Result<(), CoreError> {
        let now = self.clock.now();
        let conn = self.conn()?;
        trial_header(&conn, trial_id)?;
        conn.execute(
            "INSERT INTO trial_heartbeats(trial_id, heartbeat) VALUES (?1, ?2) \
             ON CONFLICT(trial_id) DO UPDATE SET heartbeat = excluded.heartbeat",
            params![trial_id.0, now],
        )
        .map_err(map_sqerr)?;
        Ok(())
    }

    fn get_stale_trial_ids(&self, study_id: StudyId) -> Result<Vec<TrialId>, CoreError> {
        let Some(interval) = self.heartbeat_interval else {
            return Ok(Vec::new());
        };
        let grace = self.grace_period.unwrap_or(interval.saturating_mul(2));
        let deadline = i64::try_from(grace)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|grace| self.clock.now().checked_sub_signed(grace))
            .ok_or_else(|| {
                CoreError::InvalidArgument(format!("grace period of {grace}s is out of range"))
            })?;
        let conn = self.conn()?;
        ensure_study(&conn, study_id)?;
        let mut stmt = conn
            .prepare(
                "SELECT t.trial_id, h.heartbeat FROM trials t \
                 JOIN trial_heartbeats h ON h.trial_id = t.trial_id \
                 WHERE t.study_id = ?1 AND t.state = ?2 ORDER BY t.trial_id",
            )
            .map_err(map_sqerr)?;
        let mut rows = stmt
            .query(params![study_id.0, TrialState::Running.as_str()])
            .map_err(map_sqerr)?;
        let mut stale = Vec::new();
        while let Some(row) = rows.next().map_err(map_sqerr)? {
            let trial_id: i64 = row.get(0).map_err(map_sqerr)?;
            let heartbeat: DateTime<Utc> = row.get(1).map_err(map_sqerr)?;
            if heartbeat < deadline {
                stale.push(TrialId(trial_id));
            }
        }
        Ok(stale)
    }

    fn heartbeat_interval(&self) -> Option<u64> {
        self.heartbeat_interval
    }
}
