use std::path::Path;

use itertools::Itertools;
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{
    validate_tube, DelayBound, JobChanges, JobFilter, JobStore, Order,
    StateGroup,
};
use crate::error::StoreError;
use crate::types::record::{JobRecord, NewJob, PRIORITY_MEDIUM};
use crate::util;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tube TEXT NOT NULL DEFAULT 'default',
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        delay INTEGER NOT NULL DEFAULT 0,
        priority INTEGER NOT NULL DEFAULT 2147483648
            CHECK (priority BETWEEN 0 AND 4294967295),
        reserved INTEGER NOT NULL DEFAULT 0 CHECK (reserved IN (0, 1)),
        buried INTEGER NOT NULL DEFAULT 0 CHECK (buried IN (0, 1))
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_reserve
        ON jobs (tube, reserved, buried, priority, id);
";

/// Ids bound per statement in a bulk update. SQLite caps the number of
/// parameters a statement may take.
const MAX_IDS_PER_STATEMENT: usize = 500;

const COLUMNS: &str =
    "id, tube, body, created_at, delay, priority, reserved, buried";

/// Keeps the jobs table in SQLite.
///
/// Every conditional update is a single `UPDATE ... WHERE` statement, so
/// several processes can safely share one database file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        // Several workers may poll the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        info!(path = %path.display(), "opened SQLite job store");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an existing connection, creating the jobs table if missing.
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` with the queue's connection, e.g. so a worker can write its
    /// own rows in the same database. A transaction left open by `f` is
    /// committed by [`JobStore::commit`].
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> R {
        f(&self.conn.lock())
    }
}

/// Appends SQL conditions for `filter` to `clauses`, with their parameters.
fn push_filter(
    filter: &JobFilter,
    clauses: &mut Vec<String>,
    values: &mut Vec<Value>,
) {
    if let Some(tubes) = &filter.tubes {
        if tubes.is_empty() {
            clauses.push("0".into());
        } else {
            let marks = tubes.iter().map(|_| "?").join(", ");
            clauses.push(format!("tube IN ({marks})"));
            values.extend(tubes.iter().cloned().map(Value::Text));
        }
    }
    if let Some(reserved) = filter.reserved {
        clauses.push("reserved = ?".into());
        values.push(Value::Integer(reserved.into()));
    }
    if let Some(buried) = filter.buried {
        clauses.push("buried = ?".into());
        values.push(Value::Integer(buried.into()));
    }
    match filter.delay {
        Some(DelayBound::Due(t)) => {
            clauses.push("delay <= ?".into());
            values.push(Value::Integer(t));
        },
        Some(DelayBound::Pending(t)) => {
            clauses.push("delay > ?".into());
            values.push(Value::Integer(t));
        },
        None => {},
    }
}

/// Builds the `SET` list for `changes`.
fn push_changes(
    changes: &JobChanges,
    sets: &mut Vec<&'static str>,
    values: &mut Vec<Value>,
) {
    if let Some(reserved) = changes.reserved {
        sets.push("reserved = ?");
        values.push(Value::Integer(reserved.into()));
    }
    if let Some(buried) = changes.buried {
        sets.push("buried = ?");
        values.push(Value::Integer(buried.into()));
    }
    if let Some(delay) = changes.delay {
        sets.push("delay = ?");
        values.push(Value::Integer(delay));
    }
    if let Some(priority) = changes.priority {
        sets.push("priority = ?");
        values.push(Value::Integer(priority.into()));
    }
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn id_to_sql(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id)
        .map_err(|_| StoreError::Backend(format!("job id {id} out of range")))
}

fn record_from_row(row: &Row) -> rusqlite::Result<JobRecord> {
    let id: i64 = row.get(0)?;
    let priority: i64 = row.get(5)?;

    Ok(JobRecord {
        id: u64::try_from(id)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(0, id))?,
        tube: row.get(1)?,
        body: row.get(2)?,
        created_at: row.get(3)?,
        delay: row.get(4)?,
        priority: u32::try_from(priority).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(5, priority)
        })?,
        reserved: row.get(6)?,
        buried: row.get(7)?,
    })
}

impl JobStore for SqliteStore {
    fn insert(&self, job: NewJob) -> Result<u64, StoreError> {
        validate_tube(&job.tube)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (tube, body, created_at, delay, priority)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.tube,
                job.body,
                util::now(),
                job.delay,
                i64::from(job.priority)
            ],
        )?;
        let id = conn.last_insert_rowid();

        u64::try_from(id).map_err(|_| {
            StoreError::Backend(format!("store assigned invalid id {id}"))
        })
    }

    fn find_by_id(&self, id: u64) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"),
                [id_to_sql(id)?],
                record_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn find_many(
        &self,
        filter: &JobFilter,
        order: Order,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        push_filter(filter, &mut clauses, &mut values);

        let order_sql = match order {
            Order::PriorityThenAge => "priority ASC, id ASC",
            Order::Newest => "id DESC",
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs{} ORDER BY {order_sql} LIMIT {limit}",
            where_sql(&clauses)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), record_from_row)?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn conditional_update(
        &self,
        id: u64,
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<bool, StoreError> {
        let mut sets = Vec::new();
        let mut values = Vec::new();
        push_changes(changes, &mut sets, &mut values);

        let mut clauses = vec!["id = ?".to_owned()];
        values.push(Value::Integer(id_to_sql(id)?));
        push_filter(expected, &mut clauses, &mut values);

        let conn = self.conn.lock();
        if sets.is_empty() {
            // Nothing to write: report whether the row would have matched.
            let sql = format!(
                "SELECT EXISTS (SELECT 1 FROM jobs{})",
                where_sql(&clauses)
            );
            let found: bool =
                conn.query_row(&sql, params_from_iter(values), |r| r.get(0))?;
            return Ok(found);
        }

        let sql = format!(
            "UPDATE jobs SET {}{}",
            sets.join(", "),
            where_sql(&clauses)
        );
        let changed = conn.execute(&sql, params_from_iter(values))?;
        debug!(id, changed, "conditional update");

        Ok(changed > 0)
    }

    fn update_many(
        &self,
        ids: &[u64],
        expected: &JobFilter,
        changes: &JobChanges,
    ) -> Result<usize, StoreError> {
        if ids.is_empty() || changes.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        // A savepoint nests inside a transaction a worker may have left open.
        let savepoint = conn.savepoint()?;
        let mut changed = 0;

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut sets = Vec::new();
            let mut values = Vec::new();
            push_changes(changes, &mut sets, &mut values);

            let marks = chunk.iter().map(|_| "?").join(", ");
            let mut clauses = vec![format!("id IN ({marks})")];
            for id in chunk {
                values.push(Value::Integer(id_to_sql(*id)?));
            }
            push_filter(expected, &mut clauses, &mut values);

            let sql = format!(
                "UPDATE jobs SET {}{}",
                sets.join(", "),
                where_sql(&clauses)
            );
            changed += savepoint.execute(&sql, params_from_iter(values))?;
        }

        savepoint.commit()?;
        debug!(requested = ids.len(), changed, "bulk update");

        Ok(changed)
    }

    fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let deleted =
            conn.execute("DELETE FROM jobs WHERE id = ?1", [id_to_sql(id)?])?;

        Ok(deleted > 0)
    }

    fn aggregate(
        &self,
        tube: Option<&str>,
        now: i64,
    ) -> Result<Vec<StateGroup>, StoreError> {
        let mut values = vec![
            Value::Integer(PRIORITY_MEDIUM.into()),
            Value::Integer(now),
        ];
        let filter = match tube {
            Some(tube) => {
                values.push(Value::Text(tube.to_owned()));
                " WHERE tube = ?"
            },
            None => "",
        };
        let sql = format!(
            "SELECT tube, buried, reserved, priority < ? AS urgent,
                    delay > ? AS delayed, COUNT(*) AS total
             FROM jobs{filter}
             GROUP BY tube, buried, reserved, urgent, delayed
             ORDER BY tube"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            let total: i64 = row.get(5)?;
            Ok(StateGroup {
                tube: row.get(0)?,
                buried: row.get(1)?,
                reserved: row.get(2)?,
                urgent: row.get(3)?,
                delayed: row.get(4)?,
                total: u64::try_from(total).unwrap_or_default(),
            })
        })?;

        let groups = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(groups)
    }

    fn distinct_tubes(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT tube FROM jobs ORDER BY tube ASC")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let tubes = rows.collect::<Result<Vec<String>, _>>()?;

        Ok(tubes)
    }

    fn commit(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            debug!("committing open transaction");
            conn.execute_batch("COMMIT")?;
        }

        Ok(())
    }
}
