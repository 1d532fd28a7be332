//! Fault-tolerance logging and state restore for workers.
//!
//! A worker with a [`FaultToleranceConfig`] writes every input batch
//! it receives to its own SQLite file before processing it, and
//! periodically checkpoints its executor state next to the batches.
//! A worker with a [`StateRestoreConfig`] rebuilds its state from
//! such a file with [`replay`] before it accepts any new input.
//!
//! The file for a worker lives at `<log_dir>/<worker>.sqlite3` and
//! has two tables:
//!
//! - `inputs`: every batch in arrival order, keyed by a sequence
//!   number starting at 1.
//!
//! - `checkpoints`: executor snapshots. A checkpoint at `seq` covers
//!   every batch up to and including `seq`. Each snapshot carries a
//!   [`seahash`] checksum of its serialized form.
//!
//! Restore loads the newest checkpoint at or before the replay bound,
//! then re-processes every later logged batch up to the bound. Any
//! problem on that path is an [`EngineError::Replay`]. A worker never
//! silently starts from empty state when a restore was asked for.

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::OnceLock;

use rusqlite::Connection;
use rusqlite::OpenFlags;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tracing::instrument;

use crate::errors::EngineError;
use crate::errors::EngineResult;
use crate::errors::ErrorContext;
use crate::identity::ActorVirtualIdentity;
use crate::worker::executor::Executor;
use crate::worker::Tuple;

/// Persist enough to restore this worker later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultToleranceConfig {
    pub log_dir: PathBuf,
    /// Checkpoint after this many input tuples. A final checkpoint
    /// is always written at end of input.
    pub checkpoint_interval: u64,
}

/// Rebuild this worker's state before it processes new input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRestoreConfig {
    pub log_dir: PathBuf,
    /// Replay only batches with a sequence number at or below this.
    /// Everything logged when `None`.
    pub replay_up_to: Option<u64>,
}

/// A decoded executor snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub seq: u64,
    pub tuple_count: u64,
    pub state: Value,
}

/// What [`replay`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayOutcome {
    /// Sequence number of the checkpoint restored from, if any.
    pub checkpoint_seq: Option<u64>,
    pub replayed_batches: u64,
    /// Input tuples accounted for by the checkpoint and the replayed
    /// batches together.
    pub tuple_count: u64,
    /// Sequence number of the last batch now reflected in the state.
    pub last_seq: u64,
}

// The `'static` lifetime within [`Migrations`] is saying that the
// [`str`]s composing the migrations are `'static`.
static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();

fn get_migrations() -> &'static Migrations<'static> {
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![
            M::up(
                "CREATE TABLE inputs ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 seq INTEGER NOT NULL PRIMARY KEY CHECK (seq > 0), \
                 batch TEXT NOT NULL \
                 ) STRICT",
            ),
            // Not a foreign key into `inputs`: a checkpoint at seq 0
            // covers no batches at all.
            M::up(
                "CREATE TABLE checkpoints ( \
                 created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
                 seq INTEGER NOT NULL PRIMARY KEY CHECK (seq >= 0), \
                 tuple_count INTEGER NOT NULL CHECK (tuple_count >= 0), \
                 state TEXT NOT NULL, \
                 checksum INTEGER NOT NULL \
                 ) STRICT",
            ),
        ])
    })
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    get_migrations().validate()
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> EngineResult<()> {
    // These are recommended by Litestream.
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    get_migrations().to_latest(conn)?;
    Ok(())
}

/// Checksums are stored bit-for-bit in SQLite's signed integers.
fn checksum(state: &str) -> i64 {
    seahash::hash(state.as_bytes()) as i64
}

/// One worker's replay log.
pub struct RecoveryLog {
    conn: Connection,
    path: PathBuf,
    last_seq: u64,
}

impl RecoveryLog {
    /// Where the log of `worker` lives inside `log_dir`.
    pub fn path_for(log_dir: &Path, worker: &ActorVirtualIdentity) -> PathBuf {
        log_dir.join(format!("{}.sqlite3", worker.file_stem()))
    }

    /// Open the log for writing, creating it and its directory if
    /// needed.
    pub fn init(log_dir: &Path, worker: &ActorVirtualIdentity) -> EngineResult<Self> {
        fs::create_dir_all(log_dir).reraise("can't create recovery log directory")?;
        let path = Self::path_for(log_dir, worker);
        tracing::info!("Init recovery log for {worker} at {path:?}");
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise("can't open recovery log")?;
        Self::from_conn(conn, path)
    }

    /// Open an existing log. Missing files are an error.
    pub fn open(log_dir: &Path, worker: &ActorVirtualIdentity) -> EngineResult<Self> {
        let path = Self::path_for(log_dir, worker);
        tracing::info!("Opening recovery log for {worker} at {path:?}");
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .reraise("can't open recovery log")?;
        Self::from_conn(conn, path)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_conn(conn, PathBuf::from(":memory:"))
    }

    fn from_conn(mut conn: Connection, path: PathBuf) -> EngineResult<Self> {
        setup_conn(&mut conn)?;
        let last_seq: i64 = conn.query_row(
            "SELECT MAX( \
             (SELECT COALESCE(MAX(seq), 0) FROM inputs), \
             (SELECT COALESCE(MAX(seq), 0) FROM checkpoints))",
            (),
            |row| row.get(0),
        )?;
        Ok(Self {
            conn,
            path,
            last_seq: last_seq as u64,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sequence number of the newest logged batch.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Durably log a batch before it is processed. Returns its
    /// sequence number.
    pub fn append_batch(&mut self, batch: &[Tuple]) -> EngineResult<u64> {
        let seq = self.last_seq + 1;
        let encoded = serde_json::to_string(batch)?;
        tracing::trace!("Logging batch {seq} of {} tuples", batch.len());
        self.conn.execute(
            "INSERT INTO inputs (seq, batch) VALUES (?1, ?2)",
            (seq as i64, encoded),
        )?;
        self.last_seq = seq;
        Ok(seq)
    }

    /// Store a snapshot covering every batch up to `seq`.
    pub fn write_checkpoint(&mut self, seq: u64, tuple_count: u64, state: &Value) -> EngineResult<()> {
        let encoded = serde_json::to_string(state)?;
        tracing::debug!("Checkpoint at seq {seq} after {tuple_count} tuples");
        self.conn.execute(
            "INSERT INTO checkpoints (seq, tuple_count, state, checksum) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (seq) DO UPDATE \
             SET tuple_count = EXCLUDED.tuple_count, \
             state = EXCLUDED.state, \
             checksum = EXCLUDED.checksum",
            (seq as i64, tuple_count as i64, &encoded, checksum(&encoded)),
        )?;
        Ok(())
    }

    /// Newest checkpoint at or before `up_to`, verified against its
    /// checksum.
    pub fn latest_checkpoint(&self, up_to: Option<u64>) -> EngineResult<Option<Checkpoint>> {
        let bound = up_to.map(|seq| seq as i64).unwrap_or(i64::MAX);
        let row: Option<(i64, i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT seq, tuple_count, state, checksum \
                 FROM checkpoints \
                 WHERE seq <= ?1 \
                 ORDER BY seq DESC \
                 LIMIT 1",
                (bound,),
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((seq, tuple_count, state, stored)) => {
                if checksum(&state) != stored {
                    return Err(EngineError::Executor(format!(
                        "checkpoint at seq {seq} in {:?} failed its checksum",
                        self.path
                    )));
                }
                Ok(Some(Checkpoint {
                    seq: seq as u64,
                    tuple_count: tuple_count as u64,
                    state: serde_json::from_str(&state)?,
                }))
            }
        }
    }

    /// Logged batches with `after < seq <= up_to`, in order.
    pub fn batches_between(&self, after: u64, up_to: Option<u64>) -> EngineResult<Vec<(u64, Vec<Tuple>)>> {
        let bound = up_to.map(|seq| seq as i64).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT seq, batch \
             FROM inputs \
             WHERE seq > ?1 AND seq <= ?2 \
             ORDER BY seq",
        )?;
        let rows = stmt.query_map((after as i64, bound), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        // Collect so no borrow of the connection escapes.
        let mut batches = Vec::new();
        for row in rows {
            let (seq, batch) = row?;
            batches.push((seq as u64, serde_json::from_str(&batch)?));
        }
        Ok(batches)
    }

    /// Forget everything logged after `seq`, so new input continues
    /// the sequence right after a bounded replay.
    pub fn discard_after(&mut self, seq: u64) -> EngineResult<()> {
        let txn = self.conn.transaction()?;
        let inputs = txn.execute("DELETE FROM inputs WHERE seq > ?1", (seq as i64,))?;
        let checkpoints = txn.execute("DELETE FROM checkpoints WHERE seq > ?1", (seq as i64,))?;
        txn.commit()?;
        if inputs + checkpoints > 0 {
            tracing::info!(
                "Discarded {inputs} batches and {checkpoints} checkpoints after seq {seq} in {:?}",
                self.path
            );
        }
        self.last_seq = seq;
        Ok(())
    }
}

/// Rebuild `executor` from the log described by `restore`.
///
/// Outputs produced while re-processing are discarded: downstream
/// already saw them before the failure.
#[instrument(name = "replay", skip(executor, restore), fields(log_dir = ?restore.log_dir))]
pub fn replay(
    worker: &ActorVirtualIdentity,
    executor: &mut dyn Executor,
    restore: &StateRestoreConfig,
) -> EngineResult<ReplayOutcome> {
    let fail = |reason: String| EngineError::Replay {
        worker: worker.clone(),
        reason,
    };

    let path = RecoveryLog::path_for(&restore.log_dir, worker);
    if !path.exists() {
        return Err(fail(format!("no recovery log at {path:?}")));
    }
    let log = RecoveryLog::open(&restore.log_dir, worker).map_err(|err| fail(err.to_string()))?;

    let checkpoint = log
        .latest_checkpoint(restore.replay_up_to)
        .map_err(|err| fail(err.to_string()))?;
    let mut outcome = ReplayOutcome::default();
    if let Some(checkpoint) = checkpoint {
        tracing::debug!("Restoring checkpoint at seq {}", checkpoint.seq);
        executor
            .restore(checkpoint.state)
            .map_err(|err| fail(format!("executor rejected checkpoint {}: {err}", checkpoint.seq)))?;
        outcome.checkpoint_seq = Some(checkpoint.seq);
        outcome.tuple_count = checkpoint.tuple_count;
        outcome.last_seq = checkpoint.seq;
    }

    let batches = log
        .batches_between(outcome.last_seq, restore.replay_up_to)
        .map_err(|err| fail(err.to_string()))?;
    for (seq, batch) in batches {
        for tuple in batch {
            executor
                .process_tuple(tuple, 0)
                .map_err(|err| fail(format!("re-processing batch {seq}: {err}")))?;
            outcome.tuple_count += 1;
        }
        outcome.replayed_batches += 1;
        outcome.last_seq = seq;
    }

    tracing::info!(
        "Replayed {} batches on top of checkpoint {:?}; state covers {} tuples",
        outcome.replayed_batches,
        outcome.checkpoint_seq,
        outcome.tuple_count
    );
    Ok(outcome)
}

#[cfg(test)]
fn batch_of(n: usize) -> Vec<Tuple> {
    (0..n)
        .map(|i| Tuple::from_value(serde_json::json!({ "i": i })).unwrap())
        .collect()
}

#[test]
fn log_assigns_sequential_seqs() {
    let mut log = RecoveryLog::open_in_memory().unwrap();
    assert_eq!(log.append_batch(&batch_of(2)).unwrap(), 1);
    assert_eq!(log.append_batch(&batch_of(1)).unwrap(), 2);
    let found = log.batches_between(0, None).unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].1.len(), 2);
    assert_eq!(log.batches_between(1, Some(1)).unwrap().len(), 0);
}

#[test]
fn latest_checkpoint_respects_bound() {
    let mut log = RecoveryLog::open_in_memory().unwrap();
    log.write_checkpoint(2, 10, &serde_json::json!({"count": 10})).unwrap();
    log.write_checkpoint(5, 20, &serde_json::json!({"count": 20})).unwrap();

    assert_eq!(log.latest_checkpoint(None).unwrap().unwrap().seq, 5);
    let bounded = log.latest_checkpoint(Some(4)).unwrap().unwrap();
    assert_eq!(bounded.seq, 2);
    assert_eq!(bounded.tuple_count, 10);
    assert_eq!(log.latest_checkpoint(Some(1)).unwrap(), None);
}

#[test]
fn corrupt_checkpoint_is_detected() {
    let mut log = RecoveryLog::open_in_memory().unwrap();
    log.write_checkpoint(1, 1, &serde_json::json!({"count": 1})).unwrap();
    log.conn
        .execute("UPDATE checkpoints SET state = '{\"count\": 99}'", ())
        .unwrap();
    assert!(log.latest_checkpoint(None).is_err());
}

#[test]
fn replay_restores_checkpoint_then_batches() {
    use crate::worker::executor::ExecutorSpec;
    use crate::worker::executor::RunningCount;

    let dir = tempfile::tempdir().unwrap();
    let worker = ActorVirtualIdentity::new("Worker:count-0");
    {
        let mut log = RecoveryLog::init(dir.path(), &worker).unwrap();
        log.append_batch(&batch_of(3)).unwrap();
        log.write_checkpoint(1, 3, &serde_json::json!({"count": 3})).unwrap();
        log.append_batch(&batch_of(2)).unwrap();
        log.append_batch(&batch_of(4)).unwrap();
    }

    let spec = ExecutorSpec::native(RunningCount::NAME);
    let mut executor = spec.build().unwrap();
    let restore = StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: Some(2),
    };
    let outcome = replay(&worker, executor.as_mut(), &restore).unwrap();
    assert_eq!(
        outcome,
        ReplayOutcome {
            checkpoint_seq: Some(1),
            replayed_batches: 1,
            tuple_count: 5,
            last_seq: 2,
        }
    );
    assert_eq!(executor.snapshot().unwrap(), serde_json::json!({"count": 5}));
}

#[test]
fn replay_without_log_fails_loudly() {
    use crate::worker::executor::ExecutorSpec;

    let dir = tempfile::tempdir().unwrap();
    let worker = ActorVirtualIdentity::new("Worker:missing-0");
    let mut executor = ExecutorSpec::native("pass-through").build().unwrap();
    let restore = StateRestoreConfig {
        log_dir: dir.path().to_path_buf(),
        replay_up_to: None,
    };
    let err = replay(&worker, executor.as_mut(), &restore).unwrap_err();
    assert!(err.is_replay());
}

#[test]
fn discard_after_rewinds_sequence() {
    let mut log = RecoveryLog::open_in_memory().unwrap();
    for _ in 0..4 {
        log.append_batch(&batch_of(1)).unwrap();
    }
    log.write_checkpoint(3, 3, &Value::Null).unwrap();
    log.discard_after(2).unwrap();
    assert_eq!(log.last_seq(), 2);
    assert_eq!(log.latest_checkpoint(None).unwrap(), None);
    assert_eq!(log.append_batch(&batch_of(1)).unwrap(), 3);
}
