//! Reservation Ledger: the durable record of successful claims.
//!
//! Rows live in memory and every change is appended to a checksummed log
//! through a single group-commit writer task. Only the claim path records
//! rows and only [`Ledger::reconcile`] deletes them.

mod error;

pub use error::LedgerError;

use std::io;
use std::path::PathBuf;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

// ── Group-commit log channel ─────────────────────────────

enum WalCommand {
    Append {
        event: LedgerEvent,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<LedgerEvent>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    WriteBudget {
        budget: Option<u64>,
        response: oneshot::Sender<()>,
    },
}

/// Background task that owns the log and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
///
/// A failed batch is rolled back to the last committed offset. If the
/// rollback fails too the task exits, and every later call sees
/// `WriterClosed` rather than appending behind a torn record.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !commit_batch(&mut wal, &mut batch) {
                    return;
                }
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

/// Returns false once the log can no longer be appended to safely.
fn commit_batch(wal: &mut Wal, batch: &mut Vec<(LedgerEvent, oneshot::Sender<io::Result<()>>)>) -> bool {
    metrics::histogram!(observability::LEDGER_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::LEDGER_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let mut healthy = true;
    if let Err(e) = &result {
        warn!(path = %wal.path().display(), records = batch.len(), "ledger batch failed, rolling back: {e}");
        if let Err(rollback) = wal.rollback() {
            error!(path = %wal.path().display(), "ledger rollback failed, closing writer: {rollback}");
            healthy = false;
        }
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
    healthy
}

fn flush_batch(wal: &mut Wal, batch: &[(LedgerEvent, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch {
        wal.append_buffered(event)?;
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        #[cfg(test)]
        WalCommand::WriteBudget { budget, response } => {
            wal.set_write_budget(budget);
            let _ = response.send(());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Apply a record to the row map. Shared by replay and live writes so both
/// converge on the same state.
fn apply_event(rows: &DashMap<ReservationKey, Reservation>, event: &LedgerEvent) -> usize {
    match event {
        LedgerEvent::Recorded(row) => {
            rows.entry(row.key.clone())
                .and_modify(|existing| existing.merge(row))
                .or_insert_with(|| row.clone());
            0
        }
        LedgerEvent::Purged { rows: purged, .. } => purged
            .iter()
            .filter(|(key, expires_at)| {
                rows.remove_if(key, |_, row| row.expires_at == *expires_at).is_some()
            })
            .count(),
    }
}

pub struct Ledger {
    rows: DashMap<ReservationKey, Reservation>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Record writes share this gate; reconcile and compaction take it
    /// exclusively so their snapshots cannot miss an in-flight record.
    commit_gate: RwLock<()>,
}

impl Ledger {
    /// Replay the log at `path` and start its writer task. Must run inside a
    /// tokio runtime.
    pub fn open(path: PathBuf) -> Result<Self, LedgerError> {
        let replay = Wal::replay(&path)?;
        if replay.discarded_tail {
            warn!(path = %path.display(), valid_len = replay.valid_len, "discarding torn ledger tail");
        }
        let wal = Wal::open(&path, replay.valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let rows = DashMap::new();
        for event in &replay.events {
            apply_event(&rows, event);
        }
        info!(path = %path.display(), records = replay.events.len(), rows = rows.len(), "ledger opened");
        metrics::gauge!(observability::LEDGER_ROWS).set(rows.len() as f64);

        Ok(Self {
            rows,
            wal_tx,
            commit_gate: RwLock::new(()),
        })
    }

    async fn wal_append(&self, event: &LedgerEvent) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        rx.await.map_err(|_| LedgerError::WriterClosed)??;
        Ok(())
    }

    /// Create or extend the row for `key`. Returns the row as stored.
    pub async fn record(&self, key: ReservationKey, now: Ms, expires_at: Ms) -> Result<Reservation, LedgerError> {
        let _gate = self.commit_gate.read().await;

        let row = match self.rows.get(&key) {
            Some(existing) => Reservation {
                expires_at,
                ..existing.value().clone()
            },
            None => Reservation {
                id: Ulid::new(),
                key: key.clone(),
                created_at: now,
                expires_at,
            },
        };
        let event = LedgerEvent::Recorded(row);
        self.wal_append(&event).await?;
        apply_event(&self.rows, &event);
        metrics::gauge!(observability::LEDGER_ROWS).set(self.rows.len() as f64);

        self.rows
            .get(&key)
            .map(|r| r.value().clone())
            .ok_or(LedgerError::Vanished(key))
    }

    /// Delete every row with `expires_at < now` as one durable batch.
    /// A failed append leaves state untouched; re-running is always safe.
    pub async fn reconcile(&self, now: Ms) -> Result<usize, LedgerError> {
        let _gate = self.commit_gate.write().await;

        let mut expired: Vec<(ReservationKey, Ms)> = self
            .rows
            .iter()
            .filter(|e| e.value().expires_at < now)
            .map(|e| (e.key().clone(), e.value().expires_at))
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        expired.sort();

        let event = LedgerEvent::Purged { at: now, rows: expired };
        self.wal_append(&event).await?;
        let removed = apply_event(&self.rows, &event);
        metrics::gauge!(observability::LEDGER_ROWS).set(self.rows.len() as f64);
        Ok(removed)
    }

    /// Rewrite the log as one `Recorded` per current row.
    pub async fn compact(&self) -> Result<(), LedgerError> {
        let _gate = self.commit_gate.write().await;

        let mut snapshot: Vec<Reservation> = self.rows.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by(|a, b| a.key.cmp(&b.key));
        let events = snapshot.into_iter().map(LedgerEvent::Recorded).collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        rx.await.map_err(|_| LedgerError::WriterClosed)??;
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Cap the bytes the log file accepts from now on; `None` lifts the cap.
    #[cfg(test)]
    pub(crate) async fn set_write_budget(&self, budget: Option<u64>) {
        let (tx, rx) = oneshot::channel();
        if self.wal_tx.send(WalCommand::WriteBudget { budget, response: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn get(&self, key: &ReservationKey) -> Option<Reservation> {
        self.rows.get(key).map(|e| e.value().clone())
    }

    /// All rows for a slot, live or awaiting reconciliation, oldest first.
    pub fn rows_for_slot(&self, slot_id: &str) -> Vec<Reservation> {
        let mut rows: Vec<Reservation> = self
            .rows
            .iter()
            .filter(|e| e.key().slot_id == slot_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
