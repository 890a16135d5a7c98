// =============================================================================
// Analysis Store — latest snapshot per timeframe plus the trade history log
// =============================================================================
//
// One live snapshot per timeframe, each behind its own lock. Persistence is
// best-effort durable: snapshot writes go through tmp + rename so a crash
// leaves either the old file or the new one, never a torn file. A snapshot
// that fails to parse at startup is quarantined with a `.bad` suffix and
// treated as missing. Trade records append to a single JSON-lines file and
// are never mutated; rotation is the operator's concern.
// =============================================================================

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{BotError, BotResult};
use crate::types::{Analysis, Timeframe, TradeRecord};

/// Snapshot store plus append-only trade history.
pub struct AnalysisStore {
    slots: HashMap<Timeframe, RwLock<Option<Analysis>>>,
    analysis_dir: PathBuf,
    trades_path: PathBuf,
    /// Serialises appends so records never interleave.
    history_lock: Mutex<()>,
}

impl AnalysisStore {
    /// Open (or create) the store under `data_dir`, recovering any snapshots
    /// persisted by a previous run.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let analysis_dir = data_dir.join("analysis");
        let trades_dir = data_dir.join("trades");
        std::fs::create_dir_all(&analysis_dir)
            .with_context(|| format!("failed to create {}", analysis_dir.display()))?;
        std::fs::create_dir_all(&trades_dir)
            .with_context(|| format!("failed to create {}", trades_dir.display()))?;

        let mut slots = HashMap::new();
        for tf in Timeframe::ALL {
            let recovered = load_snapshot(&snapshot_path(&analysis_dir, tf));
            slots.insert(tf, RwLock::new(recovered));
        }

        let recovered = slots.values().filter(|s| s.read().is_some()).count();
        info!(
            dir = %data_dir.display(),
            recovered_snapshots = recovered,
            "analysis store opened"
        );

        Ok(Self {
            slots,
            analysis_dir,
            trades_path: trades_dir.join("history.jsonl"),
            history_lock: Mutex::new(()),
        })
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// Latest analysis for `timeframe`, if any.
    pub fn get(&self, timeframe: Timeframe) -> Option<Analysis> {
        self.slots[&timeframe].read().clone()
    }

    /// Replace the snapshot for `timeframe`.
    ///
    /// A `final` snapshot is accepted only when all four sampled timeframes
    /// hold snapshots newer than the previous `final`; otherwise the combined
    /// pass must be skipped ([`BotError::InvariantViolation`]).
    pub fn put(&self, timeframe: Timeframe, analysis: Analysis) -> BotResult<()> {
        if timeframe == Timeframe::Final {
            self.final_inputs()?;
        }

        *self.slots[&timeframe].write() = Some(analysis.clone());
        self.persist(timeframe, &analysis);
        debug!(%timeframe, generated_at = analysis.generated_at, "snapshot stored");
        Ok(())
    }

    /// The four sampled analyses the combined pass would consume, or the
    /// reason it must be skipped.
    ///
    /// Every sampled snapshot must exist and be strictly newer than the
    /// previous `final`; before the first `final`, presence suffices.
    pub fn final_inputs(&self) -> BotResult<Vec<Analysis>> {
        let previous_final_ts = self.slots[&Timeframe::Final]
            .read()
            .as_ref()
            .map(|a| a.generated_at);

        let mut bundle = Vec::with_capacity(Timeframe::SAMPLED.len());
        for tf in Timeframe::SAMPLED {
            let slot = self.slots[&tf].read();
            let analysis = slot.as_ref().ok_or_else(|| {
                BotError::InvariantViolation(format!("combined pass needs a {tf} snapshot"))
            })?;
            if let Some(final_ts) = previous_final_ts {
                if analysis.generated_at <= final_ts {
                    return Err(BotError::InvariantViolation(format!(
                        "{tf} snapshot predates the previous combined analysis"
                    )));
                }
            }
            bundle.push(analysis.clone());
        }
        Ok(bundle)
    }

    /// Atomic tmp + rename write. Best-effort: an I/O failure keeps the
    /// in-memory snapshot and logs a warning.
    fn persist(&self, timeframe: Timeframe, analysis: &Analysis) {
        let path = snapshot_path(&self.analysis_dir, timeframe);
        let tmp = path.with_extension("json.tmp");

        let result = serde_json::to_vec_pretty(analysis)
            .context("serialise snapshot")
            .and_then(|bytes| std::fs::write(&tmp, bytes).context("write tmp snapshot"))
            .and_then(|_| std::fs::rename(&tmp, &path).context("rename tmp snapshot"));

        if let Err(e) = result {
            warn!(%timeframe, error = %e, "snapshot persistence failed (in-memory state kept)");
        }
    }

    // -------------------------------------------------------------------------
    // Trade history
    // -------------------------------------------------------------------------

    /// Append one record to `history.jsonl`.
    pub fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let _guard = self.history_lock.lock();

        let mut line = serde_json::to_string(record).context("serialise trade record")?;
        line.push('\n');

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trades_path)
            .with_context(|| format!("failed to open {}", self.trades_path.display()))?;
        file.write_all(line.as_bytes())
            .context("append trade record")?;

        debug!(recorded_at = record.recorded_at, "trade record appended");
        Ok(())
    }

    /// The most recent `count` trade records, oldest first. Unparseable lines
    /// are skipped with a warning.
    pub fn recent_trades(&self, count: usize) -> Vec<TradeRecord> {
        let _guard = self.history_lock.lock();

        let content = match std::fs::read_to_string(&self.trades_path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<TradeRecord> = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping corrupt trade history line"),
            }
        }

        if records.len() > count {
            records.split_off(records.len() - count)
        } else {
            records
        }
    }
}

impl std::fmt::Debug for AnalysisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let populated = self.slots.values().filter(|s| s.read().is_some()).count();
        f.debug_struct("AnalysisStore")
            .field("analysis_dir", &self.analysis_dir)
            .field("populated_slots", &populated)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// File helpers
// ---------------------------------------------------------------------------

fn snapshot_path(analysis_dir: &Path, timeframe: Timeframe) -> PathBuf {
    analysis_dir.join(format!("analysis_{}.json", timeframe.code()))
}

/// Read a persisted snapshot; quarantine a corrupt one with a `.bad` suffix.
fn load_snapshot(path: &Path) -> Option<Analysis> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(analysis) => Some(analysis),
        Err(e) => {
            let quarantine = path.with_extension("json.bad");
            warn!(
                path = %path.display(),
                error = %e,
                quarantine = %quarantine.display(),
                "corrupt snapshot quarantined"
            );
            if let Err(rename_err) = std::fs::rename(path, &quarantine) {
                warn!(error = %rename_err, "quarantine rename failed");
            }
            None
        }
    }
}
