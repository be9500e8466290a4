// =============================================================================
// Position Store — durable snapshots of strategies plus a completion journal
// =============================================================================
//
// Two artifacts under the data directory:
//
//   positions.json    — full JSON map of strategy id -> strategy snapshot,
//                       rewritten atomically (tmp + rename) on every upsert.
//                       Terminal strategies stay in the map as the archive.
//   completions.jsonl — append-only journal, one JSON record per liquidation
//                       fill, for post-hoc accounting.
//
// A single mutex serialises file writes. Per-strategy snapshot ordering is
// still total because each strategy has exactly one writing task.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::strategy::Strategy;
use crate::types::ExitReason;

const POSITIONS_FILE: &str = "positions.json";
const COMPLETIONS_FILE: &str = "completions.jsonl";

/// One liquidation fill, as appended to the completion journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub strategy_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub price: f64,
    pub reason: ExitReason,
    pub pnl_pct: f64,
    /// RFC 3339 timestamp of the fill.
    pub at: String,
}

struct StoreInner {
    positions: HashMap<String, Strategy>,
}

/// File-backed store for strategy snapshots and completions.
pub struct PositionStore {
    dir: PathBuf,
    inner: Mutex<StoreInner>,
    /// Completed snapshot rewrites, for write-amplification checks.
    writes: AtomicU64,
}

impl PositionStore {
    /// Open (or initialise) the store under `dir`, loading any existing
    /// position map.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;

        let path = dir.join(POSITIONS_FILE);
        let positions: HashMap<String, Strategy> = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            HashMap::new()
        };

        info!(
            dir = %dir.display(),
            positions = positions.len(),
            "position store opened"
        );

        Ok(Self {
            dir,
            inner: Mutex::new(StoreInner { positions }),
            writes: AtomicU64::new(0),
        })
    }

    /// Number of snapshot rewrites since the store was opened.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Non-terminal strategies from the persisted map, for rehydration at
    /// startup.
    pub fn load_open(&self) -> Vec<Strategy> {
        let inner = self.inner.lock();
        let mut open: Vec<Strategy> = inner
            .positions
            .values()
            .filter(|s| !s.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.id.cmp(&b.id));
        open
    }

    /// Persist the latest snapshot of `strategy`, replacing any previous one.
    pub fn upsert(&self, strategy: &Strategy) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .positions
            .insert(strategy.id.clone(), strategy.clone());
        self.write_positions(&inner.positions)?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Append one liquidation fill to the completion journal.
    pub fn append_completion(&self, record: &CompletionRecord) -> Result<()> {
        let _guard = self.inner.lock();
        let path = self.dir.join(COMPLETIONS_FILE);
        let line =
            serde_json::to_string(record).context("failed to serialise completion record")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }

    /// The most recent `limit` completion records, newest last.
    pub fn recent_completions(&self, limit: usize) -> Vec<CompletionRecord> {
        let _guard = self.inner.lock();
        let path = self.dir.join(COMPLETIONS_FILE);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };

        let mut records: Vec<CompletionRecord> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "skipping malformed completion journal line"),
            }
        }
        if records.len() > limit {
            records.drain(..records.len() - limit);
        }
        records
    }

    fn write_positions(&self, positions: &HashMap<String, Strategy>) -> Result<()> {
        let path = self.dir.join(POSITIONS_FILE);
        let tmp_path = self.dir.join(format!("{POSITIONS_FILE}.tmp"));

        let content =
            serde_json::to_string_pretty(positions).context("failed to serialise position map")?;

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename {} into place", tmp_path.display()))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
