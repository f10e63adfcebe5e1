//! Allocation-accounting collector for the engine.
//!
//! Guest values are reference counted; what this module adds is the control
//! surface an embedder expects from a scripting VM's collector: a live
//! registry of heap objects, a memory footprint estimate, full and stepped
//! sweeps, pause/step-multiplier tuning, stop/restart, and an
//! incremental/generational mode switch. A "collection" here prunes
//! registry entries whose objects have already been reclaimed and refreshes
//! the footprint estimate; it never frees live data itself.

use std::cell::RefCell;
use std::rc::Weak;

use serde::Serialize;

use crate::engine::value::{Closure, Table};

const DEFAULT_PAUSE: i32 = 200;
const DEFAULT_STEP_MUL: i32 = 100;
/// Registry growth between automatic sweeps, scaled by `pause`.
const AUTO_SWEEP_BASE: usize = 256;

const TABLE_BASE_COST: usize = 96;
const TABLE_ENTRY_COST: usize = 48;
const CLOSURE_BASE_COST: usize = 80;
const CLOSURE_UPVAL_COST: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    Incremental,
    Generational,
}

impl GcMode {
    pub fn name(self) -> &'static str {
        match self {
            GcMode::Incremental => "incremental",
            GcMode::Generational => "generational",
        }
    }
}

/// Snapshot of collector state, serializable for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct GcStats {
    pub count_kb: i32,
    pub running: bool,
    pub mode: &'static str,
    pub collections: u64,
    pub tracked_objects: usize,
}

pub struct GcAccount {
    running: bool,
    mode: GcMode,
    pause: i32,
    step_mul: i32,
    tables: Vec<Weak<RefCell<Table>>>,
    closures: Vec<Weak<Closure>>,
    bytes: usize,
    allocs_since_sweep: usize,
    scan_cursor: usize,
    collections: u64,
}

impl Default for GcAccount {
    fn default() -> Self {
        Self::new()
    }
}

impl GcAccount {
    pub fn new() -> Self {
        Self {
            running: true,
            mode: GcMode::Incremental,
            pause: DEFAULT_PAUSE,
            step_mul: DEFAULT_STEP_MUL,
            tables: Vec::new(),
            closures: Vec::new(),
            bytes: 0,
            allocs_since_sweep: 0,
            scan_cursor: 0,
            collections: 0,
        }
    }

    pub fn track_table(&mut self, table: Weak<RefCell<Table>>) {
        self.tables.push(table);
        self.bytes += TABLE_BASE_COST;
        self.allocs_since_sweep += 1;
    }

    pub fn track_closure(&mut self, closure: Weak<Closure>) {
        self.closures.push(closure);
        self.bytes += CLOSURE_BASE_COST;
        self.allocs_since_sweep += 1;
    }

    /// Whether enough allocations have accumulated for an automatic sweep.
    pub fn should_collect(&self) -> bool {
        let threshold = AUTO_SWEEP_BASE * (self.pause.max(1) as usize) / 100;
        self.running && self.allocs_since_sweep >= threshold.max(1)
    }

    /// Full sweep: prunes dead registry entries and recomputes the
    /// footprint estimate from live objects. Returns the number of entries
    /// pruned.
    pub fn collect(&mut self) -> usize {
        let before = self.tables.len() + self.closures.len();
        let mut bytes = 0usize;

        self.tables.retain(|weak| match weak.upgrade() {
            Some(table) => {
                bytes += TABLE_BASE_COST + table.borrow().pair_count() * TABLE_ENTRY_COST;
                true
            }
            None => false,
        });
        self.closures.retain(|weak| match weak.upgrade() {
            Some(closure) => {
                bytes += CLOSURE_BASE_COST + closure.upvals.len() * CLOSURE_UPVAL_COST;
                true
            }
            None => false,
        });

        self.bytes = bytes;
        self.allocs_since_sweep = 0;
        self.scan_cursor = 0;
        self.collections += 1;
        before - (self.tables.len() + self.closures.len())
    }

    /// Incremental step with a work budget of roughly `kb` kilobytes of
    /// registry scanning. Returns `true` when the step completed a full
    /// sweep cycle. Only meaningful in incremental mode; in generational
    /// mode a step degenerates into a full collection.
    pub fn step(&mut self, kb: i32) -> bool {
        if self.mode == GcMode::Generational {
            self.collect();
            return true;
        }
        let budget =
            ((kb.max(1) as usize) * 1024 / TABLE_BASE_COST).max(1) * (self.step_mul.max(1) as usize)
                / 100;
        let total = self.tables.len();
        let end = (self.scan_cursor + budget.max(1)).min(total);
        // Compact the scanned window in place; retain() over a sub-range is
        // not available, so swap-remove dead entries backwards.
        let mut i = end;
        while i > self.scan_cursor {
            i -= 1;
            if self.tables[i].strong_count() == 0 {
                self.tables.swap_remove(i);
            }
        }
        self.scan_cursor = end.min(self.tables.len());
        if self.scan_cursor >= self.tables.len() {
            // finish the cycle over closures in one go
            self.closures.retain(|weak| weak.strong_count() > 0);
            self.scan_cursor = 0;
            self.collections += 1;
            self.allocs_since_sweep = 0;
            true
        } else {
            false
        }
    }

    pub fn set_pause(&mut self, pause: i32) -> i32 {
        std::mem::replace(&mut self.pause, pause)
    }

    pub fn set_step_mul(&mut self, step_mul: i32) -> i32 {
        std::mem::replace(&mut self.step_mul, step_mul)
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn restart(&mut self) {
        self.running = true;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Estimated footprint in kilobytes, the granularity the embedder's
    /// control surface reports.
    pub fn count_kb(&self) -> i32 {
        (self.bytes / 1024) as i32
    }

    pub fn set_mode(&mut self, mode: GcMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> GcMode {
        self.mode
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            count_kb: self.count_kb(),
            running: self.running,
            mode: self.mode.name(),
            collections: self.collections,
            tracked_objects: self.tables.len() + self.closures.len(),
        }
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.closures.clear();
        self.bytes = 0;
        self.allocs_since_sweep = 0;
        self.scan_cursor = 0;
    }
}
