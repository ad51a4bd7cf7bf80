//! Per-table timing averages and per-partition operation counters.
//!
//! These are best-effort gauges: counters are drained on every collection
//! cycle and races with the partition workers are accepted.

use std::collections::HashMap;

/// Accumulated timings for one UVE table: rule evaluation (`call`),
/// contribution fetch (`get`) and store publication (`pub`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TableStats {
    call_time_us: i64,
    call_n: u64,
    get_time_us: i64,
    get_n: u64,
    pub_time_us: i64,
    pub_n: u64,
}

impl TableStats {
    pub fn record_call(&mut self, us: i64) {
        self.call_time_us += us;
        self.call_n += 1;
    }

    pub fn record_get(&mut self, us: i64) {
        self.get_time_us += us;
        self.get_n += 1;
    }

    pub fn record_pub(&mut self, us: i64) {
        self.pub_time_us += us;
        self.pub_n += 1;
    }

    #[must_use]
    pub fn call_result(&self) -> i64 {
        if self.call_n == 0 {
            0
        } else {
            self.call_time_us / i64::try_from(self.call_n).unwrap_or(1)
        }
    }

    #[must_use]
    pub fn get_result(&self) -> i64 {
        if self.get_n == 0 {
            0
        } else {
            self.get_time_us / i64::try_from(self.get_n).unwrap_or(1)
        }
    }

    #[must_use]
    pub fn pub_result(&self) -> i64 {
        if self.pub_n == 0 {
            0
        } else {
            self.pub_time_us / i64::try_from(self.pub_n).unwrap_or(1)
        }
    }

    /// Number of contribution fetches, reported as the update count.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.get_n
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Output-side counters for one struct type.
#[derive(Debug, Clone, Copy, Default)]
pub struct UveOpCounts {
    pub add: u64,
    pub change: u64,
    pub remove: u64,
}

/// Alarm set/reset counters for one alarm name.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmOpCounts {
    pub set: u64,
    pub reset: u64,
}

/// All mutable counters of the service, drained once per stats period.
#[derive(Debug, Default)]
pub struct ServerStats {
    tab_perf: HashMap<String, TableStats>,
    tab_perf_prev: HashMap<String, TableStats>,
    // partition -> table -> type -> counts
    uve_out: HashMap<u32, HashMap<String, HashMap<String, UveOpCounts>>>,
    // partition -> table -> alarm -> counts
    alarm_ops: HashMap<u32, HashMap<String, HashMap<String, AlarmOpCounts>>>,
}

impl ServerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn perf(&mut self, table: &str) -> &mut TableStats {
        self.tab_perf.entry(table.to_string()).or_default()
    }

    /// Timing averages from the last completed period.
    #[must_use]
    pub fn perf_prev(&self) -> &HashMap<String, TableStats> {
        &self.tab_perf_prev
    }

    pub fn count_uve_op(&mut self, partition: u32, table: &str, typ: &str, op: UveOp) {
        let c = self
            .uve_out
            .entry(partition)
            .or_default()
            .entry(table.to_string())
            .or_default()
            .entry(typ.to_string())
            .or_default();
        match op {
            UveOp::Add => c.add += 1,
            UveOp::Change => c.change += 1,
            UveOp::Remove => c.remove += 1,
        }
    }

    pub fn count_alarm_set(&mut self, partition: u32, table: &str, alarm: &str) {
        self.alarm_ops
            .entry(partition)
            .or_default()
            .entry(table.to_string())
            .or_default()
            .entry(alarm.to_string())
            .or_default()
            .set += 1;
    }

    pub fn count_alarm_reset(&mut self, partition: u32, table: &str, alarm: &str) {
        self.alarm_ops
            .entry(partition)
            .or_default()
            .entry(table.to_string())
            .or_default()
            .entry(alarm.to_string())
            .or_default()
            .reset += 1;
    }

    /// Drops every counter kept for a released partition.
    pub fn drop_partition(&mut self, partition: u32) {
        self.uve_out.remove(&partition);
        self.alarm_ops.remove(&partition);
    }

    /// Snapshot-and-reset for the periodic stats report.
    pub fn collect(&mut self) -> StatsPeriod {
        self.tab_perf_prev = self.tab_perf.clone();
        for t in self.tab_perf.values_mut() {
            t.reset();
        }
        StatsPeriod {
            perf: self.tab_perf_prev.clone(),
            uve_out: std::mem::take(&mut self.uve_out),
            alarm_ops: std::mem::take(&mut self.alarm_ops),
        }
    }
}

/// Output-side operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UveOp {
    Add,
    Change,
    Remove,
}

/// One collection period's counters.
#[derive(Debug)]
pub struct StatsPeriod {
    pub perf: HashMap<String, TableStats>,
    pub uve_out: HashMap<u32, HashMap<String, HashMap<String, UveOpCounts>>>,
    pub alarm_ops: HashMap<u32, HashMap<String, HashMap<String, AlarmOpCounts>>>,
}
