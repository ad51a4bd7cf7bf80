//! Per-(table, key, alarm) state machine with soak timers.
//!
//! States: Idle -> Soak_Active -> Active -> Soak_Idle -> Idle. Soaking
//! delays promotion in both directions; the frequency window lets a
//! flapping alarm bypass the active soak. All timers live in one sorted
//! [`TimerIndex`] scanned by a single cooperative task; alarm state changes
//! are serialized by that scheduler.
//!
//! All times handled here are integer epoch seconds.

use std::collections::{BTreeMap, HashSet};

use alarmflow_core::rules::{AlarmConfig, UveAlarmInfo};
use serde::Serialize;
use tracing::{debug, info};

/// FSM state of one alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlarmState {
    Idle,
    SoakActive,
    Active,
    SoakIdle,
}

/// Identity of one alarm instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlarmId {
    pub table: String,
    pub key: String,
    pub name: String,
}

/// Soak and frequency parameters, fixed when the alarm record is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SoakParams {
    pub active_timer: u32,
    pub idle_timer: u32,
    pub freq_check_times: u32,
    pub freq_check_seconds: u32,
    pub freq_exceeded_check: bool,
}

impl From<&AlarmConfig> for SoakParams {
    fn from(cfg: &AlarmConfig) -> Self {
        Self {
            active_timer: cfg.active_timer,
            idle_timer: cfg.idle_timer,
            freq_check_times: cfg.freq_check_times,
            freq_check_seconds: cfg.freq_check_seconds,
            freq_exceeded_check: cfg.freq_exceeded_check,
        }
    }
}

/// Timer-index invariant violations. These are unrecoverable: the scanner
/// would loop or fire the wrong alarm, so the process must exit.
#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("timer index corrupt: duplicate {0:?} at {1}")]
    Duplicate(AlarmId, i64),
}

// ---------------------------------------------------------------------------
// TimerIndex
// ---------------------------------------------------------------------------

/// Global sorted map from absolute epoch seconds to the alarms due then.
#[derive(Debug, Default)]
pub struct TimerIndex {
    map: BTreeMap<i64, HashSet<AlarmId>>,
    last_run: Option<i64>,
}

impl TimerIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `id` at `at`.
    ///
    /// # Errors
    ///
    /// [`TimerError::Duplicate`] when the pair is already scheduled, which
    /// means the FSM lost track of a timer.
    pub fn add(&mut self, at: i64, id: AlarmId) -> Result<(), TimerError> {
        if !self.map.entry(at).or_default().insert(id.clone()) {
            return Err(TimerError::Duplicate(id, at));
        }
        Ok(())
    }

    pub fn remove(&mut self, at: i64, id: &AlarmId) {
        if let Some(set) = self.map.get_mut(&at) {
            set.remove(id);
            if set.is_empty() {
                self.map.remove(&at);
            }
        }
    }

    /// Drains every entry scheduled in `(last_run ..= now]`.
    pub fn due(&mut self, now: i64) -> Vec<(i64, AlarmId)> {
        let start = self.last_run.unwrap_or(now);
        let fired: Vec<i64> = self.map.range(start..=now).map(|(t, _)| *t).collect();
        let mut out = Vec::new();
        for t in fired {
            if let Some(set) = self.map.remove(&t) {
                out.extend(set.into_iter().map(|id| (t, id)));
            }
        }
        self.last_run = Some(now + 1);
        out
    }

    #[must_use]
    pub fn contains(&self, at: i64, id: &AlarmId) -> bool {
        self.map.get(&at).is_some_and(|s| s.contains(id))
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.map.values().map(HashSet::len).sum()
    }
}

// ---------------------------------------------------------------------------
// AlarmStateMachine
// ---------------------------------------------------------------------------

/// One alarm instance: FSM state, assertion ring buffer, pending timeouts
/// and the last published alarm payload.
#[derive(Debug)]
pub struct AlarmStateMachine {
    id: AlarmId,
    params: SoakParams,
    state: AlarmState,
    head: usize,
    stamps: Vec<i64>,
    info: Option<UveAlarmInfo>,
    active_timeout: Option<i64>,
    idle_timeout: Option<i64>,
    delete_timeout: Option<i64>,
}

impl AlarmStateMachine {
    #[must_use]
    pub fn new(id: AlarmId, params: SoakParams) -> Self {
        Self {
            id,
            params,
            state: AlarmState::Idle,
            head: 0,
            stamps: Vec::new(),
            info: None,
            active_timeout: None,
            idle_timeout: None,
            delete_timeout: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> AlarmState {
        self.state
    }

    #[must_use]
    pub fn params(&self) -> &SoakParams {
        &self.params
    }

    #[must_use]
    pub fn stamps(&self) -> (&[i64], usize) {
        (&self.stamps, self.head)
    }

    pub fn set_info(&mut self, info: UveAlarmInfo) {
        self.info = Some(info);
    }

    /// The publishable alarm payload: present only while the alarm is
    /// Active or Soak_Idle. Everything else is not yet asserted, or already
    /// cleared.
    #[must_use]
    pub fn info(&self) -> Option<&UveAlarmInfo> {
        match self.state {
            AlarmState::Active | AlarmState::SoakIdle => self.info.as_ref(),
            _ => None,
        }
    }

    /// The stored payload regardless of state (introspection).
    #[must_use]
    pub fn info_forced(&self) -> Option<&UveAlarmInfo> {
        self.info.as_ref()
    }

    pub fn info_mut(&mut self) -> Option<&mut UveAlarmInfo> {
        self.info.as_mut()
    }

    /// Structural equality gate for re-evaluations.
    ///
    /// Ordered comparisons only require equal `json_variables` (their
    /// matched values drift without changing what the alarm means). Returns
    /// `true` only while Active, so a soaking alarm still refreshes its
    /// payload.
    #[must_use]
    pub fn is_same_alarm(&self, new: &UveAlarmInfo) -> bool {
        let Some(old) = &self.info else {
            return false;
        };
        let old_or = old.rules.as_deref().unwrap_or(&[]);
        let new_or = new.rules.as_deref().unwrap_or(&[]);
        if old_or.len() != new_or.len() {
            return false;
        }
        for (old_term, new_term) in old_or.iter().zip(new_or.iter()) {
            if old_term.and_list.len() != new_term.and_list.len() {
                return false;
            }
            for (old_and, new_and) in old_term.and_list.iter().zip(new_term.and_list.iter()) {
                if old_and.condition != new_and.condition
                    || old_and.match_list.len() != new_and.match_list.len()
                {
                    return false;
                }
                if old_and.condition.operation.is_ordered() {
                    for (om, nm) in old_and.match_list.iter().zip(new_and.match_list.iter()) {
                        if om.json_variables != nm.json_variables {
                            return false;
                        }
                    }
                } else if old_and.match_list != new_and.match_list {
                    return false;
                }
            }
        }
        self.state == AlarmState::Active
    }

    fn record_stamp(&mut self, ts: i64) {
        let size = self.params.freq_check_times as usize + 1;
        if self.stamps.len() <= self.head {
            self.stamps.push(ts);
        } else {
            self.stamps[self.head] = ts;
        }
        self.head = (self.head + 1) % size;
    }

    /// Whether the assertion ring shows the alarm flapping: buffer full and
    /// the window from oldest to newest stamp fits in `freq_check_seconds`.
    #[must_use]
    pub fn frequency_exceeded(&self) -> bool {
        let p = &self.params;
        if !p.freq_exceeded_check || p.freq_check_times == 0 || p.freq_check_seconds == 0 {
            return false;
        }
        let size = p.freq_check_times as usize + 1;
        if self.stamps.len() < size {
            return false;
        }
        let oldest = self.stamps[self.head % size];
        let newest = self.stamps[(self.head + size - 1) % size];
        if newest - oldest <= i64::from(p.freq_check_seconds) {
            info!(id = ?self.id, "alarm frequency exceeded; raising immediately");
            return true;
        }
        false
    }

    /// Runs the assert transition. The payload (with its timestamp) must be
    /// set first.
    pub fn assert_alarm(&mut self, timers: &mut TimerIndex, now: i64) -> Result<(), TimerError> {
        let old = self.state;
        match self.state {
            AlarmState::SoakIdle => {
                self.state = AlarmState::Active;
                if let Some(t) = self.idle_timeout.take() {
                    timers.remove(t, &self.id);
                }
            }
            AlarmState::Idle => {
                if let Some(t) = self.delete_timeout.take() {
                    timers.remove(t, &self.id);
                }
                if self.params.freq_exceeded_check {
                    let ts = self.info.as_ref().map_or(0, |i| i.timestamp / 1_000_000);
                    self.record_stamp(ts);
                }
                if self.params.active_timer == 0 || self.frequency_exceeded() {
                    self.state = AlarmState::Active;
                } else {
                    self.state = AlarmState::SoakActive;
                    let at = now + i64::from(self.params.active_timer);
                    self.active_timeout = Some(at);
                    timers.add(at, self.id.clone())?;
                }
            }
            AlarmState::Active | AlarmState::SoakActive => {}
        }
        self.trace_change(old);
        Ok(())
    }

    /// Runs the clear transition. Returns `true` when the caller should
    /// destroy the alarm record.
    pub fn clear_alarm(&mut self, timers: &mut TimerIndex, now: i64) -> Result<bool, TimerError> {
        let old = self.state;
        let mut delete = false;
        match self.state {
            AlarmState::SoakActive => {
                self.state = AlarmState::Idle;
                if let Some(t) = self.active_timeout.take() {
                    timers.remove(t, &self.id);
                }
                delete = self.schedule_delete(timers, now)?;
            }
            AlarmState::Active => {
                if self.params.idle_timer == 0 {
                    self.state = AlarmState::Idle;
                    delete = self.schedule_delete(timers, now)?;
                } else {
                    self.state = AlarmState::SoakIdle;
                    let at = now + i64::from(self.params.idle_timer);
                    self.idle_timeout = Some(at);
                    timers.add(at, self.id.clone())?;
                }
            }
            AlarmState::Idle | AlarmState::SoakIdle => {}
        }
        self.trace_change(old);
        Ok(delete)
    }

    /// Entering Idle either retains the record for the frequency window or
    /// asks the caller to delete it right away.
    fn schedule_delete(&mut self, timers: &mut TimerIndex, now: i64) -> Result<bool, TimerError> {
        if self.params.freq_check_seconds > 0 {
            let at = now + i64::from(self.params.freq_check_seconds);
            self.delete_timeout = Some(at);
            timers.add(at, self.id.clone())?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Handles a fired timer. Returns `(delete, update)`: `update` means the
    /// alarm set changed and must be re-published.
    pub fn run_soak_timer(
        &mut self,
        timers: &mut TimerIndex,
        now: i64,
    ) -> Result<(bool, bool), TimerError> {
        let old = self.state;
        let mut delete = false;
        let mut update = false;
        match self.state {
            AlarmState::SoakActive => {
                if self.active_timeout.is_none_or(|t| now >= t) {
                    self.state = AlarmState::Active;
                    self.active_timeout = None;
                    update = true;
                }
            }
            AlarmState::SoakIdle => {
                if self.idle_timeout.is_none_or(|t| now >= t) {
                    self.state = AlarmState::Idle;
                    self.idle_timeout = None;
                    delete = self.schedule_delete(timers, now)?;
                    update = true;
                }
            }
            AlarmState::Idle => {
                if self.delete_timeout.is_some_and(|t| now >= t) {
                    self.delete_timeout = None;
                    delete = true;
                }
            }
            AlarmState::Active => {}
        }
        self.trace_change(old);
        Ok((delete, update))
    }

    /// Cancels whatever timer the current state may hold. Used when the
    /// record is destroyed outside the FSM (partition release, UVE gone).
    pub fn delete_timers(&mut self, timers: &mut TimerIndex) {
        match self.state {
            AlarmState::Idle => {
                if let Some(t) = self.delete_timeout.take() {
                    timers.remove(t, &self.id);
                }
            }
            AlarmState::SoakActive => {
                if let Some(t) = self.active_timeout.take() {
                    timers.remove(t, &self.id);
                }
            }
            AlarmState::SoakIdle => {
                if let Some(t) = self.idle_timeout.take() {
                    timers.remove(t, &self.id);
                }
            }
            AlarmState::Active => {}
        }
    }

    fn trace_change(&self, old: AlarmState) {
        if old != self.state {
            debug!(id = ?self.id, ?old, new = ?self.state, "alarm state change");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use alarmflow_core::rules::AlarmAndList;

    use super::*;

    fn id() -> AlarmId {
        AlarmId {
            table: "t".to_string(),
            key: "t:k1".to_string(),
            name: "a1".to_string(),
        }
    }

    fn params(active: u32, idle: u32, times: u32, seconds: u32, freq: bool) -> SoakParams {
        SoakParams {
            active_timer: active,
            idle_timer: idle,
            freq_check_times: times,
            freq_check_seconds: seconds,
            freq_exceeded_check: freq,
        }
    }

    fn info_at(us: i64) -> UveAlarmInfo {
        UveAlarmInfo {
            alarm_type: "a1".to_string(),
            severity: 1,
            timestamp: us,
            token: String::new(),
            rules: Some(vec![AlarmAndList { and_list: vec![] }]),
            description: String::new(),
            ack: false,
        }
    }

    fn asm_with(p: SoakParams) -> (AlarmStateMachine, TimerIndex) {
        (AlarmStateMachine::new(id(), p), TimerIndex::new())
    }

    // -- basic transitions --

    #[test]
    fn zero_active_timer_promotes_immediately() {
        let (mut asm, mut timers) = asm_with(params(0, 0, 0, 0, false));
        asm.set_info(info_at(1_000_000));
        asm.assert_alarm(&mut timers, 1).unwrap();
        assert_eq!(asm.state(), AlarmState::Active);
        assert!(asm.info().is_some());
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn nonzero_active_timer_soaks_first() {
        let (mut asm, mut timers) = asm_with(params(5, 0, 0, 0, false));
        asm.set_info(info_at(1_000_000));
        asm.assert_alarm(&mut timers, 100).unwrap();
        assert_eq!(asm.state(), AlarmState::SoakActive);
        // Not yet publishable.
        assert!(asm.info().is_none());
        assert!(timers.contains(105, &id()));
    }

    #[test]
    fn soak_active_timer_fires_into_active() {
        let (mut asm, mut timers) = asm_with(params(5, 0, 0, 0, false));
        asm.set_info(info_at(1_000_000));
        asm.assert_alarm(&mut timers, 100).unwrap();

        let due = timers.due(105);
        assert_eq!(due.len(), 1);
        let (delete, update) = asm.run_soak_timer(&mut timers, 105).unwrap();
        assert!(!delete);
        assert!(update);
        assert_eq!(asm.state(), AlarmState::Active);
    }

    #[test]
    fn clear_during_active_soak_returns_to_idle() {
        let (mut asm, mut timers) = asm_with(params(5, 0, 0, 0, false));
        asm.set_info(info_at(0));
        asm.assert_alarm(&mut timers, 100).unwrap();
        let delete = asm.clear_alarm(&mut timers, 103).unwrap();
        assert_eq!(asm.state(), AlarmState::Idle);
        // No frequency window configured: destroy right away.
        assert!(delete);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn clear_active_with_idle_timer_soaks() {
        let (mut asm, mut timers) = asm_with(params(0, 7, 0, 0, false));
        asm.set_info(info_at(0));
        asm.assert_alarm(&mut timers, 100).unwrap();
        assert!(!asm.clear_alarm(&mut timers, 200).unwrap());
        assert_eq!(asm.state(), AlarmState::SoakIdle);
        // Still publishable while soaking towards Idle.
        assert!(asm.info().is_some());
        assert!(timers.contains(207, &id()));

        // Re-assert cancels the idle soak.
        asm.assert_alarm(&mut timers, 203).unwrap();
        assert_eq!(asm.state(), AlarmState::Active);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn idle_soak_expiry_schedules_delete_window() {
        let (mut asm, mut timers) = asm_with(params(0, 7, 3, 30, false));
        asm.set_info(info_at(0));
        asm.assert_alarm(&mut timers, 100).unwrap();
        asm.clear_alarm(&mut timers, 200).unwrap();

        timers.due(207);
        let (delete, update) = asm.run_soak_timer(&mut timers, 207).unwrap();
        assert!(!delete);
        assert!(update);
        assert_eq!(asm.state(), AlarmState::Idle);
        // Record retained for the frequency window.
        assert!(timers.contains(237, &id()));

        timers.due(237);
        let (delete, _) = asm.run_soak_timer(&mut timers, 237).unwrap();
        assert!(delete);
    }

    // -- frequency window --

    #[test]
    fn frequency_window_bypasses_soak_on_nth_assert() {
        // 4 asserts within 30s: FreqCheck_Times=3 means the 4th fires.
        let (mut asm, mut timers) = asm_with(params(10, 0, 3, 30, true));
        for (i, t) in [0_i64, 5, 10, 15].iter().enumerate() {
            // Prior rounds cleared back to Idle.
            asm.set_info(info_at(t * 1_000_000));
            asm.assert_alarm(&mut timers, *t).unwrap();
            if i < 3 {
                assert_eq!(asm.state(), AlarmState::SoakActive, "assert {i}");
                asm.clear_alarm(&mut timers, *t + 1).unwrap();
            }
        }
        assert_eq!(asm.state(), AlarmState::Active);
    }

    #[test]
    fn slow_assertions_keep_soaking() {
        let (mut asm, mut timers) = asm_with(params(10, 0, 3, 30, true));
        for t in [0_i64, 40, 80, 120] {
            asm.set_info(info_at(t * 1_000_000));
            asm.assert_alarm(&mut timers, t).unwrap();
            assert_eq!(asm.state(), AlarmState::SoakActive);
            asm.clear_alarm(&mut timers, t + 1).unwrap();
        }
    }

    #[test]
    fn window_resets_after_quiet_period() {
        let (mut asm, mut timers) = asm_with(params(10, 0, 2, 10, true));
        // Fill the ring inside the window, then go quiet past it.
        for t in [0_i64, 3, 6] {
            asm.set_info(info_at(t * 1_000_000));
            asm.assert_alarm(&mut timers, t).unwrap();
            if asm.state() == AlarmState::SoakActive {
                asm.clear_alarm(&mut timers, t + 1).unwrap();
            }
        }
        assert_eq!(asm.state(), AlarmState::Active);
        asm.clear_alarm(&mut timers, 7).unwrap();
        timers.due(7 + 10);
        asm.run_soak_timer(&mut timers, 17).unwrap();

        // A fresh assert long after the window soaks again.
        let (mut asm2, mut timers2) = asm_with(params(10, 0, 2, 10, true));
        for t in [100_i64, 130, 160] {
            asm2.set_info(info_at(t * 1_000_000));
            asm2.assert_alarm(&mut timers2, t).unwrap();
            assert_eq!(asm2.state(), AlarmState::SoakActive);
            asm2.clear_alarm(&mut timers2, t + 1).unwrap();
        }
    }

    // -- equality gate --

    #[test]
    fn same_alarm_suppressed_only_while_active() {
        let (mut asm, mut timers) = asm_with(params(0, 0, 0, 0, false));
        asm.set_info(info_at(1_000_000));
        asm.assert_alarm(&mut timers, 1).unwrap();
        assert!(asm.is_same_alarm(&info_at(2_000_000)));

        let (mut soaking, mut t2) = asm_with(params(5, 0, 0, 0, false));
        soaking.set_info(info_at(1_000_000));
        soaking.assert_alarm(&mut t2, 1).unwrap();
        assert!(!soaking.is_same_alarm(&info_at(2_000_000)));
    }

    #[test]
    fn different_rule_shape_is_not_same() {
        let (mut asm, mut timers) = asm_with(params(0, 0, 0, 0, false));
        asm.set_info(info_at(1_000_000));
        asm.assert_alarm(&mut timers, 1).unwrap();
        let mut other = info_at(2_000_000);
        other.rules = Some(vec![
            AlarmAndList { and_list: vec![] },
            AlarmAndList { and_list: vec![] },
        ]);
        assert!(!asm.is_same_alarm(&other));
    }

    // -- timer index --

    #[test]
    fn duplicate_timer_registration_is_corruption() {
        let mut timers = TimerIndex::new();
        timers.add(10, id()).unwrap();
        assert!(timers.add(10, id()).is_err());
    }

    #[test]
    fn due_covers_missed_seconds_once() {
        let mut timers = TimerIndex::new();
        timers.add(10, id()).unwrap();
        // Scanner starts late: the first scan anchors at `now`.
        assert!(timers.due(5).is_empty());
        let fired = timers.due(12);
        assert_eq!(fired.len(), 1);
        // Nothing fires twice.
        assert!(timers.due(20).is_empty());
    }
}
