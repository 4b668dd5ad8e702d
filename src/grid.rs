//! Monthly attendance grid with a local edit buffer.
//!
//! Clicks are buffered as pending changes against a snapshot of the store and
//! only reach the store on `flush`. Month navigation is refused while the
//! buffer is dirty.

use crate::calc::percentage_of;
use crate::model::{AttendanceRecord, AttendanceStatus, Student};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Write side of the store as seen by the grid.
pub trait AttendanceStore {
    fn mark(&mut self, student_id: &str, date: NaiveDate, status: AttendanceStatus) -> anyhow::Result<()>;
    fn unmark(&mut self, student_id: &str, date: NaiveDate) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Parses `YYYY-MM`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (y, m) = raw.trim().split_once('-')?;
        Self::new(y.parse().ok()?, m.parse().ok()?)
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MIN)
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self { year: self.year + 1, month: 1 }
        } else {
            Self { year: self.year, month: self.month + 1 }
        }
    }

    pub fn prev(self) -> Self {
        if self.month == 1 {
            Self { year: self.year - 1, month: 12 }
        } else {
            Self { year: self.year, month: self.month - 1 }
        }
    }

    pub fn contains(self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    pub fn days(self) -> Vec<NaiveDate> {
        self.first_day()
            .iter_days()
            .take_while(|d| self.contains(*d))
            .collect()
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Unmarked,
    Present,
    Absent,
}

impl CellStatus {
    pub fn next(self) -> Self {
        match self {
            Self::Unmarked => Self::Present,
            Self::Present => Self::Absent,
            Self::Absent => Self::Unmarked,
        }
    }

    pub fn code(self) -> char {
        match self {
            Self::Unmarked => '-',
            Self::Present => 'P',
            Self::Absent => 'A',
        }
    }

    fn from_stored(status: Option<AttendanceStatus>) -> Self {
        match status {
            Some(AttendanceStatus::Present) => Self::Present,
            Some(AttendanceStatus::Absent) => Self::Absent,
            None => Self::Unmarked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Mark(AttendanceStatus),
    Remove,
}

impl PendingChange {
    fn resulting(self) -> Option<AttendanceStatus> {
        match self {
            Self::Mark(s) => Some(s),
            Self::Remove => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub student_id: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("{count} unsaved attendance change(s); save or discard them first")]
    UnsavedChanges { count: usize },
    #[error("{date} is outside the visible month {month}")]
    OutsideMonth { date: NaiveDate, month: YearMonth },
    #[error("student {0} is not in this grid")]
    UnknownStudent(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthStats {
    pub present_days: usize,
    pub absent_days: usize,
    pub total_marked: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushFailure {
    pub student_id: String,
    pub date: NaiveDate,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    pub applied: usize,
    pub failed: Vec<FlushFailure>,
}

#[derive(Debug, Clone)]
pub struct AttendanceGrid {
    month: YearMonth,
    students: Vec<Student>,
    snapshot: HashMap<CellKey, AttendanceStatus>,
    pending: BTreeMap<CellKey, PendingChange>,
}

impl AttendanceGrid {
    /// Builds a clean grid. Records outside `month` or for students not in
    /// `students` are ignored.
    pub fn load(month: YearMonth, students: Vec<Student>, records: &[AttendanceRecord]) -> Self {
        let mut grid = Self {
            month,
            students,
            snapshot: HashMap::new(),
            pending: BTreeMap::new(),
        };
        grid.replace_snapshot(month, records);
        grid
    }

    fn replace_snapshot(&mut self, month: YearMonth, records: &[AttendanceRecord]) {
        self.month = month;
        self.snapshot.clear();
        for r in records {
            if !month.contains(r.date) || !self.has_student(&r.student_id) {
                continue;
            }
            self.snapshot.insert(
                CellKey {
                    student_id: r.student_id.clone(),
                    date: r.date,
                },
                r.status,
            );
        }
    }

    pub fn month(&self) -> YearMonth {
        self.month
    }

    pub fn students(&self) -> &[Student] {
        &self.students
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.month.days()
    }

    fn has_student(&self, student_id: &str) -> bool {
        self.students.iter().any(|s| s.id == student_id)
    }

    fn check_cell(&self, student_id: &str, date: NaiveDate) -> Result<CellKey, GridError> {
        if !self.month.contains(date) {
            return Err(GridError::OutsideMonth {
                date,
                month: self.month,
            });
        }
        if !self.has_student(student_id) {
            return Err(GridError::UnknownStudent(student_id.to_string()));
        }
        Ok(CellKey {
            student_id: student_id.to_string(),
            date,
        })
    }

    fn effective(&self, key: &CellKey) -> Option<AttendanceStatus> {
        match self.pending.get(key) {
            Some(change) => change.resulting(),
            None => self.snapshot.get(key).copied(),
        }
    }

    pub fn status_at(&self, student_id: &str, date: NaiveDate) -> CellStatus {
        let key = CellKey {
            student_id: student_id.to_string(),
            date,
        };
        CellStatus::from_stored(self.effective(&key))
    }

    /// Advances one cell by one step of unmarked -> present -> absent -> unmarked.
    pub fn cycle(&mut self, student_id: &str, date: NaiveDate) -> Result<CellStatus, GridError> {
        let key = self.check_cell(student_id, date)?;
        let next = CellStatus::from_stored(self.effective(&key)).next();
        let wanted = match next {
            CellStatus::Present => Some(AttendanceStatus::Present),
            CellStatus::Absent => Some(AttendanceStatus::Absent),
            CellStatus::Unmarked => None,
        };

        if self.snapshot.get(&key).copied() == wanted {
            self.pending.remove(&key);
        } else {
            let change = match wanted {
                Some(s) => PendingChange::Mark(s),
                None => PendingChange::Remove,
            };
            self.pending.insert(key, change);
        }
        Ok(next)
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> impl Iterator<Item = (&CellKey, &PendingChange)> {
        self.pending.iter()
    }

    /// Guard for month changes. The caller reloads the snapshot via
    /// [`AttendanceGrid::reload`] once this succeeds.
    pub fn navigate(&self, target: YearMonth) -> Result<YearMonth, GridError> {
        if self.is_dirty() {
            return Err(GridError::UnsavedChanges {
                count: self.pending.len(),
            });
        }
        Ok(target)
    }

    pub fn reload(
        &mut self,
        month: YearMonth,
        students: Vec<Student>,
        records: &[AttendanceRecord],
    ) -> Result<(), GridError> {
        self.navigate(month)?;
        self.students = students;
        self.replace_snapshot(month, records);
        Ok(())
    }

    pub fn discard(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    /// Folds a write made outside the grid into the snapshot. Cells outside
    /// the visible month or student set are ignored, as are cells with a
    /// pending change. Returns whether the snapshot changed.
    pub fn apply_external(
        &mut self,
        student_id: &str,
        date: NaiveDate,
        status: Option<AttendanceStatus>,
    ) -> bool {
        let Ok(key) = self.check_cell(student_id, date) else {
            return false;
        };
        if self.pending.contains_key(&key) {
            return false;
        }
        match status {
            Some(s) => self.snapshot.insert(key, s) != Some(s),
            None => self.snapshot.remove(&key).is_some(),
        }
    }

    /// Sends every pending change to the store, one call each, in
    /// (student, date) order. Failures stay pending; there is no rollback.
    pub fn flush<S: AttendanceStore + ?Sized>(&mut self, store: &mut S) -> FlushReport {
        let mut report = FlushReport::default();
        let keys: Vec<CellKey> = self.pending.keys().cloned().collect();

        for key in keys {
            let Some(change) = self.pending.get(&key).copied() else {
                continue;
            };
            let res = match change {
                PendingChange::Mark(status) => store.mark(&key.student_id, key.date, status),
                PendingChange::Remove => store.unmark(&key.student_id, key.date),
            };
            match res {
                Ok(()) => {
                    match change {
                        PendingChange::Mark(status) => {
                            self.snapshot.insert(key.clone(), status);
                        }
                        PendingChange::Remove => {
                            self.snapshot.remove(&key);
                        }
                    }
                    self.pending.remove(&key);
                    report.applied += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        student_id = %key.student_id,
                        date = %key.date,
                        error = %e,
                        "attendance change not saved"
                    );
                    report.failed.push(FlushFailure {
                        student_id: key.student_id.clone(),
                        date: key.date,
                        message: e.to_string(),
                    });
                }
            }
        }
        report
    }

    /// Monthly counts for one student over the buffered view.
    pub fn month_stats(&self, student_id: &str) -> MonthStats {
        let mut present_days = 0;
        let mut absent_days = 0;
        for date in self.month.days() {
            match self.status_at(student_id, date) {
                CellStatus::Present => present_days += 1,
                CellStatus::Absent => absent_days += 1,
                CellStatus::Unmarked => {}
            }
        }
        let total_marked = present_days + absent_days;
        MonthStats {
            present_days,
            absent_days,
            total_marked,
            percentage: percentage_of(present_days, total_marked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Gender;

    fn student(id: &str) -> Student {
        Student {
            id: id.to_string(),
            name: id.to_uppercase(),
            class: "7".to_string(),
            subjects: vec!["English".to_string()],
            gender: Gender::Female,
            parent_phone: None,
            school_name: None,
            assigned_staff_id: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn feb() -> YearMonth {
        YearMonth::new(2026, 2).unwrap()
    }

    #[derive(Default)]
    struct FakeStore {
        calls: Vec<String>,
        fail_for: Option<String>,
    }

    impl AttendanceStore for FakeStore {
        fn mark(&mut self, student_id: &str, date: NaiveDate, status: AttendanceStatus) -> anyhow::Result<()> {
            if self.fail_for.as_deref() == Some(student_id) {
                anyhow::bail!("network down");
            }
            self.calls.push(format!("mark {student_id} {date} {}", status.as_str()));
            Ok(())
        }

        fn unmark(&mut self, student_id: &str, date: NaiveDate) -> anyhow::Result<()> {
            if self.fail_for.as_deref() == Some(student_id) {
                anyhow::bail!("network down");
            }
            self.calls.push(format!("unmark {student_id} {date}"));
            Ok(())
        }
    }

    #[test]
    fn three_clicks_cycle_back_to_unmarked() {
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[]);
        assert_eq!(g.status_at("a", day(3)), CellStatus::Unmarked);
        assert_eq!(g.cycle("a", day(3)).unwrap(), CellStatus::Present);
        assert_eq!(g.cycle("a", day(3)).unwrap(), CellStatus::Absent);
        assert_eq!(g.cycle("a", day(3)).unwrap(), CellStatus::Unmarked);
        // Back at the snapshot value, so nothing to save.
        assert!(!g.is_dirty());
    }

    #[test]
    fn cycling_a_stored_cell_buffers_a_removal() {
        let rec = AttendanceRecord {
            id: "r1".into(),
            student_id: "a".into(),
            date: day(5),
            status: AttendanceStatus::Absent,
        };
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[rec]);
        assert_eq!(g.cycle("a", day(5)).unwrap(), CellStatus::Unmarked);
        let pending: Vec<_> = g.pending().collect();
        assert_eq!(pending.len(), 1);
        assert_eq!(*pending[0].1, PendingChange::Remove);
    }

    #[test]
    fn navigation_blocked_while_dirty() {
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[]);
        g.cycle("a", day(1)).unwrap();
        let err = g.navigate(feb().next()).unwrap_err();
        assert_eq!(err, GridError::UnsavedChanges { count: 1 });
        assert_eq!(g.month(), feb());

        g.discard();
        assert_eq!(g.navigate(feb().next()).unwrap(), YearMonth::new(2026, 3).unwrap());
    }

    #[test]
    fn external_writes_refresh_the_snapshot() {
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[]);
        assert!(g.apply_external("a", day(5), Some(AttendanceStatus::Absent)));
        assert_eq!(g.status_at("a", day(5)), CellStatus::Absent);
        assert_eq!(g.month_stats("a").absent_days, 1);

        // Cycling from the refreshed value reaches unmarked as a real removal.
        assert_eq!(g.cycle("a", day(5)).unwrap(), CellStatus::Unmarked);
        assert_eq!(g.pending_count(), 1);

        // Pending cells and cells outside the grid are left alone.
        assert!(!g.apply_external("a", day(5), Some(AttendanceStatus::Present)));
        assert!(!g.apply_external("zz", day(5), Some(AttendanceStatus::Present)));
        let march = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(!g.apply_external("a", march, Some(AttendanceStatus::Present)));

        assert!(g.apply_external("a", day(6), Some(AttendanceStatus::Present)));
        assert!(g.apply_external("a", day(6), None));
        assert_eq!(g.status_at("a", day(6)), CellStatus::Unmarked);
    }

    #[test]
    fn rejects_cells_outside_month_or_grid() {
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[]);
        let march = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        assert!(matches!(g.cycle("a", march), Err(GridError::OutsideMonth { .. })));
        assert!(matches!(g.cycle("zz", day(2)), Err(GridError::UnknownStudent(_))));
    }

    #[test]
    fn stats_reflect_pending_edits() {
        let rec = AttendanceRecord {
            id: "r1".into(),
            student_id: "a".into(),
            date: day(2),
            status: AttendanceStatus::Present,
        };
        let mut g = AttendanceGrid::load(feb(), vec![student("a")], &[rec]);
        g.cycle("a", day(3)).unwrap();
        g.cycle("a", day(4)).unwrap();
        g.cycle("a", day(4)).unwrap();
        let st = g.month_stats("a");
        assert_eq!(st.present_days, 2);
        assert_eq!(st.absent_days, 1);
        assert_eq!(st.total_marked, 3);
        assert!((st.percentage - 66.666).abs() < 0.01);
    }

    #[test]
    fn partial_flush_keeps_failures_pending() {
        let mut g = AttendanceGrid::load(feb(), vec![student("a"), student("b")], &[]);
        g.cycle("a", day(1)).unwrap();
        g.cycle("b", day(1)).unwrap();
        g.cycle("a", day(2)).unwrap();

        let mut store = FakeStore {
            fail_for: Some("b".into()),
            ..Default::default()
        };
        let report = g.flush(&mut store);
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].student_id, "b");
        assert_eq!(g.pending_count(), 1);
        assert_eq!(store.calls.len(), 2);
        assert_eq!(g.status_at("a", day(1)), CellStatus::Present);

        store.fail_for = None;
        let report = g.flush(&mut store);
        assert_eq!(report.applied, 1);
        assert!(!g.is_dirty());
    }

    #[test]
    fn month_helpers() {
        let feb = YearMonth::parse("2028-02").unwrap();
        assert_eq!(feb.days().len(), 29);
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2028, 2, 29).unwrap());
        assert_eq!(YearMonth::parse("2026-12").unwrap().next().to_string(), "2027-01");
        assert_eq!(YearMonth::parse("2026-01").unwrap().prev().to_string(), "2025-12");
        assert!(YearMonth::parse("2026-13").is_none());
    }
}
