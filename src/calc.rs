use crate::model::{AttendanceRecord, AttendanceStatus, Student, WeeklyTestMark};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Half-up rounding to one decimal place: `floor(10*x + 0.5) / 10`.
pub fn round_1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn percentage_of(part: usize, whole: usize) -> f64 {
    if whole > 0 {
        100.0 * (part as f64) / (whole as f64)
    } else {
        0.0
    }
}

pub fn mark_percentage(marks_obtained: f64, total_marks: f64) -> f64 {
    if total_marks > 0.0 {
        100.0 * marks_obtained / total_marks
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub student_id: String,
    pub student_name: String,
    pub total_days: usize,
    pub present_days: usize,
    pub percentage: f64,
}

pub fn attendance_summary_for(records: &[AttendanceRecord], student: &Student) -> AttendanceSummary {
    let mut total_days = 0;
    let mut present_days = 0;
    for r in records.iter().filter(|r| r.student_id == student.id) {
        total_days += 1;
        if r.status == AttendanceStatus::Present {
            present_days += 1;
        }
    }
    AttendanceSummary {
        student_id: student.id.clone(),
        student_name: student.name.clone(),
        total_days,
        present_days,
        percentage: percentage_of(present_days, total_days),
    }
}

/// One summary per student, in the order the students were given.
pub fn attendance_summaries(records: &[AttendanceRecord], students: &[Student]) -> Vec<AttendanceSummary> {
    students
        .iter()
        .map(|s| attendance_summary_for(records, s))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Grade {
    APlus,
    A,
    BPlus,
    B,
    C,
    D,
    F,
}

impl Grade {
    pub const ALL: [Grade; 7] = [
        Grade::APlus,
        Grade::A,
        Grade::BPlus,
        Grade::B,
        Grade::C,
        Grade::D,
        Grade::F,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Grade::APlus => "A+",
            Grade::A => "A",
            Grade::BPlus => "B+",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::F => "F",
        }
    }
}

impl Serialize for Grade {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.label())
    }
}

pub fn grade_for(percentage: f64) -> Grade {
    if percentage >= 90.0 {
        Grade::APlus
    } else if percentage >= 80.0 {
        Grade::A
    } else if percentage >= 70.0 {
        Grade::BPlus
    } else if percentage >= 60.0 {
        Grade::B
    } else if percentage >= 50.0 {
        Grade::C
    } else if percentage >= 40.0 {
        Grade::D
    } else {
        Grade::F
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceBand {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandThresholds {
    pub low_below: f64,
    pub high_from: f64,
}

impl Default for BandThresholds {
    fn default() -> Self {
        Self {
            low_below: 75.0,
            high_from: 90.0,
        }
    }
}

pub fn attendance_band(percentage: f64, t: BandThresholds) -> AttendanceBand {
    if percentage < t.low_below {
        AttendanceBand::Low
    } else if percentage >= t.high_from {
        AttendanceBand::High
    } else {
        AttendanceBand::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPerformance {
    pub subject: String,
    pub average_percentage: f64,
    pub test_count: usize,
    pub student_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBucket {
    pub grade: Grade,
    pub count: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassPerformance {
    pub overall_average: f64,
    pub total_tests: usize,
    pub active_students: usize,
    pub total_students: usize,
    pub subjects: Vec<SubjectPerformance>,
    pub grade_distribution: Vec<GradeBucket>,
}

#[derive(Default)]
struct SubjectAcc<'a> {
    obtained: f64,
    possible: f64,
    tests: usize,
    students: HashSet<&'a str>,
}

/// Aggregate marks into per-subject averages and a grade distribution.
/// Averages are ratio-of-sums, not mean-of-percentages.
pub fn class_performance(marks: &[WeeklyTestMark], total_students: usize) -> Option<ClassPerformance> {
    if marks.is_empty() || total_students == 0 {
        return None;
    }

    let mut by_subject: BTreeMap<&str, SubjectAcc> = BTreeMap::new();
    let mut grade_counts: BTreeMap<Grade, usize> = BTreeMap::new();
    let mut active: HashSet<&str> = HashSet::new();
    let mut obtained = 0.0;
    let mut possible = 0.0;

    for m in marks {
        let acc = by_subject.entry(m.subject.as_str()).or_default();
        acc.obtained += m.marks_obtained;
        acc.possible += m.total_marks;
        acc.tests += 1;
        acc.students.insert(m.student_id.as_str());

        *grade_counts.entry(grade_for(m.percentage())).or_insert(0) += 1;
        active.insert(m.student_id.as_str());
        obtained += m.marks_obtained;
        possible += m.total_marks;
    }

    let subjects = by_subject
        .into_iter()
        .map(|(subject, acc)| SubjectPerformance {
            subject: subject.to_string(),
            average_percentage: mark_percentage(acc.obtained, acc.possible),
            test_count: acc.tests,
            student_count: acc.students.len(),
        })
        .collect();

    let grade_distribution = Grade::ALL
        .iter()
        .map(|g| {
            let count = grade_counts.get(g).copied().unwrap_or(0);
            GradeBucket {
                grade: *g,
                count,
                percentage: percentage_of(count, marks.len()),
            }
        })
        .collect();

    Some(ClassPerformance {
        overall_average: mark_percentage(obtained, possible),
        total_tests: marks.len(),
        active_students: active.len(),
        total_students,
        subjects,
        grade_distribution,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub week: String,
    pub week_number: u32,
    pub year: i32,
    pub subject: String,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub percentage: f64,
    pub test_date: chrono::NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTrend {
    pub points: Vec<TrendPoint>,
    pub average_percentage: f64,
    pub trend: TrendDirection,
    pub change: f64,
}

pub fn student_trend(marks: &[WeeklyTestMark], student_id: &str) -> StudentTrend {
    let mut own: Vec<&WeeklyTestMark> = marks.iter().filter(|m| m.student_id == student_id).collect();
    own.sort_by(|a, b| {
        (a.year, a.week_number, a.test_date).cmp(&(b.year, b.week_number, b.test_date))
    });

    let points: Vec<TrendPoint> = own
        .iter()
        .map(|m| TrendPoint {
            week: format!("W{}", m.week_number),
            week_number: m.week_number,
            year: m.year,
            subject: m.subject.clone(),
            marks_obtained: m.marks_obtained,
            total_marks: m.total_marks,
            percentage: m.percentage(),
            test_date: m.test_date,
        })
        .collect();

    let pcts: Vec<f64> = points.iter().map(|p| p.percentage).collect();
    let average_percentage = mean(&pcts).unwrap_or(0.0);

    let (trend, change) = if pcts.len() < 2 {
        (TrendDirection::Neutral, 0.0)
    } else {
        let recent_start = pcts.len().saturating_sub(3);
        let earlier_start = pcts.len().saturating_sub(6);
        let recent = &pcts[recent_start..];
        let earlier = &pcts[earlier_start..recent_start];
        match (mean(recent), mean(earlier)) {
            (Some(r), Some(e)) => {
                // Whole points, half rounding up, so a sub-point wobble is neutral.
                let delta = (r - e + 0.5).floor();
                let dir = if delta > 0.0 {
                    TrendDirection::Up
                } else if delta < 0.0 {
                    TrendDirection::Down
                } else {
                    TrendDirection::Neutral
                };
                (dir, delta.abs())
            }
            _ => (TrendDirection::Neutral, 0.0),
        }
    };

    StudentTrend {
        points,
        average_percentage,
        trend,
        change,
    }
}

fn mean(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        None
    } else {
        Some(xs.iter().sum::<f64>() / xs.len() as f64)
    }
}
