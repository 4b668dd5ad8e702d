//! Weekly class timetables and the weekend test schedule for derived groups.

use crate::groups::Group;
use chrono::{Datelike, Duration, NaiveDate, Weekday};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

pub const DAYS: [&str; 5] = ["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];

pub const TIME_SLOTS: [&str; 7] = [
    "09:00-09:45",
    "09:45-10:30",
    "10:45-11:30",
    "11:30-12:15",
    "13:00-13:45",
    "13:45-14:30",
    "14:30-15:15",
];

pub const TEST_SITTINGS: [(&str, &str); 2] = [("10:00", "11:30"), ("14:00", "15:30")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Policy {
    RoundRobin,
    Fair,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "roundRobin",
            Self::Fair => "fair",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "roundRobin" | "round_robin" => Some(Self::RoundRobin),
            "fair" => Some(Self::Fair),
            _ => None,
        }
    }
}

/// The set of students a timetable is planned for.
#[derive(Debug, Clone)]
pub struct Cohort {
    pub id: String,
    pub name: String,
    /// Sorted union of every member's subjects.
    pub subjects: Vec<String>,
    members: Vec<BTreeSet<String>>,
}

impl Cohort {
    pub fn from_group(group: &Group) -> Self {
        Self {
            id: group.id.clone(),
            name: group.name.clone(),
            subjects: group.subjects.clone(),
            members: group
                .students
                .iter()
                .map(|s| s.subjects.iter().map(|x| x.trim().to_string()).collect())
                .collect(),
        }
    }

    /// A class-wide cohort spanning every group of that class.
    pub fn from_class(class: &str, groups: &[Group]) -> Self {
        let mut subjects = BTreeSet::new();
        let mut members = Vec::new();
        for g in groups.iter().filter(|g| g.class == class) {
            subjects.extend(g.subjects.iter().cloned());
            for s in &g.students {
                members.push(s.subjects.iter().map(|x| x.trim().to_string()).collect());
            }
        }
        Self {
            id: format!("class-{}", crate::groups::group_id(class)),
            name: format!("Class {class}"),
            subjects: subjects.into_iter().collect(),
            members,
        }
    }

    /// Subjects every member takes.
    pub fn core_subjects(&self) -> Vec<String> {
        if self.members.is_empty() {
            return self.subjects.clone();
        }
        self.subjects
            .iter()
            .filter(|s| self.members.iter().all(|m| m.contains(*s)))
            .cloned()
            .collect()
    }

    pub fn optional_subjects(&self) -> Vec<String> {
        let core = self.core_subjects();
        self.subjects
            .iter()
            .filter(|s| !core.contains(s))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub time: &'static str,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayPlan {
    pub day: &'static str,
    pub slots: Vec<Slot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Timetable {
    pub cohort_id: String,
    pub name: String,
    pub policy: Policy,
    pub week: String,
    pub days: Vec<DayPlan>,
}

/// ISO week label, e.g. `2026-W42`.
pub fn week_label(date: NaiveDate) -> String {
    let w = date.iso_week();
    format!("{}-W{:02}", w.year(), w.week())
}

pub fn seed_for(cohort_id: &str, date: NaiveDate) -> u64 {
    let w = date.iso_week();
    let digest = Sha256::digest(format!("{}:{}-W{}", cohort_id, w.year(), w.week()).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub fn seeded_rng(cohort_id: &str, date: NaiveDate) -> StdRng {
    StdRng::seed_from_u64(seed_for(cohort_id, date))
}

/// Labels cycled through the week, before shuffling.
pub fn slot_labels(cohort: &Cohort, policy: Policy) -> Vec<String> {
    match policy {
        Policy::RoundRobin => cohort.subjects.clone(),
        Policy::Fair => {
            let mut labels = cohort.core_subjects();
            let optional = cohort.optional_subjects();
            labels.extend(optional.chunks(2).map(|pair| pair.join(" / ")));
            labels
        }
    }
}

pub fn generate<R: Rng + ?Sized>(
    cohort: &Cohort,
    policy: Policy,
    week_of: NaiveDate,
    rng: &mut R,
) -> Timetable {
    let mut labels = slot_labels(cohort, policy);
    labels.shuffle(rng);

    let days = DAYS
        .iter()
        .enumerate()
        .map(|(d, &day)| DayPlan {
            day,
            slots: if labels.is_empty() {
                Vec::new()
            } else {
                TIME_SLOTS
                    .iter()
                    .enumerate()
                    .map(|(t, &time)| Slot {
                        time,
                        subject: labels[(d * TIME_SLOTS.len() + t) % labels.len()].clone(),
                    })
                    .collect()
            },
        })
        .collect();

    Timetable {
        cohort_id: cohort.id.clone(),
        name: cohort.name.clone(),
        policy,
        week: week_label(week_of),
        days,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSitting {
    pub group_id: String,
    pub group_name: String,
    pub subject: String,
    pub date: NaiveDate,
    pub day: &'static str,
    pub start: &'static str,
    pub end: &'static str,
}

pub fn next_saturday(from: NaiveDate) -> NaiveDate {
    let ahead = (Weekday::Sat.num_days_from_monday() + 7 - from.weekday().num_days_from_monday()) % 7;
    from + Duration::days(i64::from(ahead))
}

/// Saturday and Sunday sittings for each group, four per weekend.
pub fn weekend_tests(groups: &[Group], from: NaiveDate) -> Vec<TestSitting> {
    let saturday = next_saturday(from);
    let per_day = TEST_SITTINGS.len();
    let mut out = Vec::new();
    for g in groups {
        for (i, subject) in g.subjects.iter().enumerate() {
            let weekend = i / (per_day * 2);
            let day_index = (i / per_day) % 2;
            let (start, end) = TEST_SITTINGS[i % per_day];
            let date = saturday + Duration::days((weekend * 7 + day_index) as i64);
            out.push(TestSitting {
                group_id: g.id.clone(),
                group_name: g.name.clone(),
                subject: subject.clone(),
                date,
                day: if day_index == 0 { "Saturday" } else { "Sunday" },
                start,
                end,
            });
        }
    }
    out.sort_by(|a, b| {
        (a.date, a.start, &a.group_id).cmp(&(b.date, b.start, &b.group_id))
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::groups::derive_groups;
    use crate::model::{Gender, Student};

    fn student(id: &str, class: &str, subjects: &[&str]) -> Student {
        Student {
            id: id.to_string(),
            name: format!("S{id}"),
            class: class.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            gender: Gender::Female,
            parent_phone: None,
            school_name: None,
            assigned_staff_id: None,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn class_twelve() -> Vec<Group> {
        derive_groups(&[
            student("1", "12", &["Maths", "Physics", "Chemistry", "Biology"]),
            student("2", "12", &["Maths", "Physics", "Chemistry", "Computer Science"]),
            student("3", "12", &["Maths", "Physics", "Chemistry", "Economics"]),
        ])
    }

    #[test]
    fn fair_policy_pairs_optional_subjects() {
        let cohort = Cohort::from_class("12", &class_twelve());
        assert_eq!(cohort.core_subjects(), vec!["Chemistry", "Maths", "Physics"]);
        let labels = slot_labels(&cohort, Policy::Fair);
        assert_eq!(
            labels,
            vec![
                "Chemistry",
                "Maths",
                "Physics",
                "Biology / Computer Science",
                "Economics"
            ]
        );
    }

    #[test]
    fn every_slot_is_filled_and_all_subjects_appear() {
        let groups = class_twelve();
        let cohort = Cohort::from_group(&groups[0]);
        let monday = date(2026, 10, 12);
        let tt = generate(&cohort, Policy::RoundRobin, monday, &mut seeded_rng(&cohort.id, monday));
        assert_eq!(tt.days.len(), 5);
        assert!(tt.days.iter().all(|d| d.slots.len() == TIME_SLOTS.len()));
        for subject in &cohort.subjects {
            assert!(tt.days.iter().flat_map(|d| &d.slots).any(|s| &s.subject == subject));
        }
        assert_eq!(tt.week, "2026-W42");
    }

    #[test]
    fn seeded_shuffle_is_stable_within_a_week() {
        let groups = class_twelve();
        let cohort = Cohort::from_class("12", &groups);
        let mon = date(2026, 10, 12);
        let fri = date(2026, 10, 16);
        assert_eq!(seed_for(&cohort.id, mon), seed_for(&cohort.id, fri));
        assert_ne!(seed_for(&cohort.id, mon), seed_for(&cohort.id, date(2026, 10, 19)));
        let a = generate(&cohort, Policy::Fair, mon, &mut seeded_rng(&cohort.id, mon));
        let b = generate(&cohort, Policy::Fair, fri, &mut seeded_rng(&cohort.id, fri));
        assert_eq!(a.days, b.days);
    }

    #[test]
    fn empty_cohort_has_no_slots() {
        let cohort = Cohort::from_class("7", &[]);
        let d = date(2026, 1, 5);
        let tt = generate(&cohort, Policy::Fair, d, &mut seeded_rng(&cohort.id, d));
        assert!(tt.days.iter().all(|d| d.slots.is_empty()));
    }

    #[test]
    fn weekend_tests_spill_into_following_weekend() {
        let groups = derive_groups(&[student(
            "1",
            "11",
            &["Biology", "Chemistry", "English", "Maths", "Physics"],
        )]);
        // Wednesday 2026-10-14 -> Saturday 2026-10-17.
        let plan = weekend_tests(&groups, date(2026, 10, 14));
        assert_eq!(plan.len(), 5);
        assert_eq!(plan[0].date, date(2026, 10, 17));
        assert_eq!(plan[0].subject, "Biology");
        assert_eq!(plan[1].start, "14:00");
        assert_eq!(plan[2].day, "Sunday");
        assert_eq!(plan[4].date, date(2026, 10, 24));
        assert_eq!(plan[4].subject, "Physics");
    }

    #[test]
    fn saturday_is_its_own_next_saturday() {
        assert_eq!(next_saturday(date(2026, 10, 17)), date(2026, 10, 17));
        assert_eq!(next_saturday(date(2026, 10, 18)), date(2026, 10, 24));
    }
}
