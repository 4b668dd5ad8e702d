//! Derived student groups: students sharing a class and an identical subject set.

use crate::model::Student;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    pub class: String,
    pub subjects: Vec<String>,
    pub students: Vec<Student>,
}

pub fn sorted_subjects(subjects: &[String]) -> Vec<String> {
    let mut out: Vec<String> = subjects
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn group_key(class: &str, subjects: &[String]) -> String {
    format!("{}|{}", class.trim(), sorted_subjects(subjects).join(","))
}

/// Lowercase, dash-separated form of the group key.
pub fn group_id(key: &str) -> String {
    let mut id = String::with_capacity(key.len());
    let mut last_dash = true;
    for c in key.chars() {
        if c.is_alphanumeric() {
            id.extend(c.to_lowercase());
            last_dash = false;
        } else if !last_dash {
            id.push('-');
            last_dash = true;
        }
    }
    while id.ends_with('-') {
        id.pop();
    }
    id
}

fn is_math(s: &str) -> bool {
    matches!(
        s.to_ascii_lowercase().as_str(),
        "math" | "maths" | "mathematics"
    )
}

fn mnemonic(subjects: &[String]) -> Option<&'static str> {
    let has = |name: &str| subjects.iter().any(|s| s.eq_ignore_ascii_case(name));
    let math = subjects.iter().any(|s| is_math(s));
    if !(math && has("Physics") && has("Chemistry")) {
        return None;
    }
    match subjects.len() {
        3 => Some("PCM"),
        4 if has("Biology") => Some("PCB"),
        4 if has("Computer Science") => Some("CS"),
        _ => None,
    }
}

/// Short label for a subject set; `subjects` must already be sorted.
pub fn group_label(subjects: &[String]) -> String {
    if let Some(m) = mnemonic(subjects) {
        return m.to_string();
    }
    subjects
        .iter()
        .filter_map(|s| s.chars().next())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

pub fn derive_groups(students: &[Student]) -> Vec<Group> {
    let mut by_key: BTreeMap<(String, String), Group> = BTreeMap::new();
    for s in students {
        let subjects = sorted_subjects(&s.subjects);
        let key = group_key(&s.class, &subjects);
        let class = s.class.trim().to_string();
        let group = by_key
            .entry((class.clone(), key.clone()))
            .or_insert_with(|| Group {
                id: group_id(&key),
                name: format!("Class {} {}", class, group_label(&subjects)),
                class,
                subjects,
                students: Vec::new(),
            });
        group.students.push(s.clone());
    }

    let mut slug_counts: HashMap<String, usize> = HashMap::new();
    for g in by_key.values() {
        *slug_counts.entry(g.id.clone()).or_default() += 1;
    }

    by_key
        .into_iter()
        .map(|((_, key), mut g)| {
            // Keys that slug to the same id ("C++" and "C") get a digest suffix.
            if slug_counts.get(&g.id).is_some_and(|n| *n > 1) {
                g.id = format!("{}-{}", g.id, key_digest(&key));
            }
            g.students
                .sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            g
        })
        .collect()
}

fn key_digest(key: &str) -> String {
    Sha256::digest(key.as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Gender;

    fn student(id: &str, class: &str, subjects: &[&str]) -> Student {
        Student {
            id: id.to_string(),
            name: format!("N{id}"),
            class: class.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            gender: Gender::Male,
            parent_phone: None,
            school_name: None,
            assigned_staff_id: None,
        }
    }

    fn ids(g: &Group) -> Vec<&str> {
        g.students.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn same_class_and_subject_set_share_a_group_regardless_of_order() {
        let students = vec![
            student("1", "10", &["Physics", "Maths", "Chemistry"]),
            student("2", "10", &["Chemistry", "Physics", "Maths"]),
            student("3", "9", &["Maths", "Physics", "Chemistry"]),
        ];
        let groups = derive_groups(&students);
        assert_eq!(groups.len(), 2);
        let ten = groups.iter().find(|g| g.class == "10").unwrap();
        assert_eq!(ids(ten), vec!["1", "2"]);
        assert_eq!(ten.name, "Class 10 PCM");

        let mut reversed = students.clone();
        reversed.reverse();
        assert_eq!(derive_groups(&reversed), groups);
        assert_eq!(derive_groups(&students), groups);
    }

    #[test]
    fn mnemonics_and_initials() {
        let s = |xs: &[&str]| sorted_subjects(&xs.iter().map(|x| x.to_string()).collect::<Vec<_>>());
        assert_eq!(group_label(&s(&["Maths", "Physics", "Chemistry", "Biology"])), "PCB");
        assert_eq!(
            group_label(&s(&["Mathematics", "Physics", "Chemistry", "Computer Science"])),
            "CS"
        );
        assert_eq!(group_label(&s(&["Tamil", "English", "Science"])), "EST");
        assert_eq!(
            group_label(&s(&["Maths", "Physics", "Chemistry", "Biology", "Computer Science"])),
            "BCCMP"
        );
    }

    #[test]
    fn ids_are_stable_slugs() {
        let key = group_key("10", &["Maths".into(), "Computer Science".into()]);
        assert_eq!(key, "10|Computer Science,Maths");
        assert_eq!(group_id(&key), "10-computer-science-maths");
    }

    #[test]
    fn colliding_slugs_get_distinct_ids() {
        let students = vec![
            student("1", "11", &["C++", "Physics"]),
            student("2", "11", &["C", "Physics"]),
            student("3", "11", &["Maths"]),
        ];
        let groups = derive_groups(&students);
        assert_eq!(groups.len(), 3);

        let plus = groups.iter().find(|g| ids(g) == vec!["1"]).unwrap();
        let plain = groups.iter().find(|g| ids(g) == vec!["2"]).unwrap();
        assert_ne!(plus.id, plain.id);
        assert!(plus.id.starts_with("11-c-physics-"));
        assert!(plain.id.starts_with("11-c-physics-"));

        // Unambiguous groups keep the bare slug.
        let maths = groups.iter().find(|g| ids(g) == vec!["3"]).unwrap();
        assert_eq!(maths.id, "11-maths");

        assert_eq!(derive_groups(&students), groups);
    }
}
