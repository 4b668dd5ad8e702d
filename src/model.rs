use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const MAX_WEEK_NUMBER: u32 = 52;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Absent => "absent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "present" => Some(Self::Present),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }

    /// Capitalised label used in exported documents.
    pub fn label(self) -> &'static str {
        match self {
            Self::Present => "Present",
            Self::Absent => "Absent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Male => "male",
            Self::Female => "female",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "male" => Some(Self::Male),
            "female" => Some(Self::Female),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub class: String,
    pub subjects: Vec<String>,
    pub gender: Gender,
    pub parent_phone: Option<String>,
    pub school_name: Option<String>,
    pub assigned_staff_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStudent {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub subjects: Vec<String>,
    pub gender: Gender,
    #[serde(default)]
    pub parent_phone: Option<String>,
    #[serde(default)]
    pub school_name: Option<String>,
    #[serde(default)]
    pub assigned_staff_id: Option<String>,
}

impl NewStudent {
    /// Trims text fields, de-duplicates subjects and checks the required ones.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.name = self.name.trim().to_string();
        self.class = self.class.trim().to_string();
        self.subjects = normalize_subjects(&self.subjects);
        self.parent_phone = non_blank(self.parent_phone);
        self.school_name = non_blank(self.school_name);
        self.assigned_staff_id = non_blank(self.assigned_staff_id);
        validate_student_fields(&self.name, &self.class, &self.subjects)?;
        Ok(self)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentPatch {
    pub name: Option<String>,
    pub class: Option<String>,
    pub subjects: Option<Vec<String>>,
    pub gender: Option<Gender>,
    pub parent_phone: Option<String>,
    pub school_name: Option<String>,
    pub assigned_staff_id: Option<String>,
}

impl StudentPatch {
    pub fn apply(self, student: &mut Student) -> Result<(), ValidationError> {
        if let Some(name) = self.name {
            student.name = name.trim().to_string();
        }
        if let Some(class) = self.class {
            student.class = class.trim().to_string();
        }
        if let Some(subjects) = self.subjects {
            student.subjects = normalize_subjects(&subjects);
        }
        if let Some(gender) = self.gender {
            student.gender = gender;
        }
        // An explicit empty string clears the optional fields.
        if let Some(phone) = self.parent_phone {
            student.parent_phone = non_blank(Some(phone));
        }
        if let Some(school) = self.school_name {
            student.school_name = non_blank(Some(school));
        }
        if let Some(staff) = self.assigned_staff_id {
            student.assigned_staff_id = non_blank(Some(staff));
        }
        validate_student_fields(&student.name, &student.class, &student.subjects)
    }
}

fn validate_student_fields(
    name: &str,
    class: &str,
    subjects: &[String],
) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("name", "name is required"));
    }
    if class.is_empty() {
        return Err(ValidationError::new("class", "class is required"));
    }
    if subjects.is_empty() {
        return Err(ValidationError::new(
            "subjects",
            "select at least one subject",
        ));
    }
    Ok(())
}

pub fn normalize_subjects(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(raw.len());
    for s in raw {
        let t = s.trim();
        if t.is_empty() || out.iter().any(|e| e == t) {
            continue;
        }
        out.push(t.to_string());
    }
    out
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Staff {
    pub id: String,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub student_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeeklyTestMark {
    pub id: String,
    pub student_id: String,
    pub subject: String,
    pub week_number: u32,
    pub year: i32,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub test_date: NaiveDate,
    pub remarks: Option<String>,
}

impl WeeklyTestMark {
    pub fn percentage(&self) -> f64 {
        crate::calc::mark_percentage(self.marks_obtained, self.total_marks)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMark {
    pub student_id: String,
    pub subject: String,
    pub week_number: u32,
    pub year: i32,
    pub marks_obtained: f64,
    pub total_marks: f64,
    pub test_date: NaiveDate,
    #[serde(default)]
    pub remarks: Option<String>,
}

impl NewMark {
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        self.student_id = self.student_id.trim().to_string();
        self.subject = self.subject.trim().to_string();
        self.remarks = non_blank(self.remarks);
        if self.student_id.is_empty() {
            return Err(ValidationError::new("studentId", "select a student"));
        }
        if self.subject.is_empty() {
            return Err(ValidationError::new("subject", "select a subject"));
        }
        if !(1..=MAX_WEEK_NUMBER).contains(&self.week_number) {
            return Err(ValidationError::new(
                "weekNumber",
                format!("week number must be between 1 and {}", MAX_WEEK_NUMBER),
            ));
        }
        if !(2000..=2100).contains(&self.year) {
            return Err(ValidationError::new("year", "year must be between 2000 and 2100"));
        }
        validate_marks(self.marks_obtained, self.total_marks)?;
        Ok(self)
    }
}

pub fn validate_marks(marks_obtained: f64, total_marks: f64) -> Result<(), ValidationError> {
    if !marks_obtained.is_finite() || !total_marks.is_finite() || total_marks <= 0.0 {
        return Err(ValidationError::new(
            "totalMarks",
            "enter valid marks; total marks must be greater than 0",
        ));
    }
    if marks_obtained < 0.0 {
        return Err(ValidationError::new(
            "marksObtained",
            "marks obtained cannot be negative",
        ));
    }
    if marks_obtained > total_marks {
        return Err(ValidationError::new(
            "marksObtained",
            "marks obtained cannot be greater than total marks",
        ));
    }
    Ok(())
}

pub fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| ValidationError::new(field, "date must be YYYY-MM-DD"))
}
