//! Spreadsheet and PDF renderings of attendance, marks and student summaries.

use crate::calc::{self, AttendanceSummary};
use crate::model::{AttendanceRecord, Student, WeeklyTestMark};
use anyhow::Context;
use chrono::NaiveDate;
use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference};
use rust_xlsxwriter::{Format, Workbook, Worksheet};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;

pub const UNKNOWN_STUDENT: &str = "Unknown";
pub const UNKNOWN_CLASS: &str = "N/A";

const PAGE_W: f32 = 210.0;
const PAGE_H: f32 = 297.0;
const MARGIN: f32 = 15.0;
const LINE: f32 = 6.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRow {
    pub student_name: String,
    pub class: String,
    pub date: NaiveDate,
    pub status: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkRow {
    pub student_name: String,
    pub mark: WeeklyTestMark,
}

/// Presentation settings shared by every PDF report.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub school_name: String,
    pub show_generated_at: bool,
    pub generated_on: NaiveDate,
}

pub fn display_date(d: NaiveDate) -> String {
    d.format("%d/%m/%Y").to_string()
}

/// Whole numbers print without a decimal point.
pub fn display_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

fn index_students(students: &[Student]) -> HashMap<&str, &Student> {
    students.iter().map(|s| (s.id.as_str(), s)).collect()
}

pub fn attendance_rows(records: &[AttendanceRecord], students: &[Student]) -> Vec<AttendanceRow> {
    let by_id = index_students(students);
    let mut rows: Vec<AttendanceRow> = records
        .iter()
        .map(|r| {
            let s = by_id.get(r.student_id.as_str());
            AttendanceRow {
                student_name: s.map_or(UNKNOWN_STUDENT.to_string(), |s| s.name.clone()),
                class: s.map_or(UNKNOWN_CLASS.to_string(), |s| s.class.clone()),
                date: r.date,
                status: r.status.label(),
            }
        })
        .collect();
    rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.student_name.cmp(&b.student_name)));
    rows
}

pub fn mark_rows(marks: &[WeeklyTestMark], students: &[Student]) -> Vec<MarkRow> {
    let by_id = index_students(students);
    marks
        .iter()
        .map(|m| MarkRow {
            student_name: by_id
                .get(m.student_id.as_str())
                .map_or(UNKNOWN_STUDENT.to_string(), |s| s.name.clone()),
            mark: m.clone(),
        })
        .collect()
}

fn write_header(ws: &mut Worksheet, headers: &[&str]) -> anyhow::Result<()> {
    let bold = Format::new().set_bold();
    for (c, h) in headers.iter().enumerate() {
        ws.write_string_with_format(0, c as u16, *h, &bold)?;
    }
    Ok(())
}

pub fn attendance_xlsx(rows: &[AttendanceRow]) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut ws = Worksheet::new();
    ws.set_name("Attendance")?;
    write_header(&mut ws, &["Student Name", "Class", "Date", "Status"])?;
    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        ws.write_string(r, 0, &row.student_name)?;
        ws.write_string(r, 1, &row.class)?;
        ws.write_string(r, 2, display_date(row.date))?;
        ws.write_string(r, 3, row.status)?;
    }
    workbook.push_worksheet(ws);
    workbook.save_to_buffer().context("failed to render attendance workbook")
}

pub fn marks_xlsx(rows: &[MarkRow]) -> anyhow::Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let mut ws = Worksheet::new();
    ws.set_name("Test Marks")?;
    write_header(
        &mut ws,
        &[
            "Student Name",
            "Subject",
            "Week Number",
            "Year",
            "Marks Obtained",
            "Total Marks",
            "Percentage",
            "Test Date",
            "Remarks",
        ],
    )?;
    for (i, row) in rows.iter().enumerate() {
        let r = (i + 1) as u32;
        let m = &row.mark;
        ws.write_string(r, 0, &row.student_name)?;
        ws.write_string(r, 1, &m.subject)?;
        ws.write_number(r, 2, f64::from(m.week_number))?;
        ws.write_number(r, 3, f64::from(m.year))?;
        ws.write_number(r, 4, m.marks_obtained)?;
        ws.write_number(r, 5, m.total_marks)?;
        ws.write_string(r, 6, format!("{:.1}%", m.percentage()))?;
        ws.write_string(r, 7, display_date(m.test_date))?;
        ws.write_string(r, 8, m.remarks.as_deref().unwrap_or(""))?;
    }
    workbook.push_worksheet(ws);
    workbook.save_to_buffer().context("failed to render marks workbook")
}

/// Cursor over a growing A4 document; starts a new page when the current one fills.
struct PdfReport {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    font: IndirectFontRef,
    bold: IndirectFontRef,
    y: f32,
}

impl PdfReport {
    fn new(title: &str, opts: &ReportOptions) -> anyhow::Result<Self> {
        let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        let font = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .context("failed to load Helvetica")?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .context("failed to load Helvetica-Bold")?;
        let layer = doc.get_page(page).get_layer(layer);
        let mut report = Self {
            doc,
            layer,
            font,
            bold,
            y: PAGE_H - MARGIN,
        };
        if !opts.school_name.trim().is_empty() {
            report.text(opts.school_name.trim(), 12.0, true);
        }
        report.text(title, 18.0, true);
        if opts.show_generated_at {
            report.text(
                &format!("Generated on: {}", display_date(opts.generated_on)),
                9.0,
                false,
            );
        }
        report.gap();
        Ok(report)
    }

    fn ensure_room(&mut self, height: f32) {
        if self.y - height >= MARGIN {
            return;
        }
        let (page, layer) = self.doc.add_page(Mm(PAGE_W), Mm(PAGE_H), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = PAGE_H - MARGIN;
    }

    fn text(&mut self, text: &str, size: f32, bold: bool) {
        let height = size * 0.35 + 2.0;
        self.ensure_room(height);
        self.y -= height;
        let font = if bold { &self.bold } else { &self.font };
        self.layer.use_text(text, size, Mm(MARGIN), Mm(self.y), font);
    }

    fn gap(&mut self) {
        self.y -= LINE / 2.0;
    }

    fn row(&mut self, cells: &[String], widths: &[f32], bold: bool) {
        self.ensure_room(LINE);
        self.y -= LINE;
        let font = if bold { &self.bold } else { &self.font };
        let mut x = MARGIN;
        for (cell, w) in cells.iter().zip(widths) {
            self.layer.use_text(cell.as_str(), 9.0, Mm(x), Mm(self.y), font);
            x += w;
        }
    }

    fn table(&mut self, headers: &[&str], widths: &[f32], rows: impl IntoIterator<Item = Vec<String>>) {
        let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
        self.row(&header, widths, true);
        for r in rows {
            // Repeat the header when the table continues on a new page.
            if self.y - LINE < MARGIN {
                self.ensure_room(LINE * 2.0);
                self.row(&header, widths, true);
            }
            self.row(&r, widths, false);
        }
        self.gap();
    }

    fn finish(self) -> anyhow::Result<Vec<u8>> {
        self.doc.save_to_bytes().context("failed to serialise pdf")
    }
}

pub fn attendance_pdf(
    rows: &[AttendanceRow],
    period: Option<&str>,
    opts: &ReportOptions,
) -> anyhow::Result<Vec<u8>> {
    let mut pdf = PdfReport::new("Attendance Report", opts)?;
    if let Some(p) = period {
        pdf.text(&format!("Period: {p}"), 11.0, false);
        pdf.gap();
    }
    pdf.table(
        &["Student Name", "Class", "Date", "Status"],
        &[70.0, 30.0, 40.0, 30.0],
        rows.iter().map(|r| {
            vec![
                r.student_name.clone(),
                r.class.clone(),
                display_date(r.date),
                r.status.to_string(),
            ]
        }),
    );
    let present = rows.iter().filter(|r| r.status == "Present").count();
    pdf.text("Summary", 12.0, true);
    pdf.text(&format!("Total Records: {}", rows.len()), 10.0, false);
    pdf.text(&format!("Present: {present}"), 10.0, false);
    pdf.text(&format!("Absent: {}", rows.len() - present), 10.0, false);
    pdf.finish()
}

pub fn marks_pdf(rows: &[MarkRow], filters: &[String], opts: &ReportOptions) -> anyhow::Result<Vec<u8>> {
    let mut pdf = PdfReport::new("Test Marks Report", opts)?;
    for f in filters {
        pdf.text(f, 10.0, false);
    }
    if !filters.is_empty() {
        pdf.gap();
    }
    pdf.table(
        &["Student", "Subject", "Week", "Marks", "Percentage", "Test Date"],
        &[50.0, 35.0, 15.0, 25.0, 25.0, 30.0],
        rows.iter().map(|r| {
            let m = &r.mark;
            vec![
                r.student_name.clone(),
                m.subject.clone(),
                m.week_number.to_string(),
                format!(
                    "{}/{}",
                    display_number(m.marks_obtained),
                    display_number(m.total_marks)
                ),
                format!("{:.1}%", m.percentage()),
                display_date(m.test_date),
            ]
        }),
    );
    let average = if rows.is_empty() {
        0.0
    } else {
        rows.iter().map(|r| r.mark.percentage()).sum::<f64>() / rows.len() as f64
    };
    pdf.text("Summary", 12.0, true);
    pdf.text(&format!("Total Tests: {}", rows.len()), 10.0, false);
    pdf.text(&format!("Average Percentage: {:.1}%", average), 10.0, false);
    pdf.finish()
}

pub fn student_summary_pdf(
    student: &Student,
    attendance: &AttendanceSummary,
    recent: &[WeeklyTestMark],
    opts: &ReportOptions,
) -> anyhow::Result<Vec<u8>> {
    let mut pdf = PdfReport::new("Student Progress Report", opts)?;
    pdf.text(&format!("Student: {}", student.name), 12.0, false);
    pdf.text(&format!("Class: {}", student.class), 12.0, false);
    if let Some(school) = &student.school_name {
        pdf.text(&format!("School: {school}"), 12.0, false);
    }
    pdf.gap();

    pdf.text("Attendance Summary", 14.0, true);
    pdf.text(&format!("Total Days: {}", attendance.total_days), 10.0, false);
    pdf.text(&format!("Present Days: {}", attendance.present_days), 10.0, false);
    pdf.text(
        &format!("Attendance Percentage: {:.1}%", attendance.percentage),
        10.0,
        false,
    );
    pdf.gap();

    pdf.text("Recent Test Marks", 14.0, true);
    if recent.is_empty() {
        pdf.text("No recent test marks available", 10.0, false);
    } else {
        pdf.table(
            &["Subject", "Week", "Marks", "Percentage", "Grade"],
            &[50.0, 20.0, 30.0, 30.0, 20.0],
            recent.iter().map(|m| {
                let pct = m.percentage();
                vec![
                    m.subject.clone(),
                    m.week_number.to_string(),
                    format!(
                        "{}/{}",
                        display_number(m.marks_obtained),
                        display_number(m.total_marks)
                    ),
                    format!("{:.1}%", pct),
                    calc::grade_for(pct).label().to_string(),
                ]
            }),
        );
    }
    pdf.finish()
}

/// File name used for a student's summary inside a bundle.
pub fn summary_file_name(student: &Student) -> String {
    let slug: String = student
        .name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let short_id: String = student.id.chars().take(8).collect();
    format!("{slug}_{short_id}_summary.pdf")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BundleEntry<'a> {
    file: &'a str,
    sha256: String,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Zips `(file name, bytes)` pairs with a `manifest.json` of their digests.
pub fn bundle_zip(files: &[(String, Vec<u8>)]) -> anyhow::Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let entries: Vec<BundleEntry<'_>> = files
        .iter()
        .map(|(name, bytes)| BundleEntry {
            file: name,
            sha256: sha256_hex(bytes),
        })
        .collect();
    zip.start_file("manifest.json", opts)?;
    zip.write_all(serde_json::to_string_pretty(&serde_json::json!({ "files": entries }))?.as_bytes())?;

    for (name, bytes) in files {
        zip.start_file(name.as_str(), opts)
            .with_context(|| format!("failed to add {name} to bundle"))?;
        zip.write_all(bytes)?;
    }
    let cursor = zip.finish().context("failed to finalise bundle")?;
    Ok(cursor.into_inner())
}
