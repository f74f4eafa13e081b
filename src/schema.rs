//! Schema context
//!
//! Static description of the school database handed to every prompt. The
//! built-in schema can be replaced at startup by a JSON file of the same shape.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub relationships: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryTemplate {
    pub question: String,
    pub sql: String,
}

/// Immutable description of tables, relationships and sample queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaContext {
    pub version: String,
    /// Column every tenant-owned table carries.
    pub tenant_column: String,
    pub tables: Vec<TableDef>,
    #[serde(default)]
    pub sample_queries: Vec<QueryTemplate>,
}

impl SchemaContext {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let schema: SchemaContext = serde_json::from_str(&raw)?;
        if schema.tables.is_empty() {
            return Err(NlqError::Configuration(format!(
                "schema file {} defines no tables",
                path.display()
            )));
        }
        Ok(schema)
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Stable textual rendering used in prompts. The placeholder is written
    /// into the sample queries wherever the tenant identifier belongs.
    pub fn describe(&self, tenant_placeholder: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "DATABASE SCHEMA (version {}, PostgreSQL)", self.version);
        let _ = writeln!(
            out,
            "Every table except schools has a {} column that scopes rows to one school.",
            self.tenant_column
        );
        for table in &self.tables {
            let _ = writeln!(out);
            let _ = writeln!(out, "Table {}:", table.name);
            for column in &table.columns {
                let _ = writeln!(out, "  - {}: {}", column.name, column.description);
            }
            if !table.relationships.is_empty() {
                let _ = writeln!(out, "  Relationships:");
                for rel in &table.relationships {
                    let _ = writeln!(out, "    * {}", rel);
                }
            }
        }
        if !self.sample_queries.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "SAMPLE QUERIES:");
            for template in &self.sample_queries {
                let _ = writeln!(out, "Q: {}", template.question);
                let _ = writeln!(out, "SQL: {}", template.sql.replace(TEMPLATE_TENANT, tenant_placeholder));
            }
        }
        out
    }

    /// The school ERP schema this engine ships with.
    pub fn school() -> Self {
        fn t(name: &str, columns: &[(&str, &str)], relationships: &[&str]) -> TableDef {
            TableDef {
                name: name.to_string(),
                columns: columns
                    .iter()
                    .map(|(n, d)| ColumnDef {
                        name: n.to_string(),
                        description: d.to_string(),
                    })
                    .collect(),
                relationships: relationships.iter().map(|r| r.to_string()).collect(),
            }
        }

        fn q(question: &str, sql: &str) -> QueryTemplate {
            QueryTemplate {
                question: question.to_string(),
                sql: sql.to_string(),
            }
        }

        let tables = vec![
            t(
                "schools",
                &[
                    ("id", "tenant identifier (uuid/text), the value school_id refers to"),
                    ("name", "school name"),
                    ("board", "affiliation board, e.g. CBSE, ICSE, State"),
                ],
                &[],
            ),
            t(
                "academic_years",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("name", "label such as '2024-25'"),
                    ("start_date", "first day of the year"),
                    ("end_date", "last day of the year"),
                    ("is_current", "true for the running academic year"),
                ],
                &[],
            ),
            t(
                "classes",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("name", "class name in roman numerals, e.g. 'I' .. 'XII'"),
                    ("section", "section letter, e.g. 'A'"),
                    ("academic_year_id", "academic year of this class"),
                    ("class_teacher_id", "staff member in charge"),
                ],
                &[
                    "classes.academic_year_id -> academic_years.id",
                    "classes.class_teacher_id -> staff.id",
                ],
            ),
            t(
                "students",
                &[
                    ("id", "primary key, the student identifier"),
                    ("school_id", "tenant column"),
                    ("class_id", "current class"),
                    ("admission_no", "admission number shown on ID cards"),
                    ("first_name", "given name"),
                    ("last_name", "family name"),
                    ("gender", "'male', 'female' or 'other'"),
                    ("stream", "senior secondary stream: 'Science', 'Commerce', 'Arts'; null below XI"),
                    ("category", "reservation category such as 'General', 'OBC', 'SC', 'ST'"),
                    ("status", "'active', 'alumni', 'transferred'"),
                    ("date_of_birth", "date"),
                ],
                &["students.class_id -> classes.id"],
            ),
            t(
                "staff",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("first_name", "given name"),
                    ("last_name", "family name"),
                    ("designation", "e.g. 'PGT Physics', 'Principal', 'Clerk'"),
                    ("department", "academic or administrative department"),
                    ("status", "'active' or 'inactive'"),
                ],
                &[],
            ),
            t(
                "subjects",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("name", "subject name, e.g. 'Mathematics'"),
                    ("code", "short subject code"),
                ],
                &[],
            ),
            t(
                "attendance",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("student_id", "student the record belongs to"),
                    ("class_id", "class the attendance was taken in"),
                    ("date", "attendance date"),
                    ("status", "'present', 'absent', 'late' or 'leave'"),
                ],
                &[
                    "attendance.student_id -> students.id",
                    "attendance.class_id -> classes.id",
                ],
            ),
            t(
                "fee_structures",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("class_id", "class the fee applies to"),
                    ("academic_year_id", "academic year"),
                    ("fee_type", "e.g. 'Tuition', 'Transport', 'Exam', 'Library'"),
                    ("amount", "amount due per student"),
                    ("due_date", "payment deadline"),
                ],
                &[
                    "fee_structures.class_id -> classes.id",
                    "fee_structures.academic_year_id -> academic_years.id",
                ],
            ),
            t(
                "fee_payments",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("student_id", "paying student"),
                    ("fee_structure_id", "fee being paid"),
                    ("amount", "amount paid"),
                    ("status", "'paid', 'pending' or 'partial'"),
                    ("paid_on", "payment date, null when unpaid"),
                ],
                &[
                    "fee_payments.student_id -> students.id",
                    "fee_payments.fee_structure_id -> fee_structures.id",
                ],
            ),
            t(
                "exams",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("class_id", "class sitting the exam"),
                    ("name", "exam name, e.g. 'Half Yearly'"),
                    ("exam_type", "'unit_test', 'term', 'final'"),
                    ("start_date", "first exam day"),
                    ("end_date", "last exam day"),
                ],
                &["exams.class_id -> classes.id"],
            ),
            t(
                "exam_results",
                &[
                    ("id", "primary key"),
                    ("school_id", "tenant column"),
                    ("exam_id", "exam"),
                    ("student_id", "student"),
                    ("subject_id", "subject"),
                    ("marks_obtained", "numeric marks scored"),
                    ("max_marks", "numeric maximum marks"),
                    ("grade", "letter grade"),
                ],
                &[
                    "exam_results.exam_id -> exams.id",
                    "exam_results.student_id -> students.id",
                    "exam_results.subject_id -> subjects.id",
                ],
            ),
        ];

        let sample_queries = vec![
            q(
                "Which students in Class XII are absent today?",
                "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section \
                 FROM attendance a JOIN students s ON s.id = a.student_id JOIN classes c ON c.id = a.class_id \
                 WHERE a.school_id = '$TENANT' AND a.date = CURRENT_DATE AND a.status = 'absent' AND c.name = 'XII' \
                 ORDER BY c.section, s.first_name",
            ),
            q(
                "Ratio of science to arts students",
                "SELECT s.stream, COUNT(DISTINCT s.id) AS count FROM students s \
                 WHERE s.school_id = '$TENANT' AND s.stream IS NOT NULL GROUP BY s.stream ORDER BY count DESC",
            ),
        ];

        Self {
            version: "2024.1".to_string(),
            tenant_column: "school_id".to_string(),
            tables,
            sample_queries,
        }
    }
}

/// Marker used by stored templates for the tenant value.
const TEMPLATE_TENANT: &str = "$TENANT";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_is_stable_and_uses_placeholder() {
        let schema = SchemaContext::school();
        let a = schema.describe("{{TENANT_ID}}");
        let b = schema.describe("{{TENANT_ID}}");
        assert_eq!(a, b);
        assert!(a.contains("Table students:"));
        assert!(a.contains("  - marks_obtained: numeric marks scored"));
        assert!(a.contains("school_id = '{{TENANT_ID}}'"));
        assert!(!a.contains("$TENANT"));
    }

    #[test]
    fn every_tenant_table_has_the_tenant_column() {
        let schema = SchemaContext::school();
        for table in schema.tables.iter().filter(|t| t.name != "schools") {
            assert!(
                table.columns.iter().any(|c| c.name == schema.tenant_column),
                "{} lacks {}",
                table.name,
                schema.tenant_column
            );
        }
    }

    #[test]
    fn loads_from_json_file() {
        let dir = std::env::temp_dir().join(format!("campus-nlq-schema-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("schema.json");
        std::fs::write(&path, serde_json::to_string(&SchemaContext::school()).unwrap()).unwrap();

        let loaded = SchemaContext::load(&path).unwrap();
        assert_eq!(loaded, SchemaContext::school());
        assert!(loaded.table("fee_payments").is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
