//! Pattern fallback
//!
//! Deterministic question-to-SQL rules used when the generation backend is
//! disabled or fails. Templates are fixed at compile time, so they skip the
//! keyword checks, but they are still bound to the caller's tenant.

use crate::error::Result;
use crate::sql_guard::{SanitizedSql, SqlGuard};
use crate::TenantContext;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::info;

/// Marker inside templates for the tenant value, swapped for the guard's
/// placeholder before binding.
const TENANT: &str = "{{TENANT_ID}}";
/// Marker for a normalized class name.
const CLASS: &str = "{{CLASS}}";

struct PatternRule {
    name: &'static str,
    pattern: Regex,
    template: &'static str,
    description: &'static str,
}

lazy_static! {
    static ref RULES: Vec<PatternRule> = vec![
        PatternRule {
            name: "absent_in_class",
            pattern: Regex::new(
                r"(?i)\b(?:class|grade|std\.?|standard)\s+(?P<class>[a-z0-9]+)\b.*\babsent|\babsent(?:ees)?\b.*\b(?:class|grade|std\.?|standard)\s+(?P<class_after>[a-z0-9]+)"
            )
            .unwrap(),
            template: "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section, a.date \
                       FROM attendance a \
                       JOIN students s ON s.id = a.student_id AND s.school_id = '{{TENANT_ID}}' \
                       JOIN classes c ON c.id = a.class_id AND c.school_id = '{{TENANT_ID}}' \
                       WHERE a.school_id = '{{TENANT_ID}}' AND a.date = CURRENT_DATE AND a.status = 'absent' AND c.name = '{{CLASS}}' \
                       ORDER BY c.section, s.first_name, s.last_name",
            description: "Students of one class marked absent today",
        },
        PatternRule {
            name: "absent_today",
            pattern: Regex::new(r"(?i)\b(absent(ees)?|not present|missing today)\b").unwrap(),
            template: "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section, a.date \
                       FROM attendance a \
                       JOIN students s ON s.id = a.student_id AND s.school_id = '{{TENANT_ID}}' \
                       JOIN classes c ON c.id = a.class_id AND c.school_id = '{{TENANT_ID}}' \
                       WHERE a.school_id = '{{TENANT_ID}}' AND a.date = CURRENT_DATE AND a.status = 'absent' \
                       ORDER BY c.name, c.section, s.first_name, s.last_name",
            description: "Students marked absent today",
        },
        PatternRule {
            name: "pending_fees",
            pattern: Regex::new(
                r"(?i)\b(pending|unpaid|due|outstanding|defaulters?)\b.*\bfees?\b|\bfees?\b.*\b(pending|unpaid|due|outstanding|defaulters?)\b"
            )
            .unwrap(),
            template: "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section, \
                       fs.fee_type AS type, fs.amount, fs.due_date, fp.status \
                       FROM fee_payments fp \
                       JOIN students s ON s.id = fp.student_id AND s.school_id = '{{TENANT_ID}}' \
                       JOIN classes c ON c.id = s.class_id AND c.school_id = '{{TENANT_ID}}' \
                       JOIN fee_structures fs ON fs.id = fp.fee_structure_id AND fs.school_id = '{{TENANT_ID}}' \
                       WHERE fp.school_id = '{{TENANT_ID}}' AND fp.status IN ('pending', 'partial') \
                       ORDER BY fs.due_date, c.name, c.section, s.first_name",
            description: "Students with pending or partially paid fees",
        },
        PatternRule {
            name: "low_attendance",
            pattern: Regex::new(r"(?i)\b(low|poor|below|less than|under)\b.*\battendance\b|\battendance\b.*\b(low|poor|below|less than|under)\b").unwrap(),
            template: "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section, \
                       ROUND(100.0 * SUM(CASE WHEN a.status IN ('present', 'late') THEN 1 ELSE 0 END) / COUNT(*), 2) AS percentage \
                       FROM attendance a \
                       JOIN students s ON s.id = a.student_id AND s.school_id = '{{TENANT_ID}}' \
                       JOIN classes c ON c.id = s.class_id AND c.school_id = '{{TENANT_ID}}' \
                       WHERE a.school_id = '{{TENANT_ID}}' \
                       GROUP BY s.id, s.admission_no, s.first_name, s.last_name, c.name, c.section \
                       HAVING 100.0 * SUM(CASE WHEN a.status IN ('present', 'late') THEN 1 ELSE 0 END) / COUNT(*) < 75 \
                       ORDER BY percentage ASC",
            description: "Students with attendance below 75%",
        },
        PatternRule {
            name: "top_performers",
            pattern: Regex::new(r"(?i)\b(top|best|highest|toppers?|rank(ers|ing)?)\b.*\b(students?|performers?|scorers?|marks|results?)\b|\btoppers?\b").unwrap(),
            template: "SELECT s.id AS student_id, s.admission_no, s.first_name, s.last_name, c.name AS class_name, c.section, \
                       SUM(er.marks_obtained) AS marks_obtained, SUM(er.max_marks) AS max_marks, \
                       ROUND(100.0 * SUM(er.marks_obtained) / NULLIF(SUM(er.max_marks), 0), 2) AS percentage \
                       FROM exam_results er \
                       JOIN students s ON s.id = er.student_id AND s.school_id = '{{TENANT_ID}}' \
                       JOIN classes c ON c.id = s.class_id AND c.school_id = '{{TENANT_ID}}' \
                       WHERE er.school_id = '{{TENANT_ID}}' \
                       GROUP BY s.id, s.admission_no, s.first_name, s.last_name, c.name, c.section \
                       ORDER BY percentage DESC NULLS LAST \
                       LIMIT 10",
            description: "Top 10 students by overall exam percentage",
        },
        PatternRule {
            name: "upcoming_exams",
            pattern: Regex::new(r"(?i)\b(upcoming|next|scheduled|future|coming)\b.*\b(exams?|tests?|examinations?)\b|\bexam\s+schedule\b").unwrap(),
            template: "SELECT e.id, e.name, e.exam_type AS type, c.name AS class_name, c.section, e.start_date, e.end_date \
                       FROM exams e \
                       JOIN classes c ON c.id = e.class_id AND c.school_id = '{{TENANT_ID}}' \
                       WHERE e.school_id = '{{TENANT_ID}}' AND e.start_date >= CURRENT_DATE \
                       ORDER BY e.start_date, c.name, c.section",
            description: "Exams starting today or later",
        },
        PatternRule {
            name: "enrollment_counts",
            pattern: Regex::new(r"(?i)\b(enrol+ment|enrol+ed|strength|how many students|number of students|student count)\b").unwrap(),
            template: "SELECT c.name AS class_name, c.section, COUNT(s.id) AS student_count \
                       FROM classes c \
                       LEFT JOIN students s ON s.class_id = c.id AND s.school_id = '{{TENANT_ID}}' AND s.status = 'active' \
                       WHERE c.school_id = '{{TENANT_ID}}' \
                       GROUP BY c.name, c.section \
                       ORDER BY c.name, c.section",
            description: "Active student enrollment per class and section",
        },
    ];
}

/// Ordinal, numeral and word forms of class names to roman numerals.
const CLASS_NAMES: &[(&[&str], &str)] = &[
    (&["1", "1st", "one", "first", "i"], "I"),
    (&["2", "2nd", "two", "second", "ii"], "II"),
    (&["3", "3rd", "three", "third", "iii"], "III"),
    (&["4", "4th", "four", "fourth", "iv"], "IV"),
    (&["5", "5th", "five", "fifth", "v"], "V"),
    (&["6", "6th", "six", "sixth", "vi"], "VI"),
    (&["7", "7th", "seven", "seventh", "vii"], "VII"),
    (&["8", "8th", "eight", "eighth", "viii"], "VIII"),
    (&["9", "9th", "nine", "ninth", "ix"], "IX"),
    (&["10", "10th", "ten", "tenth", "x"], "X"),
    (&["11", "11th", "eleven", "eleventh", "xi"], "XI"),
    (&["12", "12th", "twelve", "twelfth", "xii"], "XII"),
];

/// Normalize a class token to roman numerals; unknown tokens are upper-cased.
pub fn normalize_class_name(token: &str) -> String {
    let lower = token.trim().to_lowercase();
    CLASS_NAMES
        .iter()
        .find(|(forms, _)| forms.contains(&lower.as_str()))
        .map(|(_, roman)| roman.to_string())
        .unwrap_or_else(|| lower.to_uppercase())
}

/// SQL produced by a fallback rule.
#[derive(Debug, Clone)]
pub struct FallbackQuery {
    pub rule: &'static str,
    pub sql: SanitizedSql,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatternFallback {
    guard: SqlGuard,
}

impl PatternFallback {
    pub fn new(guard: SqlGuard) -> Self {
        Self { guard }
    }

    /// First matching rule wins. `Ok(None)` when nothing matches.
    pub fn generate(&self, question: &str, tenant: &TenantContext) -> Result<Option<FallbackQuery>> {
        let Some((rule, captures)) = RULES
            .iter()
            .find_map(|rule| rule.pattern.captures(question).map(|caps| (rule, caps)))
        else {
            return Ok(None);
        };

        let template = self.render(rule, &captures);
        let sql = self.guard.bind_template(&template, tenant)?;
        info!("Pattern fallback '{}' matched", rule.name);

        let description = match class_capture(&captures) {
            Some(class) => format!("{} (Class {})", rule.description, class),
            None => rule.description.to_string(),
        };

        Ok(Some(FallbackQuery {
            rule: rule.name,
            sql,
            description,
        }))
    }

    fn render(&self, rule: &PatternRule, captures: &Captures<'_>) -> String {
        let mut sql = rule.template.replace(TENANT, self.guard.placeholder());
        if let Some(class) = class_capture(captures) {
            sql = sql.replace(CLASS, &class);
        }
        sql
    }
}

/// Class token of the `absent_in_class` rule, normalized.
fn class_capture(captures: &Captures<'_>) -> Option<String> {
    captures
        .name("class")
        .or_else(|| captures.name("class_after"))
        .map(|m| normalize_class_name(m.as_str()))
}
