//! SQL Guard
//!
//! The single gate between generated text and the database. Generated text is
//! held as [`RawGenerationText`] and only [`SqlGuard::sanitize`] (or the fixed
//! fallback templates) can produce a [`SanitizedSql`], which is the only type the
//! executor accepts.
//!
//! Checks run in a fixed order: strip code fences, scan for denied keywords,
//! require a leading `SELECT`, reject chained statements, then substitute the
//! tenant placeholder. Substitution comes last so nothing smuggled in through
//! the placeholder can skip the keyword scan.

use crate::error::{NlqError, Result, ValidationRule};
use crate::TenantContext;
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

/// Statement-altering keywords. Matched as whole tokens where `_` counts as a
/// separator, so `update_count` is rejected while `updated_at` is not.
pub const DENIED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "TRUNCATE", "ALTER", "CREATE", "INSERT", "UPDATE", "GRANT", "REVOKE",
];

lazy_static! {
    static ref TENANT_ID_RE: Regex = Regex::new(r"^[A-Za-z0-9_-]{1,128}$").unwrap();
    static ref FENCE_OPEN_RE: Regex = Regex::new(r"(?i)^```[a-z]*\s*").unwrap();
}

/// Untrusted model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGenerationText(String);

impl RawGenerationText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        strip_fences(&self.0).is_empty()
    }
}

/// A statement that passed the guard and is bound to one tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedSql(String);

impl SanitizedSql {
    /// Only the guard and the fixed fallback templates construct this.
    pub(crate) fn from_trusted(sql: String) -> Self {
        Self(sql)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for SanitizedSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct SqlGuard {
    placeholder: String,
}

impl SqlGuard {
    pub fn new(placeholder: impl Into<String>) -> Self {
        Self {
            placeholder: placeholder.into(),
        }
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Validate generated text and bind it to the caller's tenant.
    pub fn sanitize(&self, raw: &RawGenerationText, tenant: &TenantContext) -> Result<SanitizedSql> {
        let statement = self.check_read_only(raw.as_str(), tenant)?;
        let tenant_id = checked_tenant_id(tenant)?;
        let bound = statement.replace(&self.placeholder, tenant_id);
        require_tenant_scope(&bound, tenant_id)?;
        Ok(SanitizedSql(bound))
    }

    /// Re-check a statement that arrives from a client, e.g. a fetch-via-API
    /// round trip. There is no placeholder to substitute at this point.
    pub fn revalidate(&self, sql: &str, tenant: &TenantContext) -> Result<SanitizedSql> {
        let statement = self.check_read_only(sql, tenant)?;
        if statement.contains(&self.placeholder) {
            return Err(NlqError::SqlValidation(ValidationRule::MissingTenantScope));
        }
        let tenant_id = checked_tenant_id(tenant)?;
        require_tenant_scope(&statement, tenant_id)?;
        Ok(SanitizedSql(statement))
    }

    /// Bind a compile-time template to a tenant. Templates are not model
    /// output, so only the tenant substitution applies.
    pub(crate) fn bind_template(&self, template: &str, tenant: &TenantContext) -> Result<SanitizedSql> {
        let tenant_id = checked_tenant_id(tenant)?;
        Ok(SanitizedSql::from_trusted(
            template.replace(&self.placeholder, tenant_id),
        ))
    }

    /// Steps 1, 2, 2a and the single-statement rule. Returns the cleaned statement.
    ///
    /// Quoted occurrences of the caller's tenant id are masked for the keyword
    /// scan, so already-bound text (tenant `grant-high`) checks the same as
    /// its placeholder form.
    fn check_read_only(&self, text: &str, tenant: &TenantContext) -> Result<String> {
        let cleaned = strip_fences(text);
        if cleaned.is_empty() {
            return Err(NlqError::SqlValidation(ValidationRule::EmptyStatement));
        }

        let scanned = match checked_tenant_id(tenant) {
            Ok(id) => cleaned.replace(&format!("'{}'", id), "''"),
            Err(_) => cleaned.to_string(),
        };
        if let Some(keyword) = find_denied_keyword(&scanned) {
            return Err(NlqError::SqlValidation(ValidationRule::DeniedKeyword(keyword)));
        }

        let starts_with_select = cleaned
            .get(..6)
            .map(|head| head.eq_ignore_ascii_case("SELECT"))
            .unwrap_or(false);
        if !starts_with_select {
            return Err(NlqError::SqlValidation(ValidationRule::NotSelect));
        }

        let statement = cleaned.trim_end_matches(';').trim_end();
        if statement.contains(';') {
            return Err(NlqError::SqlValidation(ValidationRule::MultipleStatements));
        }

        Ok(statement.to_string())
    }
}

impl Default for SqlGuard {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_TENANT_PLACEHOLDER)
    }
}

/// Remove Markdown code fences and surrounding whitespace.
pub fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(m) = FENCE_OPEN_RE.find(s) {
        s = &s[m.end()..];
    }
    if let Some(stripped) = s.strip_suffix("```") {
        s = stripped;
    }
    s.trim()
}

fn find_denied_keyword(text: &str) -> Option<&'static str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            DENIED_KEYWORDS
                .iter()
                .copied()
                .find(|kw| token.eq_ignore_ascii_case(kw))
        })
}

fn checked_tenant_id(tenant: &TenantContext) -> Result<&str> {
    let id = tenant.tenant_id.trim();
    if TENANT_ID_RE.is_match(id) {
        Ok(id)
    } else {
        Err(NlqError::SqlValidation(ValidationRule::InvalidTenant))
    }
}

fn require_tenant_scope(statement: &str, tenant_id: &str) -> Result<()> {
    if statement.contains(tenant_id) {
        Ok(())
    } else {
        Err(NlqError::SqlValidation(ValidationRule::MissingTenantScope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantContext {
        TenantContext {
            tenant_id: id.to_string(),
        }
    }

    fn sanitize(text: &str) -> Result<SanitizedSql> {
        SqlGuard::default().sanitize(&RawGenerationText::new(text), &tenant("school-42"))
    }

    fn rule_of(result: Result<SanitizedSql>) -> ValidationRule {
        match result {
            Err(NlqError::SqlValidation(rule)) => rule,
            other => panic!("expected a validation error, got {:?}", other),
        }
    }

    #[test]
    fn denied_keywords_are_rejected_in_any_case_and_fencing() {
        for kw in DENIED_KEYWORDS {
            let lower = kw.to_lowercase();
            let texts = [
                format!("SELECT * FROM students; {} TABLE students", kw),
                format!("```sql\nselect 1; {} x\n```", lower),
                format!("  {} FROM students WHERE school_id = '{{{{TENANT_ID}}}}'", lower),
            ];
            for text in &texts {
                assert_eq!(
                    rule_of(sanitize(text)),
                    ValidationRule::DeniedKeyword(kw),
                    "text: {}",
                    text
                );
            }
        }
    }

    #[test]
    fn keyword_scan_is_token_based() {
        let ok = sanitize("SELECT updated_at, created_by FROM students WHERE school_id = '{{TENANT_ID}}'");
        assert!(ok.is_ok());
        let rejected = sanitize("SELECT update_count FROM stats WHERE school_id = '{{TENANT_ID}}'");
        assert_eq!(rule_of(rejected), ValidationRule::DeniedKeyword("UPDATE"));
    }

    #[test]
    fn non_select_statements_are_rejected() {
        for text in [
            "WITH t AS (SELECT 1) SELECT * FROM t",
            "EXPLAIN SELECT 1",
            "Here is your query: SELECT 1",
            "```\nshow tables\n```",
        ] {
            assert_eq!(rule_of(sanitize(text)), ValidationRule::NotSelect, "text: {}", text);
        }
        assert_eq!(rule_of(sanitize("```sql\n```")), ValidationRule::EmptyStatement);
    }

    #[test]
    fn select_is_case_insensitive_after_fences() {
        let sql = sanitize("```SQL\n  sElEcT id FROM students WHERE school_id = '{{TENANT_ID}}';\n```").unwrap();
        assert_eq!(sql.as_str(), "sElEcT id FROM students WHERE school_id = 'school-42'");
    }

    #[test]
    fn chained_statements_are_rejected() {
        let result = sanitize("SELECT 1 FROM students WHERE school_id = '{{TENANT_ID}}'; SELECT pg_sleep(10)");
        assert_eq!(rule_of(result), ValidationRule::MultipleStatements);
    }

    #[test]
    fn every_placeholder_is_substituted() {
        let sql = sanitize(
            "SELECT s.id FROM students s JOIN attendance a ON a.student_id = s.id \
             WHERE s.school_id = '{{TENANT_ID}}' AND a.school_id = '{{TENANT_ID}}'",
        )
        .unwrap();
        assert!(!sql.as_str().contains("{{TENANT_ID}}"));
        assert_eq!(sql.as_str().matches("'school-42'").count(), 2);
    }

    #[test]
    fn sanitizing_twice_is_a_no_op() {
        let guard = SqlGuard::default();
        let t = tenant("school-42");
        let once = guard
            .sanitize(
                &RawGenerationText::new("```sql\nSELECT * FROM fee_payments WHERE school_id = '{{TENANT_ID}}';\n```"),
                &t,
            )
            .unwrap();
        let twice = guard
            .sanitize(&RawGenerationText::new(once.as_str()), &t)
            .unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn unscoped_statements_and_bad_tenants_are_rejected() {
        assert_eq!(
            rule_of(sanitize("SELECT * FROM students")),
            ValidationRule::MissingTenantScope
        );
        let guard = SqlGuard::default();
        let raw = RawGenerationText::new("SELECT * FROM students WHERE school_id = '{{TENANT_ID}}'");
        assert_eq!(
            rule_of(guard.sanitize(&raw, &tenant("x' OR '1'='1"))),
            ValidationRule::InvalidTenant
        );
        assert_eq!(rule_of(guard.sanitize(&raw, &tenant(""))), ValidationRule::InvalidTenant);
    }

    #[test]
    fn revalidate_requires_the_callers_tenant() {
        let guard = SqlGuard::default();
        let sql = "SELECT * FROM students WHERE school_id = 'school-42'";
        assert!(guard.revalidate(sql, &tenant("school-42")).is_ok());
        assert_eq!(
            rule_of(guard.revalidate(sql, &tenant("school-7"))),
            ValidationRule::MissingTenantScope
        );
        assert_eq!(
            rule_of(guard.revalidate("DELETE FROM students WHERE school_id = 'school-42'", &tenant("school-42"))),
            ValidationRule::DeniedKeyword("DELETE")
        );
    }

    #[test]
    fn tenant_ids_containing_keywords_survive_a_second_pass() {
        let guard = SqlGuard::default();
        let t = tenant("grant-high");
        let once = guard
            .sanitize(
                &RawGenerationText::new("SELECT * FROM students WHERE school_id = '{{TENANT_ID}}'"),
                &t,
            )
            .unwrap();
        assert_eq!(once.as_str(), "SELECT * FROM students WHERE school_id = 'grant-high'");

        let twice = guard.sanitize(&RawGenerationText::new(once.as_str()), &t).unwrap();
        assert_eq!(once, twice);
        assert_eq!(guard.revalidate(once.as_str(), &t).unwrap(), once);

        // Masking covers the literal tenant id only.
        assert_eq!(
            rule_of(guard.revalidate(
                "SELECT * FROM students WHERE school_id = 'grant-high' AND grant = 1",
                &t
            )),
            ValidationRule::DeniedKeyword("GRANT")
        );
        assert!(guard
            .revalidate("SELECT * FROM students WHERE school_id = 'grant-high'", &tenant("update-school"))
            .is_err());
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```sql\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(strip_fences("  SELECT 1  "), "SELECT 1");
        assert_eq!(strip_fences("```\nSELECT 1```"), "SELECT 1");
    }
}
