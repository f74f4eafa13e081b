//! Prompt Builder - instruction documents for the generation backend
//!
//! Every prompt carries the schema description and the current example-value
//! snapshot. The tenant identifier itself never appears in a prompt; only the
//! placeholder does.

use crate::analyzer::AnalysisResult;
use crate::error::{NlqError, Result};
use crate::example_cache::ExampleValueCache;
use crate::executor::ExecutionResult;
use crate::request::{ConversationTurn, Role};
use crate::schema::SchemaContext;
use crate::store::ExampleValues;
use std::fmt::Write;
use std::sync::Arc;

/// Task framing for SQL synthesis.
const SQL_TASK_FRAMING: &str = r#"You are the query engine of a school management system. Convert the user's question into ONE PostgreSQL query over the schema below.

## Output

Return ONLY the SQL statement. No explanation, no Markdown, no comments."#;

/// Task framing for conversational replies.
const CONVERSATION_FRAMING: &str = r#"You are a helpful assistant for a school management system. Answer the user conversationally and briefly. You know the school database described below; if the user wants data, suggest a question they could ask (for example "show students absent today"). Never invent records or numbers."#;

/// Task framing for narrating a query result.
const NARRATIVE_FRAMING: &str = r#"You are summarising database results for a school administrator. Write 2-4 plain sentences that answer the question using ONLY the facts below. Mention the record count. If a computed insight is given, state it exactly as given. Do not show SQL."#;

/// Rows included in a narrative prompt.
const NARRATIVE_SAMPLE_ROWS: usize = 20;

pub struct PromptBuilder {
    schema: Arc<SchemaContext>,
    examples: Arc<ExampleValueCache>,
    placeholder: String,
    history_turns: usize,
    max_chars: usize,
}

impl PromptBuilder {
    pub fn new(
        schema: Arc<SchemaContext>,
        examples: Arc<ExampleValueCache>,
        placeholder: impl Into<String>,
    ) -> Self {
        Self {
            schema,
            examples,
            placeholder: placeholder.into(),
            history_turns: 10,
            max_chars: 60_000,
        }
    }

    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn schema(&self) -> &SchemaContext {
        &self.schema
    }

    /// Full synthesis prompt: framing, schema, examples, history, rules, question.
    pub async fn build_sql_prompt(&self, question: &str, history: &[ConversationTurn]) -> Result<String> {
        let examples = self.examples.values().await;
        let mut out = String::new();
        out.push_str(SQL_TASK_FRAMING);
        out.push_str("\n\n");
        out.push_str(&self.schema.describe(&self.placeholder));
        push_examples(&mut out, &examples);
        self.push_history(&mut out, history);
        out.push_str(&self.sql_rules());
        let _ = write!(out, "\n## Question\n\n{}\n\nSQL:", question.trim());
        self.checked(out)
    }

    /// Context-only prompt for small talk: no SQL rules.
    pub async fn build_conversation_prompt(
        &self,
        message: &str,
        history: &[ConversationTurn],
    ) -> Result<String> {
        let examples = self.examples.values().await;
        let mut out = String::new();
        out.push_str(CONVERSATION_FRAMING);
        out.push_str("\n\n");
        out.push_str(&self.schema.describe(&self.placeholder));
        push_examples(&mut out, &examples);
        self.push_history(&mut out, history);
        let _ = write!(out, "\n## User\n\n{}\n\nAssistant:", message.trim());
        self.checked(out)
    }

    /// Prompt asking the backend to narrate an execution result.
    pub fn build_narrative_prompt(
        &self,
        question: &str,
        result: &ExecutionResult,
        analysis: Option<&AnalysisResult>,
    ) -> Result<String> {
        let mut out = String::new();
        out.push_str(NARRATIVE_FRAMING);
        let _ = write!(out, "\n\n## Question\n\n{}\n", question.trim());
        let _ = write!(out, "\n## Query\n\n{}\n", result.sql);
        let _ = write!(out, "\n## Records found\n\n{}\n", result.row_count);
        if let Some(narrative) = analysis.and_then(|a| a.narrative.as_deref()) {
            let _ = write!(out, "\n## Computed insight\n\n{}\n", narrative);
        }
        let sample: Vec<_> = result.rows.iter().take(NARRATIVE_SAMPLE_ROWS).collect();
        if !sample.is_empty() {
            let rows = serde_json::to_string_pretty(&sample)?;
            let _ = write!(
                out,
                "\n## Sample rows ({} of {})\n\n{}\n",
                sample.len(),
                result.row_count,
                rows
            );
        }
        out.push_str("\nSummary:");
        self.checked(out)
    }

    fn push_history(&self, out: &mut String, history: &[ConversationTurn]) {
        if history.is_empty() || self.history_turns == 0 {
            return;
        }
        let start = history.len().saturating_sub(self.history_turns);
        out.push_str("\n## Recent conversation\n\n");
        for turn in &history[start..] {
            let speaker = match turn.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let _ = writeln!(out, "{}: {}", speaker, turn.content.trim());
        }
    }

    fn sql_rules(&self) -> String {
        format!(
            r#"
## Rules

1. Produce exactly one SELECT statement. Never write INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, TRUNCATE, GRANT or REVOKE.
2. Every table you reference must be filtered with <alias>.school_id = '{p}'. Write the placeholder '{p}' literally; it is replaced with the real school later.
3. Always JOIN the tables that give context: student names with classes (class name and section), fees with fee_structures (fee_type), results with subjects and exams.
4. Order results meaningfully: by class and section, then name; rankings by the ranked value DESC; dates ascending for upcoming events.
5. For "how many" questions return the full matching records (with names and identifiers), not just COUNT(*). The count is computed from the rows.
6. For ratio, percentage or breakdown questions, either aggregate directly with GROUP BY and a count column, or return the individual records including the categorising column (stream, category, type, status, class_name or subject_name) so the ratio can be computed from them.
7. Use the example values below when filtering on names; class names are roman numerals.
8. "Today" means CURRENT_DATE. Prefer the current academic year (academic_years.is_current) unless another year is named.
"#,
            p = self.placeholder
        )
    }

    fn checked(&self, prompt: String) -> Result<String> {
        if prompt.chars().count() > self.max_chars {
            return Err(NlqError::Prompt(format!(
                "prompt is {} characters, limit is {}",
                prompt.chars().count(),
                self.max_chars
            )));
        }
        Ok(prompt)
    }
}

fn push_examples(out: &mut String, examples: &ExampleValues) {
    if examples.is_empty() {
        return;
    }
    out.push_str("\n## Example values from the live database\n\n");
    for (category, values) in examples {
        let _ = writeln!(out, "- {}: {}", category, values.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalysisResult;
    use serde_json::json;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(
            Arc::new(SchemaContext::school()),
            Arc::new(ExampleValueCache::empty()),
            "{{TENANT_ID}}",
        )
    }

    fn turns(n: usize) -> Vec<ConversationTurn> {
        (0..n)
            .map(|i| ConversationTurn {
                role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                content: format!("turn-{:02}", i),
            })
            .collect()
    }

    #[tokio::test]
    async fn sql_prompt_has_every_section() {
        let prompt = builder()
            .build_sql_prompt("Which students in Class XII are absent today?", &turns(2))
            .await
            .unwrap();
        assert!(prompt.starts_with("You are the query engine"));
        assert!(prompt.contains("Table attendance:"));
        assert!(prompt.contains("## Recent conversation"));
        assert!(prompt.contains("school_id = '{{TENANT_ID}}'"));
        assert!(prompt.contains("not just COUNT(*)"));
        assert!(prompt.contains("GROUP BY"));
        assert!(prompt.ends_with("Which students in Class XII are absent today?\n\nSQL:"));
    }

    #[tokio::test]
    async fn only_the_last_ten_turns_are_kept() {
        let prompt = builder().build_sql_prompt("list staff", &turns(14)).await.unwrap();
        assert!(!prompt.contains("turn-03"));
        assert!(prompt.contains("turn-04"));
        assert!(prompt.contains("turn-13"));
    }

    #[tokio::test]
    async fn conversation_prompt_has_no_sql_rules() {
        let prompt = builder().build_conversation_prompt("thanks!", &[]).await.unwrap();
        assert!(prompt.contains("Table students:"));
        assert!(!prompt.contains("## Rules"));
        assert!(prompt.ends_with("thanks!\n\nAssistant:"));
    }

    #[tokio::test]
    async fn oversized_prompts_are_rejected() {
        let small = builder().with_max_chars(500);
        let err = small.build_sql_prompt("list staff", &[]).await.unwrap_err();
        assert!(matches!(err, NlqError::Prompt(_)));
    }

    #[test]
    fn narrative_prompt_carries_count_insight_and_sample() {
        let rows: Vec<_> = (0..25)
            .map(|i| json!({"student_id": i}).as_object().cloned().unwrap())
            .collect();
        let result = ExecutionResult {
            row_count: rows.len(),
            rows,
            sql: "SELECT 1".to_string(),
        };
        let analysis = AnalysisResult {
            narrative: Some("Science to Arts ratio is 2.00:1".to_string()),
            structured_insight: None,
        };
        let prompt = builder()
            .build_narrative_prompt("ratio of science to arts", &result, Some(&analysis))
            .unwrap();
        assert!(prompt.contains("## Query\n\nSELECT 1"));
        assert!(prompt.contains("## Records found\n\n25"));
        assert!(prompt.contains("Science to Arts ratio is 2.00:1"));
        assert!(prompt.contains("Sample rows (20 of 25)"));
    }
}
