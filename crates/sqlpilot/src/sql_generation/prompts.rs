use std::fmt::Write as _;

use serde_json::Value;

use crate::safety_gate::UnsafeReason;
use crate::schema::Dialect;
use crate::utils::TextUtils;

const MAX_CELL_CHARS: usize = 200;

pub fn generation_prompt(question: &str, schema_text: &str, dialect: &Dialect) -> String {
    format!(
        "You are an expert {dialect} developer. Translate the user's question into a single SQL query.\n\
         \n\
         Target dialect: {dialect}\n\
         \n\
         Schema:\n\
         {schema_text}\n\
         Question: {question}\n\
         \n\
         Rules:\n\
         - Produce exactly one read-only SELECT statement.\n\
         - Never use DROP, DELETE, TRUNCATE, ALTER, CREATE, INSERT, UPDATE or EXEC.\n\
         - Use table and column names exactly as they appear in the schema.\n\
         - Reply with the SQL only: no markdown, no code fences, no explanation.\n",
        dialect = dialect.display_name(),
        schema_text = schema_text,
        question = question.trim(),
    )
}

/// Prompt for the single repair round after the gate rejected `rejected_sql`.
pub fn repair_prompt(
    question: &str,
    rejected_sql: &str,
    reason: &UnsafeReason,
    schema_text: &str,
    dialect: &Dialect,
) -> String {
    format!(
        "The following {dialect} query was rejected by a safety check ({reason}).\n\
         \n\
         Rejected query:\n\
         {rejected_sql}\n\
         \n\
         Schema:\n\
         {schema_text}\n\
         Original question: {question}\n\
         \n\
         Rewrite it as a single read-only SELECT statement that answers the question \
         using only the tables and columns above. Do not modify data or schema. \
         Reply with the SQL only: no markdown, no code fences, no explanation.\n",
        dialect = dialect.display_name(),
        reason = reason,
        rejected_sql = rejected_sql.trim(),
        schema_text = schema_text,
        question = question.trim(),
    )
}

pub fn interpretation_prompt(question: &str, sql: &str, rows: &[Value], max_rows: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "A user asked a question about their database and the query below was run to answer it."
    );
    let _ = writeln!(out, "\nQuestion: {}", question.trim());
    let _ = writeln!(out, "\nQuery:\n{}", sql.trim());

    if rows.is_empty() {
        out.push_str("\nThe query returned no rows.\n");
    } else {
        let shown = rows.len().min(max_rows);
        let _ = writeln!(out, "\nResults ({} of {} rows):", shown, rows.len());
        for row in rows.iter().take(shown) {
            let line = row.to_string();
            let _ = writeln!(out, "- {}", TextUtils::truncate_with_ellipsis(&line, MAX_CELL_CHARS));
        }
    }

    out.push_str(
        "\nExplain the result to the user in plain language in a few sentences. \
         Do not include SQL or markdown.\n",
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generation_prompt_carries_inputs_and_constraints() {
        let prompt = generation_prompt(
            "  show all employees ",
            "Database: Hr\n",
            &Dialect::PostgreSql,
        );
        assert!(prompt.contains("Target dialect: PostgreSQL"));
        assert!(prompt.contains("Database: Hr"));
        assert!(prompt.contains("Question: show all employees\n"));
        assert!(prompt.contains("SELECT"));
        assert!(prompt.contains("exactly as they appear"));
        assert!(prompt.contains("no markdown"));
    }

    #[test]
    fn test_repair_prompt_includes_rejected_query_and_reason() {
        let prompt = repair_prompt(
            "show all employees",
            "DROP TABLE Employees",
            &UnsafeReason::DeniedKeyword("DROP".to_string()),
            "Database: Hr\n",
            &Dialect::SqlServer,
        );
        assert!(prompt.contains("Rejected query:\nDROP TABLE Employees"));
        assert!(prompt.contains("forbidden keyword DROP"));
        assert!(prompt.contains("Database: Hr"));
        assert!(prompt.contains("Rewrite it"));
    }

    #[test]
    fn test_interpretation_prompt_bounds_rows() {
        let rows: Vec<Value> = (0..5).map(|i| json!({ "id": i })).collect();
        let prompt = interpretation_prompt("how many?", "SELECT id FROM t", &rows, 2);
        assert!(prompt.contains("Results (2 of 5 rows):"));
        assert!(prompt.contains(r#"- {"id":1}"#));
        assert!(!prompt.contains(r#"- {"id":2}"#));
    }

    #[test]
    fn test_interpretation_prompt_empty_rows() {
        let prompt = interpretation_prompt("anything?", "SELECT 1", &[], 10);
        assert!(prompt.contains("The query returned no rows."));
    }
}
