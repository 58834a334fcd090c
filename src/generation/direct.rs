//! Direct text-to-SQL: one model call with the schema and few-shot examples.

use super::{scored_candidate, GenerationContext, GeneratorPath};
use crate::error::{EngineError, Result, ServiceFailureKind};
use crate::llm::{extract_sql, LanguageModel, LlmRequest};
use crate::session::{GenerationPath, SqlCandidate};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) fn sql_system_prompt(schema_context: &str) -> String {
    format!(
        r#"You translate questions about a lending data warehouse into a single read-only SQL SELECT statement.
Use only the tables and columns listed below. Qualify columns with table names when more than one table is involved.

{}
Return the SQL in a ```sql code block, followed by a line "confidence: <0.0-1.0>"."#,
        schema_context
    )
}

pub struct DirectPath {
    llm: Arc<dyn LanguageModel>,
}

impl DirectPath {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl GeneratorPath for DirectPath {
    fn path(&self) -> GenerationPath {
        GenerationPath::Direct
    }

    async fn generate(&self, question: &str, ctx: &GenerationContext) -> Result<SqlCandidate> {
        let request = LlmRequest::new(format!("Question: {}", question))
            .with_system(sql_system_prompt(&ctx.schema_context))
            .with_few_shot(ctx.few_shot.clone());
        let response = self.llm.complete(&request).await?;

        let (sql, extraction) = extract_sql(&response).ok_or_else(|| {
            EngineError::llm(ServiceFailureKind::InvalidResponse, "Direct path response contained no SQL")
        })?;
        Ok(scored_candidate(
            GenerationPath::Direct,
            sql,
            extraction,
            &response,
            "Generated directly from the question".to_string(),
            ctx,
        ))
    }
}
