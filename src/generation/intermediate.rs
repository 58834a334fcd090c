//! Intermediate path: question -> numbered pseudocode -> SQL.
//!
//! The pseudocode from the first call is kept verbatim as the candidate's
//! reasoning so the derivation can be audited.

use super::direct::sql_system_prompt;
use super::{scored_candidate, GenerationContext, GeneratorPath};
use crate::error::{EngineError, Result, ServiceFailureKind};
use crate::llm::{extract_sql, LanguageModel, LlmRequest};
use crate::session::{GenerationPath, SqlCandidate};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

fn pseudocode_prompt(question: &str, schema_context: &str) -> String {
    format!(
        r#"Break this question into numbered data-retrieval steps (which tables, filters, joins, groupings, aggregates, ordering).
Do not write SQL.

{}
Question: {}"#,
        schema_context, question
    )
}

pub struct IntermediatePath {
    llm: Arc<dyn LanguageModel>,
}

impl IntermediatePath {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl GeneratorPath for IntermediatePath {
    fn path(&self) -> GenerationPath {
        GenerationPath::Intermediate
    }

    async fn generate(&self, question: &str, ctx: &GenerationContext) -> Result<SqlCandidate> {
        let plan_request = LlmRequest::new(pseudocode_prompt(question, &ctx.schema_context));
        let pseudocode = self.llm.complete(&plan_request).await?;
        let pseudocode = pseudocode.trim().to_string();
        if pseudocode.is_empty() {
            return Err(EngineError::llm(
                ServiceFailureKind::InvalidResponse,
                "Intermediate path received empty pseudocode",
            ));
        }
        debug!(steps = pseudocode.lines().count(), "Intermediate pseudocode received");

        let sql_request = LlmRequest::new(format!(
            "Question: {}\n\nSteps:\n{}\n\nWrite the SQL for these steps.",
            question, pseudocode
        ))
        .with_system(sql_system_prompt(&ctx.schema_context))
        .with_few_shot(ctx.few_shot.clone());
        let response = self.llm.complete(&sql_request).await?;

        let (sql, extraction) = extract_sql(&response).ok_or_else(|| {
            EngineError::llm(ServiceFailureKind::InvalidResponse, "Intermediate path response contained no SQL")
        })?;
        Ok(scored_candidate(
            GenerationPath::Intermediate,
            sql,
            extraction,
            &response,
            pseudocode,
            ctx,
        ))
    }
}
