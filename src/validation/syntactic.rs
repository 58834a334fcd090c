//! Stage 1: parse the statement and refuse anything that is not a single read-only query.

use super::analysis::parse_statements;
use super::{Stage, ValidationContext, ValidationResult, Validator};
use crate::session::SqlCandidate;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::parser::ParserError;

lazy_static! {
    static ref TRAILING_COMMA: Regex = Regex::new(r"(?i),\s*(?:(?:FROM|WHERE|GROUP|ORDER)\b|\))").unwrap();
    static ref LEADING_WORD: Regex = Regex::new(r"^\s*([A-Za-z]+)").unwrap();
}

pub struct SyntacticValidator;

#[async_trait]
impl Validator for SyntacticValidator {
    fn stage(&self) -> Stage {
        Stage::Syntactic
    }

    async fn validate(&self, sql: &str, _candidates: &[SqlCandidate], _ctx: &ValidationContext) -> ValidationResult {
        check(sql)
    }
}

fn check(sql: &str) -> ValidationResult {
    if sql.trim().is_empty() {
        return ValidationResult::fail(Stage::Syntactic, vec!["No SQL statement was produced".to_string()])
            .with_suggestions(vec!["Rephrase the question so it asks for specific data".to_string()]);
    }

    let statements = match parse_statements(sql) {
        Ok(statements) => statements,
        Err(e) => {
            let message = match e {
                ParserError::TokenizerError(m) => format!("Tokenizer error: {}", m),
                ParserError::ParserError(m) => format!("Parse error: {}", m),
                ParserError::RecursionLimitExceeded => "Statement is nested too deeply".to_string(),
            };
            return ValidationResult::fail(Stage::Syntactic, vec![message]).with_suggestions(parse_suggestions(sql));
        }
    };

    match statements.as_slice() {
        [] => ValidationResult::fail(Stage::Syntactic, vec!["No SQL statement was produced".to_string()]),
        [Statement::Query(query)] => {
            let errors = query_violations(query);
            if errors.is_empty() {
                ValidationResult::pass(Stage::Syntactic)
            } else {
                ValidationResult::fail(Stage::Syntactic, errors)
                    .with_suggestions(vec!["Ask a question that only reads data".to_string()])
            }
        }
        [_] => {
            let verb = LEADING_WORD
                .captures(sql)
                .map(|c| c[1].to_uppercase())
                .unwrap_or_else(|| "statement".to_string());
            ValidationResult::fail(
                Stage::Syntactic,
                vec![format!("Only SELECT queries are allowed; found a {} statement", verb)],
            )
            .with_suggestions(vec!["Ask a question that only reads data".to_string()])
        }
        many => ValidationResult::fail(
            Stage::Syntactic,
            vec![format!("Expected a single statement, found {}", many.len())],
        )
        .with_suggestions(vec!["Remove extra statements separated by ';'".to_string()]),
    }
}

/// Data-modifying or locking constructs hidden inside an otherwise valid query.
fn query_violations(query: &Query) -> Vec<String> {
    let mut errors = Vec::new();
    if !query.locks.is_empty() {
        errors.push("Row locking clauses (FOR UPDATE/SHARE) are not allowed".to_string());
    }
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            errors.extend(query_violations(&cte.query));
        }
    }
    body_violations(&query.body, &mut errors);
    errors
}

fn body_violations(body: &SetExpr, errors: &mut Vec<String>) {
    match body {
        SetExpr::Select(select) => {
            if select.into.is_some() {
                errors.push("SELECT INTO creates a table and is not allowed".to_string());
            }
        }
        SetExpr::Query(query) => errors.extend(query_violations(query)),
        SetExpr::SetOperation { left, right, .. } => {
            body_violations(left, errors);
            body_violations(right, errors);
        }
        SetExpr::Insert(_) => errors.push("INSERT is not allowed".to_string()),
        SetExpr::Update(_) => errors.push("UPDATE is not allowed".to_string()),
        SetExpr::Values(_) | SetExpr::Table(_) => {}
    }
}

/// Remediation hints for unparseable SQL, from cheap textual checks.
fn parse_suggestions(sql: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    let open = sql.matches('(').count();
    let close = sql.matches(')').count();
    if open != close {
        suggestions.push(format!("Check for missing parentheses ({} opening, {} closing)", open, close));
    }
    if sql.matches('\'').count() % 2 == 1 {
        suggestions.push("Check for an unterminated string literal".to_string());
    }
    if TRAILING_COMMA.is_match(sql) {
        suggestions.push("Remove the trailing comma before the next clause".to_string());
    }
    if suggestions.is_empty() {
        suggestions.push("Check the statement for typos in keywords and missing commas".to_string());
    }
    suggestions
}
