//! Stage 2: every referenced table and column must exist in the schema snapshot.

use super::analysis::{parse_query, ColumnRef, QueryAnalysis, Qualifier};
use super::{Stage, ValidationContext, ValidationResult, Validator};
use crate::metadata::SchemaMetadata;
use crate::session::SqlCandidate;
use async_trait::async_trait;
use std::collections::BTreeSet;

const PENALTY_PER_ERROR: f64 = 0.2;
const SUGGESTION_SIMILARITY: f64 = 0.8;

pub struct SchemaValidator;

#[async_trait]
impl Validator for SchemaValidator {
    fn stage(&self) -> Stage {
        Stage::Schema
    }

    async fn validate(&self, sql: &str, _candidates: &[SqlCandidate], ctx: &ValidationContext) -> ValidationResult {
        let Some(statement) = parse_query(sql) else {
            return ValidationResult::fail(Stage::Schema, vec!["Statement could not be analyzed".to_string()]);
        };
        let report = ReferenceReport::check(&QueryAnalysis::of(&statement), &ctx.schema);
        let errors = report.errors();
        if errors.is_empty() {
            return ValidationResult::pass(Stage::Schema);
        }
        let penalty = (errors.len() as f64 * PENALTY_PER_ERROR).min(1.0);
        ValidationResult::fail(Stage::Schema, errors)
            .with_multiplier(1.0 - penalty)
            .with_suggestions(report.suggestions)
    }
}

/// Outcome of resolving a statement's references against a schema.
#[derive(Debug, Clone, Default)]
pub struct ReferenceReport {
    pub checked: usize,
    pub missing_tables: Vec<String>,
    /// Missing columns with the table they were looked up in, if known
    pub missing_columns: Vec<(ColumnRef, Option<String>)>,
    pub unknown_qualifiers: Vec<ColumnRef>,
    pub suggestions: Vec<String>,
}

impl ReferenceReport {
    pub fn check(analysis: &QueryAnalysis, schema: &SchemaMetadata) -> Self {
        let mut report = ReferenceReport::default();

        let tables = analysis.table_names();
        for table in &tables {
            report.checked += 1;
            if !schema.has_table(table) {
                report.missing_tables.push(table.clone());
                if let Some(s) = closest(table, schema.table_names().into_iter()) {
                    report.suggestions.push(format!("Did you mean table '{}' instead of '{}'?", s, table));
                }
            }
        }
        let known_tables: Vec<&str> = tables
            .iter()
            .filter(|t| schema.has_table(t))
            .map(|t| t.as_str())
            .collect();

        for column in &analysis.columns {
            match column.qualifier {
                Some(ref q) => match analysis.resolve_qualifier(q) {
                    Qualifier::Opaque => {}
                    Qualifier::Unknown => {
                        report.checked += 1;
                        report.unknown_qualifiers.push(column.clone());
                    }
                    Qualifier::Table(table) => {
                        let Some(meta) = schema.table(&table) else {
                            continue;
                        };
                        report.checked += 1;
                        if !meta.has_column(&column.name) {
                            let names = meta.columns.iter().map(|c| c.name.as_str());
                            if let Some(s) = closest(&column.name, names) {
                                report
                                    .suggestions
                                    .push(format!("Did you mean '{}.{}' instead of '{}'?", q, s, column));
                            }
                            report.missing_columns.push((column.clone(), Some(table)));
                        }
                    }
                },
                None => {
                    if analysis.output_names.contains(&column.name) {
                        continue;
                    }
                    report.checked += 1;
                    let found = known_tables
                        .iter()
                        .filter_map(|t| schema.table(t))
                        .any(|t| t.has_column(&column.name));
                    let opaque_ok = analysis.has_opaque_sources()
                        && schema.tables.iter().any(|t| t.has_column(&column.name));
                    if !found && !opaque_ok {
                        let names = known_tables
                            .iter()
                            .filter_map(|t| schema.table(t))
                            .flat_map(|t| t.columns.iter().map(|c| c.name.as_str()));
                        if let Some(s) = closest(&column.name, names) {
                            report
                                .suggestions
                                .push(format!("Did you mean '{}' instead of '{}'?", s, column.name));
                        } else if let Some(owner) = schema.tables_with_column(&column.name).first() {
                            report
                                .suggestions
                                .push(format!("Column '{}' exists in table '{}'; add it to FROM", column.name, owner.name));
                        }
                        let scope = (known_tables.len() == 1).then(|| known_tables[0].to_string());
                        report.missing_columns.push((column.clone(), scope));
                    }
                }
            }
        }
        report
    }

    /// One message per missing table, column, or unresolved qualifier.
    pub fn errors(&self) -> Vec<String> {
        let mut errors: Vec<String> = self
            .missing_tables
            .iter()
            .map(|t| format!("Table '{}' does not exist", t))
            .collect();
        for (column, table) in &self.missing_columns {
            errors.push(match table {
                Some(t) => format!("Column '{}' does not exist in table '{}'", column, t),
                None => format!("Column '{}' does not exist in any referenced table", column),
            });
        }
        for column in &self.unknown_qualifiers {
            errors.push(format!("'{}' refers to an unknown table or alias", column));
        }
        errors
    }

    pub fn error_count(&self) -> usize {
        self.missing_tables.len() + self.missing_columns.len() + self.unknown_qualifiers.len()
    }

    /// Fraction of references that resolved; 1.0 when there was nothing to check.
    pub fn grounding(&self) -> f64 {
        if self.checked == 0 {
            return 1.0;
        }
        let resolved = self.checked.saturating_sub(self.error_count());
        resolved as f64 / self.checked as f64
    }
}

/// Grounding of `sql` against the schema, or `None` if it is not a parseable query.
pub fn grounding(sql: &str, schema: &SchemaMetadata) -> Option<f64> {
    let statement = parse_query(sql)?;
    Some(ReferenceReport::check(&QueryAnalysis::of(&statement), schema).grounding())
}

fn closest<'a>(name: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    let unique: BTreeSet<&str> = candidates.collect();
    unique
        .into_iter()
        .map(|c| (strsim::jaro_winkler(&name.to_lowercase(), &c.to_lowercase()), c))
        .filter(|(score, _)| *score >= SUGGESTION_SIMILARITY)
        .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
        .map(|(_, c)| c)
}
