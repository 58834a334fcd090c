//! Stage 3: Business Rules
//!
//! Domain constraints loaded from configuration. Violations are warnings that
//! cost `penalty` each; this stage never aborts the pipeline.

use super::analysis::{parse_query, QueryAnalysis, Qualifier};
use super::{Stage, ValidationContext, ValidationResult, Validator};
use crate::error::{EngineError, Result};
use crate::metadata::SchemaMetadata;
use crate::session::SqlCandidate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum BusinessRule {
    /// Disallow joining two tables; by default only when the join has no condition
    ForbiddenJoin {
        left: String,
        right: String,
        #[serde(default = "default_true")]
        cross_only: bool,
    },
    /// Aggregates over a table this large need a WHERE or GROUP BY
    BoundedAggregate { table: String, min_rows: u64 },
    /// Row-level SELECTs must carry a LIMIT
    RequireLimit,
    /// Column that must never be read (directly or through `*`)
    ForbiddenColumn { table: String, column: String },
}

fn default_true() -> bool {
    true
}

struct Violation {
    message: String,
    suggestion: String,
}

impl BusinessRule {
    fn check(&self, analysis: &QueryAnalysis, schema: &SchemaMetadata) -> Option<Violation> {
        match self {
            BusinessRule::ForbiddenJoin { left, right, cross_only } => {
                let (left, right) = (left.to_lowercase(), right.to_lowercase());
                let hit = analysis.joins.iter().any(|j| {
                    let pair = (j.right == right && j.left.contains(&left)) || (j.right == left && j.left.contains(&right));
                    pair && (!cross_only || !j.constrained)
                });
                hit.then(|| Violation {
                    message: if *cross_only {
                        format!("Unconstrained join between '{}' and '{}' is not allowed", left, right)
                    } else {
                        format!("Joining '{}' with '{}' is not allowed", left, right)
                    },
                    suggestion: match schema.relationship_between(&left, &right) {
                        Some(rel) => format!(
                            "Join on {}.{} = {}.{}",
                            rel.source_table, rel.source_column, rel.target_table, rel.target_column
                        ),
                        None => format!("Query '{}' and '{}' separately", left, right),
                    },
                })
            }
            BusinessRule::BoundedAggregate { table, min_rows } => {
                let table = table.to_lowercase();
                let rows = schema.table(&table).and_then(|t| t.row_count)?;
                if rows < *min_rows {
                    return None;
                }
                let unbounded = analysis
                    .selects
                    .iter()
                    .any(|s| s.tables.contains(&table) && s.has_aggregate && !s.has_where && !s.has_group_by);
                unbounded.then(|| Violation {
                    message: format!("Aggregate over '{}' ({} rows) has no WHERE or GROUP BY", table, rows),
                    suggestion: format!("Filter '{}' (for example by status or date) before aggregating", table),
                })
            }
            BusinessRule::RequireLimit => {
                let row_level = analysis
                    .selects
                    .iter()
                    .any(|s| !s.tables.is_empty() && !s.has_aggregate && !s.has_group_by);
                (row_level && !analysis.has_limit).then(|| Violation {
                    message: "Row-level query has no LIMIT".to_string(),
                    suggestion: "Add a LIMIT clause".to_string(),
                })
            }
            BusinessRule::ForbiddenColumn { table, column } => {
                let (table, column) = (table.to_lowercase(), column.to_lowercase());
                let reads_table = analysis.tables.iter().any(|t| t.name == table);
                if !reads_table {
                    return None;
                }
                let direct = analysis.columns.iter().any(|c| {
                    c.name == column
                        && match c.qualifier {
                            Some(ref q) => analysis.resolve_qualifier(q) == Qualifier::Table(table.clone()),
                            None => true,
                        }
                });
                let wildcard = analysis.selects.iter().any(|s| {
                    s.wildcards.iter().any(|w| match w {
                        None => s.tables.contains(&table),
                        Some(q) => analysis.resolve_qualifier(q) == Qualifier::Table(table.clone()),
                    })
                });
                (direct || wildcard).then(|| Violation {
                    message: format!("Column '{}.{}' is restricted", table, column),
                    suggestion: format!("List the needed columns of '{}' explicitly, leaving out '{}'", table, column),
                })
            }
        }
    }
}

/// The configured rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusinessRules {
    pub rules: Vec<BusinessRule>,
}

impl BusinessRules {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("Failed to read business rules {}: {}", path.display(), e)))?;
        let rules = Self::from_json(&content)?;
        info!("Loaded {} business rules", rules.rules.len());
        Ok(rules)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| EngineError::Configuration(format!("Invalid business rules: {}", e)))
    }
}

pub struct BusinessRuleValidator {
    rules: Arc<BusinessRules>,
    penalty: f64,
}

impl BusinessRuleValidator {
    pub fn new(rules: Arc<BusinessRules>, penalty: f64) -> Self {
        Self { rules, penalty }
    }
}

#[async_trait]
impl Validator for BusinessRuleValidator {
    fn stage(&self) -> Stage {
        Stage::BusinessRules
    }

    async fn validate(&self, sql: &str, _candidates: &[SqlCandidate], ctx: &ValidationContext) -> ValidationResult {
        let Some(statement) = parse_query(sql) else {
            return ValidationResult::pass(Stage::BusinessRules);
        };
        let analysis = QueryAnalysis::of(&statement);
        let violations: Vec<Violation> = self
            .rules
            .rules
            .iter()
            .filter_map(|rule| rule.check(&analysis, &ctx.schema))
            .collect();
        if violations.is_empty() {
            return ValidationResult::pass(Stage::BusinessRules);
        }

        let multiplier = (1.0 - self.penalty * violations.len() as f64).max(0.0);
        let mut result = ValidationResult::pass(Stage::BusinessRules)
            .with_multiplier(multiplier)
            .with_suggestions(violations.iter().map(|v| v.suggestion.clone()).collect());
        result.passed = false;
        result.warnings = violations.into_iter().map(|v| v.message).collect();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::tests::ctx;

    fn bundled() -> Arc<BusinessRules> {
        Arc::new(BusinessRules::from_json(include_str!("../../config/business_rules.json")).unwrap())
    }

    async fn run(sql: &str) -> ValidationResult {
        BusinessRuleValidator::new(bundled(), 0.1).validate(sql, &[], &ctx()).await
    }

    #[tokio::test]
    async fn test_compliant_query_passes() {
        let result = run("SELECT COUNT(*) FROM loans WHERE status = 'active'").await;
        assert!(result.passed);
        assert_eq!(result.confidence_multiplier, 1.0);
    }

    #[tokio::test]
    async fn test_unbounded_aggregate_warns() {
        let result = run("SELECT SUM(outstanding_balance) FROM loans").await;
        assert!(!result.passed);
        assert_eq!(result.errors.len(), 0);
        assert_eq!(result.warnings.len(), 1);
        assert!((result.confidence_multiplier - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cross_join_and_missing_limit_compound() {
        let result = run("SELECT l.loan_id, c.city FROM loans l CROSS JOIN customers c").await;
        assert_eq!(result.warnings.len(), 2, "{:?}", result.warnings);
        assert!((result.confidence_multiplier - 0.8).abs() < 1e-9);
        assert!(result.suggestions.iter().any(|s| s.contains("customer_id")));
    }

    #[tokio::test]
    async fn test_constrained_join_is_allowed() {
        let result = run(
            "SELECT c.city, COUNT(*) FROM customers c JOIN loans l ON l.customer_id = c.customer_id GROUP BY c.city",
        )
        .await;
        assert!(result.passed, "{:?}", result.warnings);
    }

    #[tokio::test]
    async fn test_restricted_column_through_wildcard() {
        let result = run("SELECT * FROM customers LIMIT 5").await;
        assert!(result.warnings.iter().any(|w| w.contains("national_id")));

        let result = run("SELECT c.national_id FROM customers c LIMIT 5").await;
        assert!(result.warnings.iter().any(|w| w.contains("national_id")));
    }

    #[test]
    fn test_rules_parse_tags() {
        let rules = BusinessRules::from_json(r#"[{"rule": "require_limit"}, {"rule": "forbidden_join", "left": "a", "right": "b"}]"#)
            .unwrap();
        assert_eq!(rules.rules[0], BusinessRule::RequireLimit);
        assert!(matches!(rules.rules[1], BusinessRule::ForbiddenJoin { cross_only: true, .. }));
    }
}
