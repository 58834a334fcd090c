//! Logical Plan path
//!
//! The model returns a JSON plan instead of SQL. `PlanCompiler` turns the plan
//! into SQL deterministically, resolving table and column names against the
//! schema snapshot. The plan JSON is kept verbatim as reasoning.

use super::{scored_candidate, GenerationContext, GeneratorPath};
use crate::confidence::ExtractionQuality;
use crate::error::{EngineError, Result, ServiceFailureKind};
use crate::llm::{extract_json, LanguageModel, LlmRequest};
use crate::metadata::{SchemaMetadata, Table};
use crate::session::{GenerationPath, SqlCandidate};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Minimum Jaro-Winkler similarity for a near-miss column to be accepted.
const NEAR_COLUMN_SIMILARITY: f64 = 0.8;

const PLAN_FORMAT: &str = r#"{"tables":["loans"],
 "joins":[{"left_table":"loans","right_table":"customers","join_type":"INNER","condition":[{"left_column":"customer_id","right_column":"customer_id"}]}],
 "columns":[{"name":"city","table":"customers"}],
 "aggregations":[{"function":"count","column":"*","alias":"loan_count"}],
 "filters":[{"column":"status","table":"loans","operator":"=","value":"active"}],
 "group_by":["customers.city"],
 "order_by":[{"column":"loan_count","direction":"DESC"}],
 "limit":10,
 "confidence":0.8}"#;

/// Structured query plan returned by the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub tables: Vec<String>,
    #[serde(default)]
    pub joins: Vec<JoinSpec>,
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBySpec>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// sum, avg, count, min or max
    pub function: String,
    /// Column to aggregate; `*` only with count
    pub column: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub distinct: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSpec {
    pub column: String,
    #[serde(default)]
    pub table: Option<String>,
    /// =, !=, >, <, >=, <=, IN, NOT IN, LIKE, IS NULL, IS NOT NULL
    pub operator: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBySpec {
    pub column: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_table: String,
    pub right_table: String,
    /// INNER, LEFT, RIGHT or FULL
    #[serde(default)]
    pub join_type: Option<String>,
    /// Column pairs; inferred from schema relationships when empty
    #[serde(default)]
    pub condition: Vec<JoinCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCondition {
    pub left_column: String,
    pub right_column: String,
}

fn plan_error(message: impl Into<String>) -> EngineError {
    EngineError::llm(ServiceFailureKind::InvalidResponse, message)
}

/// Deterministic plan -> SQL compilation against one schema snapshot.
pub struct PlanCompiler<'a> {
    schema: &'a SchemaMetadata,
}

impl<'a> PlanCompiler<'a> {
    pub fn new(schema: &'a SchemaMetadata) -> Self {
        Self { schema }
    }

    pub fn compile(&self, plan: &LogicalPlan) -> Result<String> {
        let mut names: Vec<&str> = plan.tables.iter().map(|t| t.as_str()).collect();
        for join in &plan.joins {
            names.push(&join.left_table);
            names.push(&join.right_table);
        }
        let tables = self.resolve_tables(&names);
        let Some(main) = tables.first().copied() else {
            return Err(plan_error("Plan names no table that exists in the schema"));
        };
        let qualify = tables.len() > 1;

        let mut parts = vec![self.select_clause(plan, main, qualify)?, format!("FROM {}", main.name)];
        parts.extend(self.join_clauses(plan, main)?);

        let mut conditions = Vec::with_capacity(plan.filters.len());
        for filter in &plan.filters {
            let column = self.resolve_column(&filter.column, filter.table.as_deref(), main, qualify)?;
            conditions.push(filter_condition(&column, &filter.operator, filter.value.as_ref())?);
        }
        if !conditions.is_empty() {
            parts.push(format!("WHERE {}", conditions.join(" AND ")));
        }

        let group_by = self.group_by_columns(plan, main, qualify)?;
        if !group_by.is_empty() {
            parts.push(format!("GROUP BY {}", group_by.join(", ")));
        }

        if !plan.order_by.is_empty() {
            let mut keys = Vec::with_capacity(plan.order_by.len());
            for spec in &plan.order_by {
                let column = if is_output_alias(plan, &spec.column) {
                    spec.column.clone()
                } else {
                    self.resolve_column(&spec.column, spec.table.as_deref(), main, qualify)?
                };
                let direction = match spec.direction.as_deref().map(str::to_uppercase).as_deref() {
                    Some("DESC") => "DESC",
                    _ => "ASC",
                };
                keys.push(format!("{} {}", column, direction));
            }
            parts.push(format!("ORDER BY {}", keys.join(", ")));
        }

        if let Some(limit) = plan.limit {
            parts.push(format!("LIMIT {}", limit));
        }

        let sql = parts.join(" ");
        debug!(sql = %sql, "Compiled logical plan");
        Ok(sql)
    }

    /// Exact (case-insensitive) name first, then containment either way. Unknown names are dropped.
    fn resolve_tables(&self, names: &[&str]) -> Vec<&'a Table> {
        let mut resolved: Vec<&'a Table> = Vec::new();
        for name in names {
            let name = name.trim().to_lowercase();
            let table = self.schema.table(&name).or_else(|| {
                self.schema.tables.iter().find(|t| {
                    let t_name = t.name.to_lowercase();
                    !name.is_empty() && (t_name.contains(&name) || name.contains(&t_name))
                })
            });
            match table {
                Some(t) if !resolved.iter().any(|r| r.name == t.name) => resolved.push(t),
                Some(_) => {}
                None => warn!(table = %name, "Plan references unknown table"),
            }
        }
        resolved
    }

    fn table_for(&self, name: Option<&str>, default: &'a Table) -> Result<&'a Table> {
        match name {
            Some(n) => self
                .resolve_tables(&[n])
                .first()
                .copied()
                .ok_or_else(|| plan_error(format!("Plan references unknown table '{}'", n))),
            None => Ok(default),
        }
    }

    /// Resolve against the schema; an unmatched name is passed through (if it is
    /// a plain identifier) so schema validation can report it.
    fn resolve_column(&self, column: &str, table: Option<&str>, default: &'a Table, qualify: bool) -> Result<String> {
        let (table_hint, column) = match column.split_once('.') {
            Some((t, c)) if table.is_none() => (Some(t), c),
            _ => (table, column),
        };
        let table = self.table_for(table_hint, default)?;
        let wanted = column.trim().to_lowercase();
        if !IDENTIFIER.is_match(&wanted) {
            return Err(plan_error(format!("Plan column '{}' is not a plain identifier", column)));
        }
        let name = match table.column(&wanted) {
            Some(c) => c.name.clone(),
            None => near_column(table, &wanted).unwrap_or(wanted),
        };
        Ok(if qualify { format!("{}.{}", table.name, name) } else { name })
    }

    fn select_clause(&self, plan: &LogicalPlan, main: &'a Table, qualify: bool) -> Result<String> {
        let mut items = Vec::new();
        for col in &plan.columns {
            let column = self.resolve_column(&col.name, col.table.as_deref(), main, qualify)?;
            items.push(format!("{}{}", column, alias_suffix(col.alias.as_deref())?));
        }
        for agg in &plan.aggregations {
            let function = agg.function.to_uppercase();
            if !matches!(function.as_str(), "SUM" | "AVG" | "COUNT" | "MIN" | "MAX") {
                return Err(plan_error(format!("Unsupported aggregation '{}'", agg.function)));
            }
            let argument = if agg.column.trim() == "*" {
                if function != "COUNT" {
                    return Err(plan_error(format!("{}(*) is not valid", function)));
                }
                "*".to_string()
            } else {
                self.resolve_column(&agg.column, agg.table.as_deref(), main, qualify)?
            };
            let distinct = if agg.distinct && argument != "*" { "DISTINCT " } else { "" };
            items.push(format!(
                "{}({}{}){}",
                function,
                distinct,
                argument,
                alias_suffix(agg.alias.as_deref())?
            ));
        }
        if items.is_empty() {
            items.push("*".to_string());
        }
        Ok(format!("SELECT {}", items.join(", ")))
    }

    fn join_clauses(&self, plan: &LogicalPlan, main: &'a Table) -> Result<Vec<String>> {
        let mut joined = vec![main.name.clone()];
        let mut clauses = Vec::new();
        for join in &plan.joins {
            let left = self.table_for(Some(join.left_table.as_str()), main)?;
            let right = self.table_for(Some(join.right_table.as_str()), main)?;
            // The side not yet in FROM is the one being joined.
            let (left, right, flipped) = if joined.contains(&right.name) && !joined.contains(&left.name) {
                (right, left, true)
            } else {
                (left, right, false)
            };
            if joined.contains(&right.name) {
                continue;
            }

            let join_type = match join.join_type.as_deref().map(str::to_uppercase).as_deref() {
                None | Some("INNER") => "INNER",
                Some("LEFT") => "LEFT",
                Some("RIGHT") => "RIGHT",
                Some("FULL") => "FULL",
                Some(other) => return Err(plan_error(format!("Unsupported join type '{}'", other))),
            };

            let pairs: Vec<(String, String)> = if join.condition.is_empty() {
                let rel = self
                    .schema
                    .relationship_between(&left.name, &right.name)
                    .ok_or_else(|| {
                        plan_error(format!("No join condition between '{}' and '{}'", left.name, right.name))
                    })?;
                if rel.source_table.eq_ignore_ascii_case(&left.name) {
                    vec![(rel.source_column.clone(), rel.target_column.clone())]
                } else {
                    vec![(rel.target_column.clone(), rel.source_column.clone())]
                }
            } else {
                join.condition
                    .iter()
                    .map(|c| {
                        if flipped {
                            (c.right_column.clone(), c.left_column.clone())
                        } else {
                            (c.left_column.clone(), c.right_column.clone())
                        }
                    })
                    .collect()
            };

            let mut on = Vec::with_capacity(pairs.len());
            for (l, r) in pairs {
                let l = self.resolve_column(&l, Some(left.name.as_str()), left, true)?;
                let r = self.resolve_column(&r, Some(right.name.as_str()), right, true)?;
                on.push(format!("{} = {}", l, r));
            }
            clauses.push(format!("{} JOIN {} ON {}", join_type, right.name, on.join(" AND ")));
            joined.push(right.name.clone());
        }

        // Tables listed but never joined get an inferred join.
        for table in self.resolve_tables(&plan.tables.iter().map(|t| t.as_str()).collect::<Vec<_>>()) {
            if joined.contains(&table.name) {
                continue;
            }
            let rel = joined
                .iter()
                .find_map(|j| self.schema.relationship_between(j, &table.name))
                .ok_or_else(|| plan_error(format!("No relationship joins '{}' to the other tables", table.name)))?;
            clauses.push(format!(
                "INNER JOIN {} ON {}.{} = {}.{}",
                table.name, rel.source_table, rel.source_column, rel.target_table, rel.target_column
            ));
            joined.push(table.name.clone());
        }
        Ok(clauses)
    }

    /// Explicit GROUP BY, or the plain columns when the plan aggregates without one.
    fn group_by_columns(&self, plan: &LogicalPlan, main: &'a Table, qualify: bool) -> Result<Vec<String>> {
        if !plan.group_by.is_empty() {
            return plan
                .group_by
                .iter()
                .map(|c| self.resolve_column(c, None, main, qualify))
                .collect();
        }
        if plan.aggregations.is_empty() {
            return Ok(Vec::new());
        }
        plan.columns
            .iter()
            .map(|c| self.resolve_column(&c.name, c.table.as_deref(), main, qualify))
            .collect()
    }
}

fn is_output_alias(plan: &LogicalPlan, name: &str) -> bool {
    plan.aggregations.iter().any(|a| a.alias.as_deref() == Some(name))
        || plan.columns.iter().any(|c| c.alias.as_deref() == Some(name))
}

fn alias_suffix(alias: Option<&str>) -> Result<String> {
    match alias {
        None => Ok(String::new()),
        Some(a) if IDENTIFIER.is_match(a) => Ok(format!(" AS {}", a)),
        Some(a) => Err(plan_error(format!("Alias '{}' is not a plain identifier", a))),
    }
}

fn filter_condition(column: &str, operator: &str, value: Option<&serde_json::Value>) -> Result<String> {
    let op = operator.trim().to_uppercase();
    let required = || value.ok_or_else(|| plan_error(format!("Operator {} requires a value", op)));
    match op.as_str() {
        "IS NULL" | "IS NOT NULL" => Ok(format!("{} {}", column, op)),
        "=" | "!=" | "<>" | ">" | "<" | ">=" | "<=" | "LIKE" => Ok(format!("{} {} {}", column, op, literal(required()?)?)),
        "IN" | "NOT IN" => {
            let items = required()?
                .as_array()
                .ok_or_else(|| plan_error(format!("{} requires an array value", op)))?;
            if items.is_empty() {
                return Err(plan_error(format!("{} requires at least one value", op)));
            }
            let values = items.iter().map(literal).collect::<Result<Vec<_>>>()?;
            Ok(format!("{} {} ({})", column, op, values.join(", ")))
        }
        _ => Err(plan_error(format!("Unknown operator: {}", operator))),
    }
}

/// SQL literal for a JSON scalar. Strings are single-quoted with quotes doubled.
fn literal(value: &serde_json::Value) -> Result<String> {
    match value {
        serde_json::Value::String(s) => Ok(format!("'{}'", s.replace('\'', "''"))),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
        serde_json::Value::Null => Ok("NULL".to_string()),
        other => Err(plan_error(format!("Unsupported filter value {}", other))),
    }
}

pub struct LogicalPlanPath {
    llm: Arc<dyn LanguageModel>,
}

impl LogicalPlanPath {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl GeneratorPath for LogicalPlanPath {
    fn path(&self) -> GenerationPath {
        GenerationPath::LogicalPlan
    }

    async fn generate(&self, question: &str, ctx: &GenerationContext) -> Result<SqlCandidate> {
        let request = LlmRequest::new(format!(
            "{}\nQuestion: {}\n\nReturn JSON only, in this format:\n{}",
            ctx.schema_context, question, PLAN_FORMAT
        ))
        .with_system("You plan read-only queries over a lending data warehouse as structured JSON.");
        let response = self.llm.complete(&request).await?;

        let plan_json = extract_json(&response);
        let plan: LogicalPlan = serde_json::from_str(&plan_json)
            .map_err(|e| plan_error(format!("Failed to parse logical plan: {}. Response: {}", e, plan_json)))?;
        let sql = PlanCompiler::new(&ctx.schema).compile(&plan)?;

        Ok(scored_candidate(
            GenerationPath::LogicalPlan,
            sql,
            ExtractionQuality::Clean,
            &plan_json,
            plan_json.clone(),
            ctx,
        ))
    }
}

/// A column the plan misspelled slightly. Only an unambiguous, close overlap
/// counts; anything else is left for schema validation to report.
fn near_column(table: &Table, wanted: &str) -> Option<String> {
    let mut overlapping = table.columns.iter().filter(|c| {
        let name = c.name.to_lowercase();
        name.contains(wanted) || wanted.contains(&name)
    });
    let only = overlapping.next()?;
    if overlapping.next().is_some() {
        return None;
    }
    let similarity = strsim::jaro_winkler(wanted, &only.name.to_lowercase());
    if similarity >= NEAR_COLUMN_SIMILARITY {
        debug!(wanted, column = %only.name, similarity, "Resolved plan column by similarity");
        Some(only.name.clone())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::tests::{context, ScriptedModel};
    use crate::metadata::tests::loan_schema;

    fn compile(json: &str) -> Result<String> {
        let plan: LogicalPlan = serde_json::from_str(json).unwrap();
        PlanCompiler::new(&loan_schema()).compile(&plan)
    }

    #[test]
    fn test_single_table_count() {
        let sql = compile(
            r#"{"tables":["loans"],"aggregations":[{"function":"count","column":"*"}],
                "filters":[{"column":"status","operator":"=","value":"active"}]}"#,
        )
        .unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM loans WHERE status = 'active'");
    }

    #[test]
    fn test_join_inferred_from_relationship() {
        let sql = compile(
            r#"{"tables":["customers","loans"],"columns":[{"name":"city","table":"customers"}],
                "aggregations":[{"function":"count","column":"*","alias":"n"}],
                "order_by":[{"column":"n","direction":"desc"}],"limit":5}"#,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT customers.city, COUNT(*) AS n FROM customers \
             INNER JOIN loans ON loans.customer_id = customers.customer_id \
             GROUP BY customers.city ORDER BY n DESC LIMIT 5"
        );
    }

    #[test]
    fn test_string_values_are_escaped() {
        let sql = compile(
            r#"{"tables":["customers"],"columns":[{"name":"last_name"}],
                "filters":[{"column":"last_name","operator":"=","value":"O'Brien"},
                           {"column":"segment","operator":"IN","value":["retail","sme"]}]}"#,
        )
        .unwrap();
        assert!(sql.ends_with("WHERE last_name = 'O''Brien' AND segment IN ('retail', 'sme')"));
    }

    #[test]
    fn test_unknown_column_passes_through_for_validation() {
        let sql = compile(r#"{"tables":["loans"],"columns":[{"name":"borrower_xyz"}]}"#).unwrap();
        assert_eq!(sql, "SELECT borrower_xyz FROM loans");
    }

    #[test]
    fn test_vague_column_is_not_remapped() {
        let sql = compile(r#"{"tables":["loans"],"columns":[{"name":"amount"}]}"#).unwrap();
        assert_eq!(sql, "SELECT amount FROM loans");
        let sql = compile(r#"{"tables":["loans"],"columns":[{"name":"id"},{"name":"date"}]}"#).unwrap();
        assert_eq!(sql, "SELECT id, date FROM loans");
    }

    #[test]
    fn test_close_unambiguous_column_is_resolved() {
        let sql = compile(r#"{"tables":["loans"],"columns":[{"name":"interest_rates"}]}"#).unwrap();
        assert_eq!(sql, "SELECT interest_rate FROM loans");
    }

    #[test]
    fn test_invalid_plans_rejected() {
        assert!(compile(r#"{"tables":["nothing_here"]}"#).is_err());
        assert!(compile(r#"{"tables":["loans"],"aggregations":[{"function":"median","column":"interest_rate"}]}"#).is_err());
        assert!(compile(r#"{"tables":["loans"],"columns":[{"name":"status; DROP TABLE loans"}]}"#).is_err());
        assert!(compile(r#"{"tables":["loans"],"filters":[{"column":"status","operator":"=="}]}"#).is_err());
    }

    #[tokio::test]
    async fn test_plan_kept_as_reasoning() {
        let llm = Arc::new(ScriptedModel::new(&[
            "```json\n{\"tables\":[\"loans\"],\"aggregations\":[{\"function\":\"sum\",\"column\":\"outstanding_balance\"}],\"filters\":[{\"column\":\"status\",\"operator\":\"=\",\"value\":\"active\"}],\"confidence\":0.8}\n```",
        ]));
        let candidate = LogicalPlanPath::new(llm).generate("total active balance", &context()).await.unwrap();
        assert_eq!(
            candidate.sql,
            "SELECT SUM(outstanding_balance) FROM loans WHERE status = 'active'"
        );
        assert!(candidate.reasoning.starts_with("{\"tables\""));
        assert!((candidate.confidence - (0.4 + 0.35 + 0.25 * 0.8)).abs() < 1e-9);
    }
}
