//! SQL analysis helpers
//!
//! Walks a parsed statement once and records what the validators need:
//! base tables with aliases, column references, aggregate functions, CTE and
//! derived-table names, and a summary of each top-level SELECT.

use sqlparser::ast::{
    visit_expressions, Expr, GroupByExpr, JoinConstraint, JoinOperator, ObjectName, Query, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins, Visit, Visitor,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::{Parser, ParserError};
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;

const AGGREGATE_FUNCTIONS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "MEDIAN", "MODE", "STDDEV", "STDDEV_POP", "STDDEV_SAMP", "VARIANCE",
    "VAR_POP", "VAR_SAMP", "ARRAY_AGG", "STRING_AGG", "GROUP_CONCAT", "BOOL_AND", "BOOL_OR", "COUNT_IF",
    "ANY_VALUE", "PERCENTILE_CONT", "PERCENTILE_DISC",
];

pub fn parse_statements(sql: &str) -> Result<Vec<Statement>, ParserError> {
    Parser::parse_sql(&GenericDialect {}, sql)
}

/// The statement if `sql` parses to exactly one query.
pub fn parse_query(sql: &str) -> Option<Statement> {
    let mut statements = parse_statements(sql).ok()?;
    if statements.len() != 1 {
        return None;
    }
    let statement = statements.pop()?;
    matches!(statement, Statement::Query(_)).then_some(statement)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.qualifier {
            Some(ref q) => write!(f, "{}.{}", q, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRef {
    /// Base tables earlier in the same FROM item
    pub left: Vec<String>,
    pub right: String,
    /// False for CROSS JOIN, a join without ON/USING, or a comma join with no WHERE
    pub constrained: bool,
}

/// One SELECT at the top level of the statement (set operations contribute one each).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectSummary {
    pub tables: Vec<String>,
    pub has_where: bool,
    pub has_group_by: bool,
    pub has_aggregate: bool,
    /// `None` for `*`, `Some(qualifier)` for `q.*`
    pub wildcards: Vec<Option<String>>,
}

/// How a column qualifier resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Qualifier {
    Table(String),
    /// CTE or derived table; its columns are not in the schema
    Opaque,
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct QueryAnalysis {
    pub tables: Vec<TableRef>,
    pub columns: BTreeSet<ColumnRef>,
    pub aggregates: BTreeSet<String>,
    pub functions: BTreeSet<String>,
    pub cte_names: HashSet<String>,
    pub derived_aliases: HashSet<String>,
    /// Projection aliases and CTE/derived column names usable as bare identifiers
    pub output_names: HashSet<String>,
    pub selects: Vec<SelectSummary>,
    pub joins: Vec<JoinRef>,
    pub has_limit: bool,
}

impl QueryAnalysis {
    pub fn of(statement: &Statement) -> Self {
        let mut analysis = QueryAnalysis::default();
        if let Statement::Query(query) = statement {
            collect_query_scope(query, &mut analysis);
            analysis.has_limit = query.limit.is_some() || query.fetch.is_some();
            summarize_body(&query.body, &mut analysis);
        }
        let mut collector = Collector { analysis: &mut analysis };
        let _ = statement.visit(&mut collector);
        analysis
    }

    /// Distinct base table names, lower-cased.
    pub fn table_names(&self) -> BTreeSet<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn resolve_qualifier(&self, qualifier: &str) -> Qualifier {
        if let Some(t) = self.tables.iter().find(|t| t.alias.as_deref() == Some(qualifier)) {
            return Qualifier::Table(t.name.clone());
        }
        if self.derived_aliases.contains(qualifier) || self.cte_names.contains(qualifier) {
            return Qualifier::Opaque;
        }
        if let Some(t) = self.tables.iter().find(|t| t.name == qualifier) {
            return Qualifier::Table(t.name.clone());
        }
        Qualifier::Unknown
    }

    /// True when some FROM source is a CTE or derived table.
    pub fn has_opaque_sources(&self) -> bool {
        !self.derived_aliases.is_empty() || !self.cte_names.is_empty()
    }
}

struct Collector<'a> {
    analysis: &'a mut QueryAnalysis,
}

impl Visitor for Collector<'_> {
    type Break = ();

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<()> {
        let a = &mut *self.analysis;
        match table_factor {
            TableFactor::Table { name, alias, .. } => {
                let table = object_leaf(name);
                let alias = alias.as_ref().map(|a| a.name.value.to_lowercase());
                if a.cte_names.contains(&table) {
                    if let Some(alias) = alias {
                        a.derived_aliases.insert(alias);
                    }
                } else {
                    let table_ref = TableRef { name: table, alias };
                    if !a.tables.contains(&table_ref) {
                        a.tables.push(table_ref);
                    }
                }
            }
            TableFactor::Derived { subquery, alias, .. } => {
                if let Some(alias) = alias {
                    a.derived_aliases.insert(alias.name.value.to_lowercase());
                    a.output_names.extend(alias.columns.iter().map(|c| c.value.to_lowercase()));
                }
                collect_query_scope(subquery, a);
            }
            TableFactor::TableFunction { alias, .. }
            | TableFactor::Function { alias, .. }
            | TableFactor::UNNEST { alias, .. }
            | TableFactor::NestedJoin { alias, .. }
            | TableFactor::Pivot { alias, .. }
            | TableFactor::Unpivot { alias, .. } => {
                if let Some(alias) = alias {
                    a.derived_aliases.insert(alias.name.value.to_lowercase());
                }
            }
            #[allow(unreachable_patterns)]
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        let a = &mut *self.analysis;
        match expr {
            Expr::Identifier(ident) => {
                a.columns.insert(ColumnRef {
                    qualifier: None,
                    name: ident.value.to_lowercase(),
                });
            }
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let n = parts.len();
                a.columns.insert(ColumnRef {
                    qualifier: Some(parts[n - 2].value.to_lowercase()),
                    name: parts[n - 1].value.to_lowercase(),
                });
            }
            Expr::Function(function) => {
                let name = object_leaf(&function.name).to_uppercase();
                if AGGREGATE_FUNCTIONS.contains(&name.as_str()) {
                    a.aggregates.insert(name.clone());
                }
                a.functions.insert(name);
            }
            Expr::Subquery(query) | Expr::InSubquery { subquery: query, .. } | Expr::Exists { subquery: query, .. } => {
                collect_query_scope(query, a);
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

/// Last identifier of a possibly schema-qualified name, lower-cased.
pub fn object_leaf(name: &ObjectName) -> String {
    name.0.last().map(|i| i.value.to_lowercase()).unwrap_or_default()
}

/// Register the query's CTE names and the names its outputs expose.
fn collect_query_scope(query: &Query, analysis: &mut QueryAnalysis) {
    if let Some(ref with) = query.with {
        for cte in &with.cte_tables {
            analysis.cte_names.insert(cte.alias.name.value.to_lowercase());
            analysis
                .output_names
                .extend(cte.alias.columns.iter().map(|c| c.value.to_lowercase()));
            collect_output_aliases(&cte.query.body, analysis);
        }
    }
    collect_output_aliases(&query.body, analysis);
}

fn collect_output_aliases(body: &SetExpr, analysis: &mut QueryAnalysis) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                if let SelectItem::ExprWithAlias { alias, .. } = item {
                    analysis.output_names.insert(alias.value.to_lowercase());
                }
            }
        }
        SetExpr::Query(query) => collect_output_aliases(&query.body, analysis),
        SetExpr::SetOperation { left, right, .. } => {
            collect_output_aliases(left, analysis);
            collect_output_aliases(right, analysis);
        }
        _ => {}
    }
}

fn summarize_body(body: &SetExpr, analysis: &mut QueryAnalysis) {
    match body {
        SetExpr::Select(select) => {
            let mut summary = SelectSummary {
                has_where: select.selection.is_some(),
                has_group_by: match select.group_by {
                    GroupByExpr::All => true,
                    GroupByExpr::Expressions(ref exprs) => !exprs.is_empty(),
                },
                ..Default::default()
            };

            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                        if contains_aggregate(expr) {
                            summary.has_aggregate = true;
                        }
                    }
                    SelectItem::QualifiedWildcard(name, _) => summary.wildcards.push(Some(object_leaf(name))),
                    SelectItem::Wildcard(_) => summary.wildcards.push(None),
                }
            }

            let comma_join = select.from.len() > 1;
            let mut earlier_items: Vec<String> = Vec::new();
            for item in &select.from {
                let item_tables = summarize_from_item(item, analysis, &mut summary);
                if comma_join {
                    if let Some(first) = item_tables.first() {
                        if !earlier_items.is_empty() {
                            analysis.joins.push(JoinRef {
                                left: earlier_items.clone(),
                                right: first.clone(),
                                constrained: summary.has_where,
                            });
                        }
                    }
                }
                earlier_items.extend(item_tables);
            }
            analysis.selects.push(summary);
        }
        SetExpr::Query(query) => summarize_body(&query.body, analysis),
        SetExpr::SetOperation { left, right, .. } => {
            summarize_body(left, analysis);
            summarize_body(right, analysis);
        }
        _ => {}
    }
}

/// Base tables of one FROM item; records its joins.
fn summarize_from_item(item: &TableWithJoins, analysis: &mut QueryAnalysis, summary: &mut SelectSummary) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    if let Some(name) = base_table(&item.relation, analysis) {
        seen.push(name);
    }
    for join in &item.joins {
        let Some(right) = base_table(&join.relation, analysis) else {
            continue;
        };
        let constrained = match &join.join_operator {
            JoinOperator::Inner(c)
            | JoinOperator::LeftOuter(c)
            | JoinOperator::RightOuter(c)
            | JoinOperator::FullOuter(c)
            | JoinOperator::LeftSemi(c)
            | JoinOperator::RightSemi(c)
            | JoinOperator::LeftAnti(c)
            | JoinOperator::RightAnti(c) => !matches!(c, JoinConstraint::None),
            _ => false,
        };
        analysis.joins.push(JoinRef {
            left: seen.clone(),
            right: right.clone(),
            constrained,
        });
        seen.push(right);
    }
    for table in &seen {
        if !summary.tables.contains(table) {
            summary.tables.push(table.clone());
        }
    }
    seen
}

fn base_table(factor: &TableFactor, analysis: &QueryAnalysis) -> Option<String> {
    match factor {
        TableFactor::Table { name, .. } => {
            let table = object_leaf(name);
            (!analysis.cte_names.contains(&table)).then_some(table)
        }
        _ => None,
    }
}

fn contains_aggregate(expr: &Expr) -> bool {
    let found = visit_expressions(expr, |e| match e {
        Expr::Function(f) if AGGREGATE_FUNCTIONS.contains(&object_leaf(&f.name).to_uppercase().as_str()) => {
            ControlFlow::Break(())
        }
        _ => ControlFlow::Continue(()),
    });
    found.is_break()
}

/// |a ∩ b| / |a ∪ b|; two empty sets agree completely.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
