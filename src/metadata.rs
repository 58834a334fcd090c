//! Schema metadata
//!
//! Tables, columns and relationships that ground generation and validation.
//! Resolutions work on an `Arc` snapshot so a refresh never shows up halfway
//! through a question.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub cardinality: Option<u64>,
    #[serde(default)]
    pub sample_values: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Estimated row count
    #[serde(default)]
    pub row_count: Option<u64>,
    pub columns: Vec<Column>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub cardinality: Cardinality,
    #[serde(default = "default_relationship_confidence")]
    pub confidence: f64,
}

fn default_relationship_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMetadata {
    pub name: String,
    pub tables: Vec<Table>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

impl SchemaMetadata {
    /// Load a schema from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("Failed to read schema {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let schema: SchemaMetadata = serde_json::from_str(content)
            .map_err(|e| EngineError::Configuration(format!("Invalid schema metadata: {}", e)))?;
        schema.check()?;
        Ok(schema)
    }

    fn check(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(EngineError::Configuration(format!("Schema '{}' has no tables", self.name)));
        }
        for rel in &self.relationships {
            let source_ok = self.table(&rel.source_table).map(|t| t.has_column(&rel.source_column)).unwrap_or(false);
            let target_ok = self.table(&rel.target_table).map(|t| t.has_column(&rel.target_column)).unwrap_or(false);
            if !source_ok || !target_ok {
                return Err(EngineError::Configuration(format!(
                    "Relationship {}.{} -> {}.{} references unknown columns",
                    rel.source_table, rel.source_column, rel.target_table, rel.target_column
                )));
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    /// Tables that declare a column with this name.
    pub fn tables_with_column(&self, column: &str) -> Vec<&Table> {
        self.tables.iter().filter(|t| t.has_column(column)).collect()
    }

    pub fn relationship_between(&self, a: &str, b: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| {
            (r.source_table.eq_ignore_ascii_case(a) && r.target_table.eq_ignore_ascii_case(b))
                || (r.source_table.eq_ignore_ascii_case(b) && r.target_table.eq_ignore_ascii_case(a))
        })
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Compact prompt context: tables, typed columns, a few sample values, relationships.
    pub fn render_context(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!("TABLE {}", table.name));
            if let Some(ref desc) = table.description {
                out.push_str(&format!(" -- {}", desc));
            }
            out.push('\n');
            for col in &table.columns {
                out.push_str(&format!(
                    "  {} {}{}",
                    col.name,
                    col.data_type,
                    if col.nullable { "" } else { " NOT NULL" }
                ));
                if !col.sample_values.is_empty() {
                    let samples: Vec<&str> = col.sample_values.iter().take(3).map(|s| s.as_str()).collect();
                    out.push_str(&format!(" e.g. {}", samples.join(", ")));
                }
                out.push('\n');
            }
        }
        if !self.relationships.is_empty() {
            out.push_str("RELATIONSHIPS\n");
            for rel in &self.relationships {
                out.push_str(&format!(
                    "  {}.{} -> {}.{} ({:?})\n",
                    rel.source_table, rel.source_column, rel.target_table, rel.target_column, rel.cardinality
                ));
            }
        }
        out
    }
}

/// Schema metadata collaborator.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn fetch(&self, schema_name: &str) -> Result<SchemaMetadata>;
}

/// Reads `<dir>/<schema_name>.json`.
pub struct JsonSchemaSource {
    dir: PathBuf,
}

impl JsonSchemaSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SchemaSource for JsonSchemaSource {
    async fn fetch(&self, schema_name: &str) -> Result<SchemaMetadata> {
        let path = self.dir.join(format!("{}.json", schema_name));
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| EngineError::Configuration(format!("Failed to read schema {}: {}", path.display(), e)))?;
        SchemaMetadata::from_json(&content)
    }
}

/// Serves a fixed schema. Used when metadata is loaded once at startup.
pub struct StaticSchemaSource {
    schema: SchemaMetadata,
}

impl StaticSchemaSource {
    pub fn new(schema: SchemaMetadata) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl SchemaSource for StaticSchemaSource {
    async fn fetch(&self, _schema_name: &str) -> Result<SchemaMetadata> {
        Ok(self.schema.clone())
    }
}

/// Caches the last fetched schema and hands out immutable snapshots.
pub struct CachedSchemaProvider {
    source: Arc<dyn SchemaSource>,
    schema_name: String,
    current: RwLock<Option<Arc<SchemaMetadata>>>,
}

impl CachedSchemaProvider {
    pub fn new(source: Arc<dyn SchemaSource>, schema_name: impl Into<String>) -> Self {
        Self {
            source,
            schema_name: schema_name.into(),
            current: RwLock::new(None),
        }
    }

    pub fn from_schema(schema: SchemaMetadata) -> Self {
        let name = schema.name.clone();
        let provider = Self::new(Arc::new(StaticSchemaSource::new(schema.clone())), name);
        if let Ok(mut slot) = provider.current.write() {
            *slot = Some(Arc::new(schema));
        }
        provider
    }

    /// Current snapshot, fetching on first use.
    pub async fn snapshot(&self) -> Result<Arc<SchemaMetadata>> {
        {
            let guard = self
                .current
                .read()
                .map_err(|_| EngineError::Storage("schema cache lock poisoned".to_string()))?;
            if let Some(ref schema) = *guard {
                return Ok(Arc::clone(schema));
            }
        }
        self.refresh().await
    }

    /// Force a fetch. Snapshots already handed out are unaffected.
    pub async fn refresh(&self) -> Result<Arc<SchemaMetadata>> {
        let schema = Arc::new(self.source.fetch(&self.schema_name).await?);
        info!("Loaded schema '{}' ({} tables)", schema.name, schema.tables.len());
        let mut guard = self
            .current
            .write()
            .map_err(|_| EngineError::Storage("schema cache lock poisoned".to_string()))?;
        *guard = Some(Arc::clone(&schema));
        Ok(schema)
    }
}
