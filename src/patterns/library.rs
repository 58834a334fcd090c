//! Pattern Library
//!
//! Ordered, read-only set of question templates. Everything that can be
//! wrong with a pattern (bad regex, duplicate id, unbound placeholder,
//! example that its own predicate does not match) is rejected at load time.

use crate::error::{EngineError, Result};
use crate::llm::FewShotExample;
use lazy_static::lazy_static;
use regex::{Captures, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    static ref SAFE_VALUE: Regex = Regex::new(r"^(?:-?\d+(?:\.\d+)?|[A-Za-z0-9_ ]+)$").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Pattern as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    /// Regular expression evaluated against the normalized question
    pub predicate: String,
    /// SQL with `{name}` placeholders bound from named captures or defaults
    pub template: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_complexity")]
    pub complexity_weight: u32,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub examples: Vec<String>,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

fn default_complexity() -> u32 {
    1
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub id: String,
    pub predicate: Regex,
    pub template: String,
    pub keywords: Vec<String>,
    pub complexity_weight: u32,
    pub category: String,
    pub examples: Vec<String>,
    pub defaults: HashMap<String, String>,
    /// Position in the library; last-resort tie-break
    pub order: usize,
    placeholders: Vec<String>,
}

impl Pattern {
    fn compile(record: PatternRecord, order: usize) -> Result<Self> {
        if record.id.trim().is_empty() {
            return Err(EngineError::Configuration(format!("Pattern #{} has an empty id", order)));
        }
        if record.complexity_weight == 0 {
            return Err(EngineError::Configuration(format!(
                "Pattern '{}' must have a complexity weight of at least 1",
                record.id
            )));
        }
        let predicate = RegexBuilder::new(&record.predicate)
            .case_insensitive(true)
            .build()
            .map_err(|e| EngineError::Configuration(format!("Pattern '{}' has an invalid predicate: {}", record.id, e)))?;

        let captures: HashSet<&str> = predicate.capture_names().flatten().collect();
        let mut placeholders = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&record.template) {
            let name = cap[1].to_string();
            if !captures.contains(name.as_str()) && !record.defaults.contains_key(&name) {
                return Err(EngineError::Configuration(format!(
                    "Pattern '{}' template uses {{{}}} but the predicate has no such capture and no default is declared",
                    record.id, name
                )));
            }
            if !placeholders.contains(&name) {
                placeholders.push(name);
            }
        }

        let pattern = Self {
            id: record.id,
            predicate,
            template: record.template,
            keywords: record
                .keywords
                .iter()
                .map(|k| normalize_question(k))
                .filter(|k| !k.is_empty())
                .collect(),
            complexity_weight: record.complexity_weight,
            category: record.category,
            examples: record.examples,
            defaults: record.defaults,
            order,
            placeholders,
        };

        for example in &pattern.examples {
            let normalized = normalize_question(example);
            let bound = pattern
                .predicate
                .captures(&normalized)
                .and_then(|caps| pattern.bind(&caps).ok());
            if bound.is_none() {
                return Err(EngineError::Configuration(format!(
                    "Pattern '{}' does not match its own example '{}'",
                    pattern.id, example
                )));
            }
        }

        Ok(pattern)
    }

    /// Fill the template from captures, falling back to declared defaults.
    /// Bound values are restricted to a safe character set; quoting is the template's job.
    pub fn bind(&self, captures: &Captures<'_>) -> Result<String> {
        let mut values: HashMap<&str, String> = HashMap::new();
        for name in &self.placeholders {
            let value = captures
                .name(name)
                .map(|m| m.as_str().trim().to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| self.defaults.get(name).cloned())
                .ok_or_else(|| {
                    EngineError::Configuration(format!("Pattern '{}' has no value for {{{}}}", self.id, name))
                })?;
            if !SAFE_VALUE.is_match(&value) {
                return Err(EngineError::Configuration(format!(
                    "Pattern '{}' captured an unsafe value for {{{}}}: {}",
                    self.id, name, value
                )));
            }
            values.insert(name.as_str(), value);
        }

        let sql = PLACEHOLDER.replace_all(&self.template, |cap: &Captures<'_>| {
            values.get(&cap[1]).cloned().unwrap_or_default()
        });
        Ok(sql.into_owned())
    }

    /// Fraction of keywords found as whole words/phrases in the normalized question.
    pub fn keyword_overlap(&self, normalized: &str) -> f64 {
        if self.keywords.is_empty() {
            return 1.0;
        }
        let haystack = word_padded(normalized);
        let hits = self
            .keywords
            .iter()
            .filter(|k| haystack.contains(&word_padded(k)))
            .count();
        hits as f64 / self.keywords.len() as f64
    }

    fn keyword_hits(&self, normalized: &str) -> usize {
        let haystack = word_padded(normalized);
        self.keywords
            .iter()
            .filter(|k| haystack.contains(&word_padded(k)))
            .count()
    }
}

/// Lower-case and collapse whitespace.
pub fn normalize_question(text: &str) -> String {
    WHITESPACE.replace_all(text.trim(), " ").to_lowercase()
}

fn word_padded(text: &str) -> String {
    let words: String = text
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
        .collect();
    format!(" {} ", words.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[derive(Debug, Clone, Default)]
pub struct PatternLibrary {
    patterns: Vec<Pattern>,
    max_complexity_weight: u32,
}

impl PatternLibrary {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("Failed to read pattern library {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let records: Vec<PatternRecord> = serde_json::from_str(content)
            .map_err(|e| EngineError::Configuration(format!("Invalid pattern library: {}", e)))?;
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<PatternRecord>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut patterns = Vec::with_capacity(records.len());
        for (order, record) in records.into_iter().enumerate() {
            if !seen.insert(record.id.clone()) {
                return Err(EngineError::Configuration(format!("Duplicate pattern id '{}'", record.id)));
            }
            patterns.push(Pattern::compile(record, order)?);
        }
        let max_complexity_weight = patterns.iter().map(|p| p.complexity_weight).max().unwrap_or(1);
        Ok(Self {
            patterns,
            max_complexity_weight,
        })
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn get(&self, id: &str) -> Option<&Pattern> {
        self.patterns.iter().find(|p| p.id == id)
    }

    pub fn max_complexity_weight(&self) -> u32 {
        self.max_complexity_weight
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Example (question, SQL) pairs for prompting, most keyword overlap first.
    pub fn few_shot_examples(&self, question: &str, limit: usize) -> Vec<FewShotExample> {
        if limit == 0 {
            return Vec::new();
        }
        let normalized = normalize_question(question);
        let mut ranked: Vec<(usize, &Pattern)> = self
            .patterns
            .iter()
            .filter(|p| !p.examples.is_empty())
            .map(|p| (p.keyword_hits(&normalized), p))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.order.cmp(&b.1.order)));

        ranked
            .into_iter()
            .filter_map(|(_, pattern)| {
                let example = pattern.examples.first()?;
                let normalized_example = normalize_question(example);
                let caps = pattern.predicate.captures(&normalized_example)?;
                let sql = pattern.bind(&caps).ok()?;
                Some(FewShotExample {
                    question: example.clone(),
                    sql,
                })
            })
            .take(limit)
            .collect()
    }
}
