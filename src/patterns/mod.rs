//! Pattern-based translation: library loading and matching.

pub mod library;
pub mod matcher;

pub use library::{normalize_question, Pattern, PatternLibrary, PatternRecord};
pub use matcher::{PatternMatcher, PatternScore};
