//! Test data fixtures for the mock server.
//!
//! Provides factory functions for creating realistic test data.

use serde_json::{Map, Value};

use crate::models::{Author, Category, Content, Entry};

/// Collection of fixture factories for test data.
pub struct Fixtures;

impl Fixtures {
    // =========================================================================
    // Entry Fixtures
    // =========================================================================

    /// Create an entry with a title only.
    pub fn minimal_entry(title: &str) -> Entry {
        Entry::new(title)
    }

    /// Create a document-like entry with summary, author and category.
    pub fn document_entry(title: &str, summary: &str, author: &str) -> Entry {
        let mut entry = Entry::new(title);
        entry.summary = Some(summary.to_string());
        entry.content = Some(Content::Text(format!("{title} body")));
        entry.add_author(Author::new(author));
        entry.add_category(Category::kind("http://schemas.google.com/docs/2007#document"));
        entry
    }

    // =========================================================================
    // Task Fixtures
    // =========================================================================

    /// Create a task object for the JSON collection.
    pub fn task(title: &str) -> Map<String, Value> {
        let mut task = Map::new();
        task.insert("title".into(), Value::from(title));
        task.insert("status".into(), Value::from("needsAction"));
        task
    }

    /// Create `count` numbered tasks.
    pub fn tasks(count: usize) -> Vec<Map<String, Value>> {
        (1..=count).map(|i| Self::task(&format!("Task {i}"))).collect()
    }

    // =========================================================================
    // Scenario Builders
    // =========================================================================

    /// Create a default set of test data for common scenarios.
    pub fn default_scenario() -> DefaultScenario {
        DefaultScenario::new()
    }
}

/// A complete test scenario.
pub struct DefaultScenario {
    pub entries: Vec<Entry>,
    pub tasks: Vec<Map<String, Value>>,
}

impl DefaultScenario {
    fn new() -> Self {
        let entries = vec![
            Fixtures::document_entry("Quarterly Report", "Numbers for Q3", "Alice"),
            Fixtures::document_entry("Meeting Notes", "Weekly sync", "Bob"),
            Fixtures::minimal_entry("Shopping List"),
        ];

        Self {
            entries,
            tasks: Fixtures::tasks(250),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_entry() {
        let entry = Fixtures::minimal_entry("Test");
        assert_eq!(entry.title.as_deref(), Some("Test"));
        assert!(!entry.is_inserted());
    }

    #[test]
    fn test_document_entry() {
        let entry = Fixtures::document_entry("Doc", "Summary", "Alice");
        assert_eq!(entry.kind(), Some("http://schemas.google.com/docs/2007#document"));
        assert_eq!(entry.authors[0].name, "Alice");
    }

    #[test]
    fn test_tasks_are_numbered() {
        let tasks = Fixtures::tasks(3);
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[2]["title"], Value::from("Task 3"));
    }

    #[test]
    fn test_default_scenario() {
        let scenario = Fixtures::default_scenario();
        assert_eq!(scenario.entries.len(), 3);
        assert_eq!(scenario.tasks.len(), 250);
    }
}
