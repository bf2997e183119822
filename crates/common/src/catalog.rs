//! Scenario catalog
//!
//! Stores the step lists that job submission resolves a scenario id against.

use rusqlite::{params, OptionalExtension};

use crate::db::Database;
use crate::types::{now_millis, Scenario};
use crate::Result;

#[derive(Clone)]
pub struct ScenarioCatalog {
    db: Database,
}

impl ScenarioCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a scenario
    pub fn put(&self, scenario: &Scenario) -> Result<()> {
        scenario.validate()?;

        let conn = self.db.conn();
        let now = now_millis();
        conn.execute(
            "INSERT INTO scenarios (id, name, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, doc = excluded.doc, updated_at = excluded.updated_at",
            params![scenario.id, scenario.name, serde_json::to_string(scenario)?, now],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Scenario>> {
        let conn = self.db.conn();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM scenarios WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<Scenario>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT doc FROM scenarios ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut scenarios = Vec::new();
        for doc in rows {
            scenarios.push(serde_json::from_str(&doc?)?);
        }
        Ok(scenarios)
    }
}
