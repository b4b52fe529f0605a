//! Table declarations applied when the scheduler opens.

use provis_core::{Error, Result};

/// One `CREATE TABLE IF NOT EXISTS` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDecl {
    name: String,
    columns: Vec<String>,
    extra: Option<String>,
}

impl TableDecl {
    /// Declare a table. The name must be a plain identifier and at least one
    /// column is required.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidTable(format!("bad table name {name:?}")));
        }

        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if columns.is_empty() {
            return Err(Error::InvalidTable(format!("table {name} has no columns")));
        }
        if let Some(blank) = columns.iter().position(|c| c.trim().is_empty()) {
            return Err(Error::InvalidTable(format!(
                "table {name} column {blank} is empty"
            )));
        }

        Ok(Self {
            name,
            columns,
            extra: None,
        })
    }

    /// Append a clause after the column list (e.g. `WITHOUT ROWID`).
    pub fn with_extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = Some(extra.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The idempotent creation statement.
    pub fn create_statement(&self) -> String {
        let mut q = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            self.columns.join(",\n    ")
        );
        if let Some(extra) = &self.extra {
            q.push(' ');
            q.push_str(extra);
        }
        q
    }
}

fn decl(name: &str, columns: &[&str]) -> TableDecl {
    TableDecl {
        name: name.to_string(),
        columns: columns.iter().map(|c| c.to_string()).collect(),
        extra: None,
    }
}

/// Tables used by the gateway.
pub fn provis_tables() -> Vec<TableDecl> {
    vec![
        decl(
            "seq",
            &["name TEXT PRIMARY KEY", "next_id INTEGER NOT NULL DEFAULT 1"],
        ),
        decl(
            "chat_user",
            &[
                "id INTEGER PRIMARY KEY",
                "json TEXT NOT NULL",
                "allow INTEGER NOT NULL DEFAULT 0",
                "notified INTEGER NOT NULL DEFAULT 0",
            ],
        ),
        decl(
            "hostid",
            &[
                "hostid TEXT PRIMARY KEY",
                "hostname TEXT NOT NULL",
                "pubkey TEXT NOT NULL",
            ],
        ),
        decl(
            "etchosts",
            &[
                "ipaddr TEXT PRIMARY KEY",
                "hostname TEXT NOT NULL",
                "environ TEXT NOT NULL",
            ],
        ),
        decl(
            "keys",
            &[
                "uuid TEXT PRIMARY KEY",
                "alias TEXT NOT NULL",
                "ssh_key TEXT NOT NULL",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_statement_layout() {
        let t = TableDecl::new("seq", ["name TEXT PRIMARY KEY", "next_id INTEGER"]).unwrap();
        assert_eq!(
            t.create_statement(),
            "CREATE TABLE IF NOT EXISTS seq (\n    name TEXT PRIMARY KEY,\n    next_id INTEGER\n)"
        );
    }

    #[test]
    fn test_extra_clause_is_appended() {
        let t = TableDecl::new("kv", ["k TEXT PRIMARY KEY", "v TEXT"])
            .unwrap()
            .with_extra("WITHOUT ROWID");
        assert!(t.create_statement().ends_with(") WITHOUT ROWID"));
    }

    #[test]
    fn test_rejects_bad_declarations() {
        assert!(TableDecl::new("", ["a TEXT"]).is_err());
        assert!(TableDecl::new("bad name", ["a TEXT"]).is_err());
        assert!(TableDecl::new("t", Vec::<String>::new()).is_err());
        assert!(TableDecl::new("t", ["a TEXT", "  "]).is_err());
    }

    #[test]
    fn test_provis_tables_are_valid() {
        for table in provis_tables() {
            let rebuilt = TableDecl::new(table.name.clone(), table.columns.clone()).unwrap();
            assert_eq!(rebuilt, table);
        }
    }
}
