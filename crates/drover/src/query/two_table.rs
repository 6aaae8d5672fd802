//! Two-table paging: `id > last_key ORDER BY id LIMIT n`

use super::template::{SqlTemplate, TemplateError};
use super::{Mode, QueryBuilder};
use crate::traits::Params;

/// Default SELECT for two-table mode
pub const DEFAULT_TEMPLATE: &str =
    "SELECT * FROM {table} WHERE id > {last_key} ORDER BY id LIMIT {limit}";

/// Placeholders accepted in two-table templates
pub const PLACEHOLDERS: &[&str] = &["table", "limit", "last_key"];

/// Integer watermark cursor
#[derive(Debug, Clone)]
pub struct TwoTableQuery {
    template: SqlTemplate,
    table: String,
    limit: usize,
    last_key: u64,
}

impl TwoTableQuery {
    /// Builder using the default template
    pub fn new(table: impl Into<String>, limit: usize) -> Self {
        Self::with_template(SqlTemplate::builtin(DEFAULT_TEMPLATE), table, limit)
    }

    /// Builder using a custom template
    pub fn with_template(template: SqlTemplate, table: impl Into<String>, limit: usize) -> Self {
        Self {
            template,
            table: table.into(),
            limit,
            last_key: 0,
        }
    }

    /// Parse a custom template for this mode
    pub fn parse_template(text: &str) -> Result<SqlTemplate, TemplateError> {
        SqlTemplate::parse(text, PLACEHOLDERS, &["last_key"])
    }

    pub fn last_key(&self) -> u64 {
        self.last_key
    }

    /// Resume after `key`
    pub fn starting_after(mut self, key: u64) -> Self {
        self.last_key = key;
        self
    }
}

impl<P: Params> QueryBuilder<P> for TwoTableQuery {
    fn mode(&self) -> Mode {
        Mode::TwoTable
    }

    fn render(&self) -> String {
        self.template.render(&[
            ("table", self.table.clone()),
            ("limit", self.limit.to_string()),
            ("last_key", self.last_key.to_string()),
        ])
    }

    fn absorb(&mut self, batch: &[P]) {
        if let Some(max) = batch.iter().map(Params::key).max() {
            self.last_key = self.last_key.max(max);
        }
    }

    fn reset(&mut self) {
        self.last_key = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Row(u64);

    impl Params for Row {
        fn key(&self) -> u64 {
            self.0
        }
    }

    fn render(q: &TwoTableQuery) -> String {
        QueryBuilder::<Row>::render(q)
    }

    #[test]
    fn test_default_render() {
        let q = TwoTableQuery::new("db.src", 100);
        assert_eq!(
            render(&q),
            "SELECT * FROM db.src WHERE id > 0 ORDER BY id LIMIT 100"
        );
    }

    #[test]
    fn test_absorb_is_monotonic() {
        let mut q = TwoTableQuery::new("t", 10);
        q.absorb(&[Row(3), Row(9), Row(4)]);
        assert_eq!(q.last_key(), 9);

        // an older batch never moves the watermark back
        q.absorb(&[Row(2)]);
        assert_eq!(q.last_key(), 9);

        q.absorb(&[] as &[Row]);
        assert_eq!(q.last_key(), 9);
        assert!(render(&q).contains("id > 9"));
    }

    #[test]
    fn test_reset() {
        let mut q = TwoTableQuery::new("t", 10).starting_after(42);
        QueryBuilder::<Row>::reset(&mut q);
        assert_eq!(q.last_key(), 0);
    }

    #[test]
    fn test_default_template_is_valid() {
        assert!(TwoTableQuery::parse_template(DEFAULT_TEMPLATE).is_ok());
    }

    #[test]
    fn test_custom_template() {
        let tpl = TwoTableQuery::parse_template(
            "SELECT id, payload FROM {table} \
             WHERE id > {last_key} AND active ORDER BY id LIMIT {limit}",
        )
        .unwrap();
        let q = TwoTableQuery::with_template(tpl, "t", 5).starting_after(7);
        assert_eq!(
            render(&q),
            "SELECT id, payload FROM t WHERE id > 7 AND active ORDER BY id LIMIT 5"
        );

        assert!(TwoTableQuery::parse_template("SELECT * FROM {table}").is_err());
        assert!(TwoTableQuery::parse_template("SELECT {start_ts} WHERE id > {last_key}").is_err());
    }
}
