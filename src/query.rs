//! Query - a trivial predicate/order-by string builder
//!
//! Generated SQL takes the form
//! `SELECT * FROM {table} WHERE {where} ORDER BY {column} ASC|DESC`.

/// The parts of a simple single-table SELECT
#[derive(Debug, Clone)]
pub struct Query {
    table: String,
    where_clause: Option<String>,
    order_by: Option<(String, bool)>,
}

impl Query {
    /// Query over every row of a table
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
            order_by: None,
        }
    }

    /// Set the SQL WHERE predicate (without the WHERE keyword)
    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    /// Order results by a column, ascending or descending
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order_by = Some((column.into(), ascending));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn where_clause(&self) -> Option<&str> {
        self.where_clause.as_deref()
    }

    pub fn order_column(&self) -> Option<(&str, bool)> {
        self.order_by.as_ref().map(|(c, asc)| (c.as_str(), *asc))
    }

    /// The generated SQL for this query's parts
    pub fn sql(&self) -> String {
        self.sql_selecting("*")
    }

    /// Same query with a caller-chosen select list (the data store uses
    /// this to fetch primary keys only)
    pub(crate) fn sql_selecting(&self, columns: &str) -> String {
        let mut sql = format!("SELECT {} FROM \"{}\"", columns, self.table);
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(where_clause);
        }
        if let Some((column, ascending)) = &self.order_by {
            sql.push_str(&format!(
                " ORDER BY \"{}\" {}",
                column,
                if *ascending { "ASC" } else { "DESC" }
            ));
        }
        sql
    }
}
