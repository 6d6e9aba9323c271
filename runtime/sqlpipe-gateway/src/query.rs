//! Query execution: placeholder check, typed binding, execution, encoding.

use std::sync::Arc;
use std::time::Duration;

use tokio_postgres::Statement;
use tokio_postgres::types::ToSql;

use crate::codec::{self, BindValue, RawCell};
use crate::error::{GatewayError, Result, driver_error};
use crate::output::OutputSink;
use crate::protocol;
use crate::worker::Handle;

/// A validated `query` request waiting for a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingQuery {
    pub conn: i32,
    pub query_id: String,
    pub sql: String,
    pub args: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementClass {
    /// Row-returning statement (anything not update-class).
    Query,
    /// Update-class statement executed for its affected-row count.
    Update,
    /// Update-class statement with a RETURNING clause.
    Returning,
}

const UPDATE_KEYWORDS: [&str; 7] = ["CREATE", "ALTER", "DROP", "INSERT", "UPDATE", "DELETE", "LOCK"];

pub fn classify(sql: &str) -> StatementClass {
    let upper = sql.trim().to_uppercase();
    if !UPDATE_KEYWORDS.iter().any(|kw| upper.starts_with(kw)) {
        return StatementClass::Query;
    }
    if upper.contains("RETURNING") {
        StatementClass::Returning
    } else {
        StatementClass::Update
    }
}

/// Checks `$1..$N` markers against `arg_count` and returns the native SQL.
///
/// Postgres takes `$n` markers natively, so the text is returned unchanged;
/// every marker from 1 to N must appear, and no other `$` may appear.
pub fn rewrite_placeholders(sql: &str, arg_count: usize) -> Result<String> {
    let mismatch =
        || GatewayError::bind(format!("query args do not match template string: {sql}"));
    let mut seen = vec![false; arg_count];
    let bytes = sql.as_bytes();
    let mut at = 0;
    while let Some(offset) = sql[at..].find('$') {
        let start = at + offset + 1;
        let end = start
            + bytes[start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
        let marker: usize = sql[start..end].parse().map_err(|_| mismatch())?;
        match marker.checked_sub(1).and_then(|slot| seen.get_mut(slot)) {
            Some(slot) => *slot = true,
            None => return Err(mismatch()),
        }
        at = end;
    }
    if seen.iter().all(|used| *used) {
        Ok(sql.to_string())
    } else {
        Err(mismatch())
    }
}

/// Builds `name:type` descriptors, renaming computed or type-named columns
/// to a running ordinal.
pub fn column_descriptors<'a, I>(columns: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut renamed = 0;
    let mut descriptors = Vec::new();
    for (name, type_name) in columns {
        if !codec::is_supported_type(type_name) {
            return Err(GatewayError::bind(format!(
                "read row - unsupported col type {name} = {type_name}"
            )));
        }
        let name = if codec::is_supported_type(name) || name.starts_with('?') {
            renamed += 1;
            renamed.to_string()
        } else {
            name.to_string()
        };
        descriptors.push(format!("{name}:{type_name}"));
    }
    Ok(descriptors)
}

/// Everything a finished statement sends back.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryResult {
    pub update_count: u64,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl QueryResult {
    pub fn emit(&self, out: &OutputSink, conn: i32, query_id: &str) {
        out.normal(protocol::header(
            conn,
            query_id,
            self.update_count,
            self.rows.len() as u64,
            &self.columns,
        ));
        for row in &self.rows {
            out.normal(protocol::row(conn, query_id, row));
        }
    }
}

pub struct QueryEngine {
    out: OutputSink,
    statement_timeout: Option<Duration>,
}

impl QueryEngine {
    pub fn new(out: OutputSink, statement_timeout: Option<Duration>) -> Self {
        Self {
            out,
            statement_timeout,
        }
    }

    /// Runs one query on a borrowed handle and emits its result lines.
    pub async fn execute(&self, query: PendingQuery, handle: Arc<Handle>) -> Result<()> {
        let outcome = match self.statement_timeout {
            None => run(&handle, &query).await,
            Some(limit) => match tokio::time::timeout(limit, run(&handle, &query)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    if let Err(err) = handle.cancel_query().await {
                        tracing::debug!(conn = query.conn, error = %err, "cancel after timeout failed");
                    }
                    Err(GatewayError::query_timeout())
                }
            },
        };
        let result = outcome.map_err(|err| err.with_conn(query.conn).with_query(&query.query_id))?;
        result.emit(&self.out, query.conn, &query.query_id);
        Ok(())
    }
}

async fn run(handle: &Handle, query: &PendingQuery) -> Result<QueryResult> {
    let client = handle.client();
    let statement = client
        .prepare(&query.sql)
        .await
        .map_err(|err| driver_error(&err))?;
    let values = bind_values(&statement, &query.args)?;
    let params: Vec<&(dyn ToSql + Sync)> = values
        .iter()
        .map(|value| value as &(dyn ToSql + Sync))
        .collect();

    let class = classify(&query.sql);
    if class == StatementClass::Update {
        let affected = client
            .execute(&statement, &params)
            .await
            .map_err(|err| driver_error(&err))?;
        return Ok(QueryResult {
            update_count: affected,
            columns: Vec::new(),
            rows: Vec::new(),
        });
    }

    let columns = column_descriptors(
        statement
            .columns()
            .iter()
            .map(|column| (column.name(), column.type_().name())),
    )?;
    let types: Vec<&str> = statement
        .columns()
        .iter()
        .map(|column| column.type_().name())
        .collect();
    let fetched = client
        .query(&statement, &params)
        .await
        .map_err(|err| driver_error(&err))?;
    let mut rows = Vec::with_capacity(fetched.len());
    for row in &fetched {
        let mut cells = Vec::with_capacity(types.len());
        for (idx, type_name) in types.iter().enumerate() {
            let cell: RawCell<'_> = row.try_get(idx).map_err(|err| driver_error(&err))?;
            let token = codec::encode_cell(type_name, cell.0).map_err(|err| {
                GatewayError::bind(format!("read row - failed to read col {}: {err}", idx + 1))
            })?;
            cells.push(token);
        }
        rows.push(cells);
    }
    let update_count = if class == StatementClass::Returning {
        rows.len() as u64
    } else {
        0
    };
    Ok(QueryResult {
        update_count,
        columns,
        rows,
    })
}

fn bind_values(statement: &Statement, args: &[String]) -> Result<Vec<BindValue>> {
    statement
        .params()
        .iter()
        .enumerate()
        .map(|(idx, ty)| {
            let raw = args.get(idx).map(String::as_str).unwrap_or("");
            codec::decode_arg(ty.name(), idx + 1, raw)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output;

    #[test]
    fn classifies_by_leading_keyword() {
        assert_eq!(classify("SELECT 1"), StatementClass::Query);
        assert_eq!(classify("  insert into t values (1)"), StatementClass::Update);
        assert_eq!(classify("lock table t"), StatementClass::Update);
        assert_eq!(
            classify("UPDATE t SET a = 1 returning id"),
            StatementClass::Returning
        );
        assert_eq!(
            classify("WITH x AS (DELETE FROM t RETURNING *) SELECT * FROM x"),
            StatementClass::Query
        );
    }

    #[test]
    fn placeholders_must_cover_every_argument() {
        assert_eq!(
            rewrite_placeholders("SELECT $1, $2, $1", 2).expect("ok"),
            "SELECT $1, $2, $1"
        );
        assert!(rewrite_placeholders("SELECT 1", 0).is_ok());
        let err = rewrite_placeholders("SELECT $1", 2).expect_err("missing $2");
        assert_eq!(err.message, "query args do not match template string: SELECT $1");
        assert!(rewrite_placeholders("SELECT $1, $2", 1).is_err());
        assert!(rewrite_placeholders("SELECT '$'", 0).is_err());
        assert!(rewrite_placeholders("SELECT $0", 1).is_err());
    }

    #[test]
    fn marker_numbers_are_matched_whole() {
        let sql: String = (1..=10).map(|n| format!("${n} ")).collect();
        assert!(rewrite_placeholders(&sql, 10).is_ok());
        assert!(rewrite_placeholders("SELECT $10", 1).is_err());
        let sql: String = (2..=10).map(|n| format!("${n} ")).collect();
        assert!(rewrite_placeholders(&sql, 10).is_err());
    }

    #[test]
    fn computed_and_type_named_columns_get_ordinals() {
        let descriptors = column_descriptors([
            ("id", "int8"),
            ("?column?", "int4"),
            ("text", "text"),
            ("created", "timestamptz"),
        ])
        .expect("columns");
        assert_eq!(descriptors, vec!["id:int8", "1:int4", "2:text", "created:timestamptz"]);
    }

    #[test]
    fn unsupported_column_types_are_rejected() {
        let err = column_descriptors([("id", "uuid")]).expect_err("uuid");
        assert_eq!(err.message, "read row - unsupported col type id = uuid");
    }

    #[test]
    fn results_emit_a_header_before_their_rows() {
        let (sink, rx) = output::channel();
        let result = QueryResult {
            update_count: 2,
            columns: vec!["id:int4".to_string(), "name:text".to_string()],
            rows: vec![
                vec!["1".to_string(), codec::encode_text("a")],
                vec!["2".to_string(), String::new()],
            ],
        };
        result.emit(&sink, 5, "q3");
        let lines: Vec<String> = rx.try_iter().map(|line| line.payload).collect();
        assert_eq!(
            lines,
            vec![
                "5,q3,2,2,id:int4,name:text".to_string(),
                "5,q3,1,sYQ==".to_string(),
                "5,q3,2,".to_string(),
            ]
        );
    }

    #[test]
    fn pure_updates_emit_only_a_header() {
        let (sink, rx) = output::channel();
        let result = QueryResult {
            update_count: 3,
            columns: Vec::new(),
            rows: Vec::new(),
        };
        result.emit(&sink, 1, "u1");
        let lines: Vec<String> = rx.try_iter().map(|line| line.payload).collect();
        assert_eq!(lines, vec!["1,u1,3,0".to_string()]);
    }
}
