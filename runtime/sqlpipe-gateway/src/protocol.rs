//! Request parsing and response formatting for the line protocol.
//!
//! Requests are `<connId>,<command>[,<field>...]` or the literal `boot`.
//! Responses are plain comma-separated lines; the stream they are written
//! to (stdout or stderr) tells normal output from errors.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{GatewayError, Result};

pub const BOOT: &str = "boot";

/// Marker used in place of a connection id when none is known.
pub const WILDCARD: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Query,
    Begin,
    Commit,
    Rollback,
    Close,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "connect" => Some(Command::Connect),
            "query" => Some(Command::Query),
            "begin" => Some(Command::Begin),
            "commit" => Some(Command::Commit),
            "rollback" => Some(Command::Rollback),
            "close" => Some(Command::Close),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Query => "query",
            Command::Begin => "begin",
            Command::Commit => "commit",
            Command::Rollback => "rollback",
            Command::Close => "close",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Request {
    Boot,
    Command {
        conn: i32,
        command: Command,
        fields: Vec<String>,
    },
}

/// Fields of a `query` request after the command name.
#[derive(Debug, PartialEq, Eq)]
pub struct QueryFields {
    pub query_id: String,
    pub sql: String,
    pub args: Vec<String>,
}

pub fn parse_request(line: &str) -> Result<Request> {
    if line == BOOT {
        return Ok(Request::Boot);
    }
    let conn = parse_conn_id(line)?;
    // Empty trailing fields are kept: an empty argument means NULL.
    let mut parts = line.split(',').skip(1);
    let name = parts
        .next()
        .ok_or_else(|| GatewayError::parse("read cmd - wrong number of args").with_conn(conn))?;
    let command = Command::parse(name).ok_or_else(|| {
        GatewayError::parse(format!("read cmd - invalid command: {name}")).with_conn(conn)
    })?;
    Ok(Request::Command {
        conn,
        command,
        fields: parts.map(str::to_string).collect(),
    })
}

fn parse_conn_id(line: &str) -> Result<i32> {
    let head = line.split(',').next().unwrap_or("");
    if head.is_empty() {
        return Err(GatewayError::parse("input has no connection number"));
    }
    head.parse::<i32>()
        .map_err(|_| GatewayError::parse("input has invalid connection number"))
}

pub fn parse_query_fields(conn: i32, fields: &[String]) -> Result<QueryFields> {
    let query_id = match fields.first() {
        None => {
            return Err(GatewayError::parse("read query id - wrong number of args").with_conn(conn));
        }
        Some(id) if id.is_empty() => {
            return Err(GatewayError::parse("read query id - query id is empty").with_conn(conn));
        }
        Some(id) => id.clone(),
    };
    let fail = |message: &str| {
        GatewayError::parse(message)
            .with_conn(conn)
            .with_query(&query_id)
    };
    let Some(encoded) = fields.get(1) else {
        return Err(fail("read query - wrong number of args"));
    };
    let Some(encoded) = encoded.strip_prefix('s') else {
        return Err(fail("read query - missing 's' before base64"));
    };
    let sql = BASE64
        .decode(encoded)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|_| fail("read query - base64 decode failed"))?;
    if sql.is_empty() {
        return Err(fail("read query - query is empty"));
    }
    Ok(QueryFields {
        query_id,
        sql,
        args: fields[2..].to_vec(),
    })
}

pub fn ack(conn: i32, command: Command) -> String {
    format!("{conn},{command}")
}

pub fn header(
    conn: i32,
    query_id: &str,
    update_count: u64,
    row_count: u64,
    columns: &[String],
) -> String {
    let mut line = format!("{conn},{query_id},{update_count},{row_count}");
    for column in columns {
        line.push(',');
        line.push_str(column);
    }
    line
}

pub fn row(conn: i32, query_id: &str, values: &[String]) -> String {
    let mut line = format!("{conn},{query_id}");
    for value in values {
        line.push(',');
        line.push_str(value);
    }
    line
}

/// Renders an optional connection id, using the wildcard when absent.
pub fn conn_label(conn: Option<i32>) -> String {
    conn.map_or_else(|| WILDCARD.to_string(), |id| id.to_string())
}

/// Error messages may not break the line grammar.
pub fn sanitize(message: &str) -> String {
    message.replace(['\n', '\r', ','], " ")
}

pub fn error_line(conn: Option<i32>, query_id: Option<&str>, message: &str) -> String {
    let mut line = conn_label(conn);
    if let Some(query_id) = query_id {
        line.push(',');
        line.push_str(query_id);
    }
    line.push(',');
    line.push_str(&sanitize(message));
    line
}

pub fn diagnostic_line(info: &str) -> String {
    format!("i,{}", info.replace(['\n', '\r'], " "))
}

pub fn closed_line(conn: Option<i32>) -> String {
    format!("{},closed", conn_label(conn))
}

pub fn closed_notice(conn: Option<i32>) -> String {
    diagnostic_line(&format!("connection {} closed unexpectedly", conn_label(conn)))
}
