use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use crossbeam_channel::{Receiver, unbounded};

const UNREACHABLE_DB: &str = "postgres://sqlpipe@127.0.0.1:1/sqlpipe";
const WAIT: Duration = Duration::from_secs(15);

struct Gateway {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Receiver<String>,
    stderr: Receiver<String>,
}

fn pump<R: std::io::Read + Send + 'static>(source: R) -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread::spawn(move || {
        for line in BufReader::new(source).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

impl Gateway {
    fn start(database_url: &str, extra: &[(&str, &str)]) -> Self {
        let mut command = Command::new(env!("CARGO_BIN_EXE_sqlpipe"));
        command
            .env_clear()
            .env("threads", "2")
            .env("database_url", database_url)
            .env("connection_timeout_millis", "2000")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in extra {
            command.env(key, value);
        }
        let mut child = command.spawn().expect("spawn sqlpipe");
        let stdin = child.stdin.take();
        let stdout = pump(child.stdout.take().expect("stdout"));
        let stderr = pump(child.stderr.take().expect("stderr"));
        Self {
            child,
            stdin,
            stdout,
            stderr,
        }
    }

    fn send(&mut self, line: &str) {
        let stdin = self.stdin.as_mut().expect("stdin open");
        writeln!(stdin, "{line}").expect("write request");
        stdin.flush().expect("flush request");
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        let stdin = self.stdin.as_mut().expect("stdin open");
        stdin.write_all(bytes).expect("write request");
        stdin.flush().expect("flush request");
    }

    fn out(&self) -> String {
        self.stdout.recv_timeout(WAIT).expect("stdout line")
    }

    fn err(&self) -> String {
        self.stderr.recv_timeout(WAIT).expect("stderr line")
    }

    /// Next stderr line that is not a diagnostic.
    fn error(&self) -> String {
        loop {
            let line = self.err();
            if !line.starts_with("i,") {
                return line;
            }
        }
    }

    fn finish(mut self) -> bool {
        drop(self.stdin.take());
        self.child.wait().expect("wait").success()
    }
}

fn sql(text: &str) -> String {
    format!("s{}", BASE64.encode(text))
}

fn database_url() -> Option<String> {
    let url = std::env::var("SQLPIPE_TEST_DATABASE_URL").ok();
    if url.is_none() {
        eprintln!("SQLPIPE_TEST_DATABASE_URL not set, skipping");
    }
    url
}

#[test]
fn boot_handshake() {
    let mut gateway = Gateway::start(UNREACHABLE_DB, &[]);
    gateway.send("boot");
    assert_eq!(gateway.out(), "boot");
    assert!(gateway.finish());
}

#[test]
fn precondition_errors_go_to_stderr() {
    let mut gateway = Gateway::start(UNREACHABLE_DB, &[]);
    gateway.send(&format!("1,query,q1,{}", sql("SELECT 1")));
    assert_eq!(gateway.err(), "1,query before connect");
    let trace = gateway.err();
    assert!(trace.starts_with("i,"), "{trace}");

    gateway.send("abc,connect");
    assert_eq!(gateway.error(), "*,input has invalid connection number");
    gateway.send("2,commit");
    assert_eq!(gateway.error(), "2,commit before begin");
    gateway.send("3,begin");
    assert_eq!(gateway.error(), "3,begin before connect");
    gateway.send("4,rollback");
    gateway.send("4,close");
    gateway.send("5,explode");
    assert_eq!(gateway.error(), "5,read cmd - invalid command: explode");
    gateway.send("boot");
    assert_eq!(gateway.out(), "boot");
    assert!(gateway.finish());
}

#[test]
fn non_utf8_input_does_not_stop_the_reader() {
    let mut gateway = Gateway::start(UNREACHABLE_DB, &[]);
    gateway.send_raw(b"1,query,q1,s\xff\xfe\n");
    assert_eq!(gateway.error(), "1,query before connect");
    gateway.send_raw(b"\xc3\x28,connect\n");
    assert_eq!(gateway.error(), "*,input has invalid connection number");
    gateway.send("boot");
    assert_eq!(gateway.out(), "boot");
    assert!(gateway.finish());
}

#[test]
fn unreachable_database_fails_the_connect() {
    let mut gateway = Gateway::start(UNREACHABLE_DB, &[]);
    gateway.send("1,connect");
    let line = gateway.error();
    assert!(line.starts_with("1,"), "{line}");
    assert_ne!(line, "1,connect");
    assert!(gateway.finish());
}

#[test]
fn bad_numbers_in_the_environment_are_fatal() {
    let output = Command::new(env!("CARGO_BIN_EXE_sqlpipe"))
        .env_clear()
        .env("threads", "lots")
        .env("database_url", UNREACHABLE_DB)
        .stdin(Stdio::null())
        .output()
        .expect("run sqlpipe");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(stderr.trim_end(), "*,failed to parse env var to number");
    assert!(output.stdout.is_empty());
}

#[test]
fn connect_query_close() {
    let Some(url) = database_url() else { return };
    let mut gateway = Gateway::start(&url, &[]);
    gateway.send("1,connect");
    assert_eq!(gateway.out(), "1,connect");
    gateway.send("1,query,q1,sU0VMRUNUIDE=");
    assert_eq!(gateway.out(), "1,q1,0,1,1:int4");
    assert_eq!(gateway.out(), "1,q1,1");
    gateway.send("1,connect");
    assert_eq!(gateway.error(), "1,preventing double connect");
    gateway.send("1,close");
    gateway.send(&format!("1,query,q2,{}", sql("SELECT 1")));
    assert_eq!(gateway.error(), "1,query before connect");
    assert!(gateway.finish());
}

#[test]
fn rollback_discards_inserted_rows() {
    let Some(url) = database_url() else { return };
    let mut gateway = Gateway::start(&url, &[]);
    gateway.send("1,connect");
    assert_eq!(gateway.out(), "1,connect");
    gateway.send(&format!(
        "1,query,c1,{}",
        sql("CREATE TEMP TABLE pipe_t (id int4, name text)")
    ));
    assert_eq!(gateway.out(), "1,c1,0,0");

    gateway.send("1,begin");
    assert_eq!(gateway.out(), "1,begin");
    gateway.send("1,begin");
    assert_eq!(gateway.error(), "1,preventing double begin");
    gateway.send(&format!(
        "1,query,i1,{},7,{}",
        sql("INSERT INTO pipe_t VALUES ($1, $2)"),
        sql("seven")
    ));
    assert_eq!(gateway.out(), "1,i1,1,0");
    gateway.send("1,rollback");
    assert_eq!(gateway.out(), "1,rollback");

    gateway.send(&format!("1,query,n1,{}", sql("SELECT count(*) FROM pipe_t")));
    assert_eq!(gateway.out(), "1,n1,0,1,count:int8");
    assert_eq!(gateway.out(), "1,n1,0");
    gateway.send("1,close");
    assert!(gateway.finish());
}

#[test]
fn updates_report_counts_and_returning_rows() {
    let Some(url) = database_url() else { return };
    let mut gateway = Gateway::start(&url, &[]);
    gateway.send("1,connect");
    assert_eq!(gateway.out(), "1,connect");
    gateway.send(&format!(
        "1,query,c1,{}",
        sql("CREATE TEMP TABLE pipe_t (id int4, name text)")
    ));
    assert_eq!(gateway.out(), "1,c1,0,0");
    gateway.send("1,begin");
    assert_eq!(gateway.out(), "1,begin");
    for (qid, id) in [("a", 1), ("b", 2)] {
        gateway.send(&format!(
            "1,query,{qid},{},{id},",
            sql("INSERT INTO pipe_t VALUES ($1, $2) RETURNING id")
        ));
        assert_eq!(gateway.out(), format!("1,{qid},1,1,id:int4"));
        assert_eq!(gateway.out(), format!("1,{qid},{id}"));
    }
    gateway.send("1,commit");
    assert_eq!(gateway.out(), "1,commit");
    gateway.send(&format!(
        "1,query,u1,{},{},0",
        sql("UPDATE pipe_t SET name = $1 WHERE id > $2"),
        sql("x")
    ));
    assert_eq!(gateway.out(), "1,u1,2,0");
    assert!(gateway.finish());
}

#[test]
fn text_round_trips_through_base64() {
    let Some(url) = database_url() else { return };
    let mut gateway = Gateway::start(&url, &[]);
    gateway.send("1,connect");
    assert_eq!(gateway.out(), "1,connect");
    let query = sql("SELECT $1::text AS v");
    for (qid, arg, cell) in [
        ("r1", sql("héllo, world"), sql("héllo, world")),
        ("r2", sql("\"\""), sql("\"\"")),
        ("r3", String::new(), String::new()),
    ] {
        gateway.send(&format!("1,query,{qid},{query},{arg}"));
        assert_eq!(gateway.out(), format!("1,{qid},0,1,v:text"));
        assert_eq!(gateway.out(), format!("1,{qid},{cell}"));
    }
    assert!(gateway.finish());
}

#[test]
fn slow_statements_time_out() {
    let Some(url) = database_url() else { return };
    let mut gateway = Gateway::start(&url, &[("query_timeout", "200")]);
    gateway.send("1,connect");
    assert_eq!(gateway.out(), "1,connect");
    gateway.send(&format!("1,query,s1,{}", sql("SELECT pg_sleep(2)")));
    assert_eq!(gateway.err(), "1,s1,Query read timeout");
    gateway.send(&format!("1,query,s2,{}", sql("SELECT 2")));
    assert_eq!(gateway.out(), "1,s2,0,1,1:int4");
    assert_eq!(gateway.out(), "1,s2,2");
    assert!(gateway.finish());
}
