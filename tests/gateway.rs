mod common;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use common::{Gateway, command_tags, error_code, external_connection, last_status};
use sqlgate::protocol::messages::{decode_backend_message, encode_ssl_request, encode_startup_packet};
use sqlgate::protocol::{BackendMessage, FrontendMessage, ReadyForQueryStatus, StartupPacket};

#[test]
fn simple_query_creates_and_reads_rows() {
    let gateway = Gateway::start(|_| {});
    let mut client = gateway.connect("app");

    client.query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT); INSERT INTO items (name) VALUES ('a'), ('b')");
    let messages = client.until_ready();
    assert_eq!(command_tags(&messages), vec!["CREATE TABLE", "INSERT 0 2"]);
    assert_eq!(last_status(&messages), Some(ReadyForQueryStatus::Idle));

    let rows = client.rows("SELECT id, name FROM items ORDER BY id");
    assert_eq!(
        rows,
        vec![
            vec![Some("1".to_string()), Some("a".to_string())],
            vec![Some("2".to_string()), Some("b".to_string())],
        ]
    );
    assert!(gateway.database_path("app").exists());
}

#[test]
fn extended_query_binds_parameters() {
    let gateway = Gateway::start(|_| {});
    let mut client = gateway.connect("app");

    client.send(&FrontendMessage::Parse {
        statement_name: "plus_one".to_string(),
        query: "SELECT $1 + 1 AS answer".to_string(),
        parameter_types: vec![],
    });
    client.send(&FrontendMessage::Bind {
        portal_name: String::new(),
        statement_name: "plus_one".to_string(),
        param_formats: vec![],
        params: vec![Some(b"41".to_vec())],
        result_formats: vec![],
    });
    client.send(&FrontendMessage::DescribePortal {
        portal_name: String::new(),
    });
    client.send(&FrontendMessage::Execute {
        portal_name: String::new(),
        max_rows: 0,
    });
    client.send(&FrontendMessage::Sync);

    let messages = client.until_ready();
    assert!(matches!(messages[0], BackendMessage::ParseComplete));
    assert!(matches!(messages[1], BackendMessage::BindComplete));
    match &messages[2] {
        BackendMessage::RowDescription { fields } => assert_eq!(fields[0].name, "answer"),
        other => panic!("expected RowDescription, got {other:?}"),
    }
    assert_eq!(
        messages[3],
        BackendMessage::DataRow {
            values: vec![Some("42".to_string())]
        }
    );
    assert_eq!(command_tags(&messages), vec!["SELECT 1"]);
}

#[test]
fn ssl_request_is_declined_and_plain_login_continues() {
    let gateway = Gateway::start(|_| {});
    let mut stream = TcpStream::connect(gateway.addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(&encode_ssl_request()).unwrap();
    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).unwrap();
    assert_eq!(answer[0], b'N');

    let packet = StartupPacket::new("tester", Some("app".to_string()));
    stream.write_all(&encode_startup_packet(&packet)).unwrap();
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    assert_eq!(
        decode_backend_message(header[0], &header[5..5 + len - 4]).unwrap(),
        BackendMessage::AuthenticationOk
    );
}

#[test]
fn invalid_database_name_is_refused() {
    let gateway = Gateway::start(|_| {});
    let mut stream = TcpStream::connect(gateway.addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let packet = StartupPacket::new("tester", Some("../escape".to_string()));
    stream.write_all(&encode_startup_packet(&packet)).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply[0], b'E');
    let len = u32::from_be_bytes([reply[1], reply[2], reply[3], reply[4]]) as usize;
    match decode_backend_message(b'E', &reply[5..1 + len]).unwrap() {
        BackendMessage::ErrorResponse { code, .. } => assert_eq!(code, "3D000"),
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
}

#[test]
fn connections_beyond_the_limit_are_rejected() {
    let gateway = Gateway::start(|config| config.max_connections = 1);
    let _first = gateway.connect("app");

    let mut second = TcpStream::connect(gateway.addr()).unwrap();
    second.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reply = Vec::new();
    second.read_to_end(&mut reply).unwrap();
    assert_eq!(reply.first(), Some(&b'E'));
    let len = u32::from_be_bytes([reply[1], reply[2], reply[3], reply[4]]) as usize;
    match decode_backend_message(b'E', &reply[5..1 + len]).unwrap() {
        BackendMessage::ErrorResponse { code, .. } => assert_eq!(code, "53300"),
        other => panic!("expected ErrorResponse, got {other:?}"),
    }
}

#[test]
fn write_waits_for_an_external_lock_then_succeeds() {
    let gateway = Gateway::start(|_| {});
    let mut client = gateway.connect("shared");
    let mut reader = gateway.connect("shared");
    client.rows("CREATE TABLE events (v INTEGER)");

    let holder = external_connection(&gateway.database_path("shared"));
    holder
        .execute_batch("BEGIN IMMEDIATE; INSERT INTO events VALUES (1);")
        .unwrap();

    client.query("INSERT INTO events VALUES (2)");
    assert!(client.is_silent_for(Duration::from_millis(200)));

    // other connections keep being served while the write waits
    assert_eq!(reader.rows("SELECT count(*) FROM events"), vec![vec![Some("0".to_string())]]);

    holder.execute_batch("COMMIT").unwrap();
    let messages = client.until_ready();
    assert_eq!(error_code(&messages), None);
    assert_eq!(command_tags(&messages), vec!["INSERT 0 1"]);
    assert_eq!(client.rows("SELECT count(*) FROM events"), vec![vec![Some("2".to_string())]]);
}

#[test]
fn busy_timeout_reports_lock_not_available_once() {
    let gateway = Gateway::start(|config| config.busy_timeout = Duration::from_millis(150));
    let mut client = gateway.connect("shared");
    client.rows("CREATE TABLE events (v INTEGER)");

    let holder = external_connection(&gateway.database_path("shared"));
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    client.query("INSERT INTO events VALUES (1)");
    let messages = client.until_ready();
    let errors = messages
        .iter()
        .filter(|message| matches!(message, BackendMessage::ErrorResponse { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(error_code(&messages), Some("55P03"));
    assert_eq!(last_status(&messages), Some(ReadyForQueryStatus::Idle));

    holder.execute_batch("COMMIT").unwrap();
    client.query("INSERT INTO events VALUES (1)");
    assert_eq!(command_tags(&client.until_ready()), vec!["INSERT 0 1"]);
}

#[test]
fn cancel_request_interrupts_a_waiting_write() {
    let gateway = Gateway::start(|config| config.busy_timeout = Duration::ZERO);
    let mut client = gateway.connect("shared");
    client.rows("CREATE TABLE events (v INTEGER)");

    let holder = external_connection(&gateway.database_path("shared"));
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    client.query("INSERT INTO events VALUES (1)");
    assert!(client.is_silent_for(Duration::from_millis(100)));
    client.cancel(gateway.addr());

    let messages = client.until_ready();
    assert_eq!(error_code(&messages), Some("57014"));
    holder.execute_batch("ROLLBACK").unwrap();
    assert_eq!(client.rows("SELECT count(*) FROM events"), vec![vec![Some("0".to_string())]]);
}

#[test]
fn disconnect_during_an_unbounded_wait_abandons_the_write() {
    let gateway = Gateway::start(|config| config.busy_timeout = Duration::ZERO);
    let mut client = gateway.connect("shared");
    let mut observer = gateway.connect("shared");
    client.rows("CREATE TABLE events (v INTEGER)");

    let holder = external_connection(&gateway.database_path("shared"));
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    client.query("INSERT INTO events VALUES (1)");
    assert!(client.is_silent_for(Duration::from_millis(100)));
    drop(client);
    thread::sleep(Duration::from_millis(200));

    holder.execute_batch("COMMIT").unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(observer.rows("SELECT count(*) FROM events"), vec![vec![Some("0".to_string())]]);

    // the gateway write lock went with the closed connection
    observer.query("INSERT INTO events VALUES (2)");
    assert_eq!(command_tags(&observer.until_ready()), vec!["INSERT 0 1"]);
}

#[test]
fn explicit_transaction_serializes_gateway_writers() {
    let gateway = Gateway::start(|_| {});
    let mut first = gateway.connect("shared");
    let mut second = gateway.connect("shared");
    first.rows("CREATE TABLE events (v INTEGER)");

    first.query("BEGIN; INSERT INTO events VALUES (1)");
    let messages = first.until_ready();
    assert_eq!(last_status(&messages), Some(ReadyForQueryStatus::InTransaction));

    second.query("INSERT INTO events VALUES (2)");
    assert!(second.is_silent_for(Duration::from_millis(150)));

    first.query("COMMIT");
    assert_eq!(command_tags(&first.until_ready()), vec!["COMMIT"]);
    assert_eq!(command_tags(&second.until_ready()), vec!["INSERT 0 1"]);
    assert_eq!(
        second.rows("SELECT v FROM events ORDER BY v"),
        vec![vec![Some("1".to_string())], vec![Some("2".to_string())]]
    );
}

#[test]
fn large_results_stream_completely() {
    let gateway = Gateway::start(|config| config.write_chunk_size = 512);
    let mut client = gateway.connect("bulk");
    client.rows(
        "CREATE TABLE numbers (n INTEGER, label TEXT);
         WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < 20000)
         INSERT INTO numbers SELECT n, printf('row-%06d', n) FROM seq",
    );

    // let the server run ahead of the reader so its socket buffer fills
    client.query("SELECT n, label FROM numbers ORDER BY n");
    thread::sleep(Duration::from_millis(100));
    let messages = client.until_ready();
    let rows: Vec<_> = messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::DataRow { values } => Some(values),
            _ => None,
        })
        .collect();
    assert_eq!(rows.len(), 20000);
    assert_eq!(rows[19999][1].as_deref(), Some("row-020000"));
    assert_eq!(command_tags(&messages), vec!["SELECT 20000"]);
}

#[test]
fn portal_suspends_at_max_rows() {
    let gateway = Gateway::start(|_| {});
    let mut client = gateway.connect("app");
    client.rows("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (1), (2), (3)");

    client.send(&FrontendMessage::Parse {
        statement_name: String::new(),
        query: "SELECT v FROM t ORDER BY v".to_string(),
        parameter_types: vec![],
    });
    client.send(&FrontendMessage::Bind {
        portal_name: "cur".to_string(),
        statement_name: String::new(),
        param_formats: vec![],
        params: vec![],
        result_formats: vec![],
    });
    for _ in 0..2 {
        client.send(&FrontendMessage::Execute {
            portal_name: "cur".to_string(),
            max_rows: 2,
        });
    }
    client.send(&FrontendMessage::Sync);

    let messages = client.until_ready();
    let suspended = messages
        .iter()
        .filter(|message| matches!(message, BackendMessage::PortalSuspended))
        .count();
    assert_eq!(suspended, 1);
    let rows = messages
        .iter()
        .filter(|message| matches!(message, BackendMessage::DataRow { .. }))
        .count();
    assert_eq!(rows, 3);
    assert_eq!(command_tags(&messages), vec!["SELECT 1"]);
}

#[test]
fn shutdown_closes_open_connections() {
    let gateway = Gateway::start(|_| {});
    let mut client = gateway.connect("app");
    let Gateway { server, data } = gateway;
    server.shutdown();

    match client.try_recv() {
        Ok(BackendMessage::ErrorResponse { code, .. }) => assert_eq!(code, "57P01"),
        Ok(other) => panic!("unexpected message {other:?}"),
        Err(_) => {}
    }
    drop(data);
}
