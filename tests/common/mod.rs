#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sqlgate::engine::SqliteExecutorFactory;
use sqlgate::protocol::messages::{
    decode_backend_message, encode_cancel_request, encode_frontend_message,
    encode_startup_packet,
};
use sqlgate::protocol::{BackendMessage, FrontendMessage, ReadyForQueryStatus, StartupPacket};
use sqlgate::security::TrustAll;
use sqlgate::{GatewayConfig, Server};
use tempfile::TempDir;

pub struct Gateway {
    pub server: Server,
    pub data: TempDir,
}

impl Gateway {
    pub fn start(tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let data = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig {
            listen_port: 0,
            workers: 2,
            data_dir: data.path().to_path_buf(),
            busy_retry_interval: Duration::from_millis(5),
            ..GatewayConfig::default()
        };
        tweak(&mut config);
        let executors = Arc::new(SqliteExecutorFactory::new(
            data.path(),
            config.engine_lock_wait,
        ));
        let server = Server::start_with(config, executors, Arc::new(TrustAll)).unwrap();
        Self { server, data }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn database_path(&self, database: &str) -> std::path::PathBuf {
        self.data.path().join(format!("{database}.db"))
    }

    pub fn connect(&self, database: &str) -> Client {
        Client::login(self.addr(), "tester", database)
    }
}

/// A WAL-mode SQLite connection outside the gateway, used to hold locks.
pub fn external_connection(path: &Path) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(path).unwrap();
    let mode: String = conn
        .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_ascii_lowercase(), "wal");
    conn
}

pub struct Client {
    pub stream: TcpStream,
    pub process_id: u32,
    pub secret_key: u32,
}

impl Client {
    pub fn login(addr: SocketAddr, user: &str, database: &str) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut client = Self {
            stream,
            process_id: 0,
            secret_key: 0,
        };
        let packet = StartupPacket::new(user, Some(database.to_string()));
        client.stream.write_all(&encode_startup_packet(&packet)).unwrap();
        loop {
            match client.recv() {
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    client.process_id = process_id;
                    client.secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    assert_eq!(status, ReadyForQueryStatus::Idle);
                    break;
                }
                BackendMessage::ErrorResponse { code, message, .. } => {
                    panic!("login failed: {code} {message}")
                }
                _ => {}
            }
        }
        client
    }

    pub fn send(&mut self, message: &FrontendMessage) {
        self.stream
            .write_all(&encode_frontend_message(message))
            .unwrap();
    }

    pub fn query(&mut self, sql: &str) {
        self.send(&FrontendMessage::Query {
            sql: sql.to_string(),
        });
    }

    pub fn recv(&mut self) -> BackendMessage {
        self.try_recv().unwrap()
    }

    pub fn try_recv(&mut self) -> io::Result<BackendMessage> {
        let mut header = [0u8; 5];
        self.stream.read_exact(&mut header)?;
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload)?;
        decode_backend_message(header[0], &payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }

    /// Everything up to and including the next ReadyForQuery.
    pub fn until_ready(&mut self) -> Vec<BackendMessage> {
        let mut messages = Vec::new();
        loop {
            let message = self.recv();
            let done = matches!(message, BackendMessage::ReadyForQuery { .. });
            messages.push(message);
            if done {
                return messages;
            }
        }
    }

    /// Runs a simple query and returns its data rows, failing on any error.
    pub fn rows(&mut self, sql: &str) -> Vec<Vec<Option<String>>> {
        self.query(sql);
        self.until_ready()
            .into_iter()
            .filter_map(|message| match message {
                BackendMessage::DataRow { values } => Some(values),
                BackendMessage::ErrorResponse { code, message, .. } => {
                    panic!("{sql}: {code} {message}")
                }
                _ => None,
            })
            .collect()
    }

    pub fn cancel(&self, addr: SocketAddr) {
        let mut side = TcpStream::connect(addr).unwrap();
        side.write_all(&encode_cancel_request(self.process_id, self.secret_key))
            .unwrap();
        let mut rest = Vec::new();
        let _ = side.read_to_end(&mut rest);
        assert!(rest.is_empty(), "cancel requests get no reply");
    }

    /// True when nothing arrives within `wait`.
    pub fn is_silent_for(&mut self, wait: Duration) -> bool {
        self.stream.set_read_timeout(Some(wait)).unwrap();
        let mut byte = [0u8; 1];
        let silent = match self.stream.peek(&mut byte) {
            Ok(_) => false,
            Err(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        };
        self.stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        silent
    }
}

pub fn error_code(messages: &[BackendMessage]) -> Option<&str> {
    messages.iter().find_map(|message| match message {
        BackendMessage::ErrorResponse { code, .. } => Some(code.as_str()),
        _ => None,
    })
}

pub fn command_tags(messages: &[BackendMessage]) -> Vec<&str> {
    messages
        .iter()
        .filter_map(|message| match message {
            BackendMessage::CommandComplete { tag } => Some(tag.as_str()),
            _ => None,
        })
        .collect()
}

pub fn last_status(messages: &[BackendMessage]) -> Option<ReadyForQueryStatus> {
    messages.iter().rev().find_map(|message| match message {
        BackendMessage::ReadyForQuery { status } => Some(*status),
        _ => None,
    })
}
