//! Scripted fake backend for driving the engine over in-memory streams

#![allow(dead_code)]

use pgpump::{Connection, SessionConfig, Transport};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing_subscriber::EnvFilter;

pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const PROTOCOL_VERSION: i32 = 196608;

/// Frame a backend message
pub fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

pub fn auth_ok() -> Vec<u8> {
    msg(b'R', &0i32.to_be_bytes())
}

pub fn auth_cleartext() -> Vec<u8> {
    msg(b'R', &3i32.to_be_bytes())
}

pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = cstr(name);
    body.extend_from_slice(&cstr(value));
    msg(b'S', &body)
}

pub fn backend_key(pid: i32, secret: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&secret.to_be_bytes());
    msg(b'K', &body)
}

pub fn ready(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

pub fn command_complete(tag: &str) -> Vec<u8> {
    msg(b'C', &cstr(tag))
}

pub fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut body = b"SERROR\0C".to_vec();
    body.extend_from_slice(&cstr(code));
    body.push(b'M');
    body.extend_from_slice(&cstr(message));
    body.push(0);
    msg(b'E', &body)
}

pub fn notice(message: &str) -> Vec<u8> {
    let mut body = b"SNOTICE\0C00000\0M".to_vec();
    body.extend_from_slice(&cstr(message));
    body.push(0);
    msg(b'N', &body)
}

pub fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&cstr(channel));
    body.extend_from_slice(&cstr(payload));
    msg(b'A', &body)
}

pub fn row_description(columns: &[(&str, u32)]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for (name, oid) in columns {
        body.extend_from_slice(&cstr(name));
        body.extend_from_slice(&0i32.to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
        body.extend_from_slice(&oid.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(&(-1i32).to_be_bytes());
        body.extend_from_slice(&0i16.to_be_bytes());
    }
    msg(b'T', &body)
}

pub fn data_row(values: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = (values.len() as i16).to_be_bytes().to_vec();
    for value in values {
        match value {
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(bytes) => {
                body.extend_from_slice(&(bytes.len() as i32).to_be_bytes());
                body.extend_from_slice(bytes);
            }
        }
    }
    msg(b'D', &body)
}

pub fn parameter_description(oids: &[u32]) -> Vec<u8> {
    let mut body = (oids.len() as i16).to_be_bytes().to_vec();
    for oid in oids {
        body.extend_from_slice(&oid.to_be_bytes());
    }
    msg(b't', &body)
}

pub fn parse_complete() -> Vec<u8> {
    msg(b'1', &[])
}

pub fn bind_complete() -> Vec<u8> {
    msg(b'2', &[])
}

/// Server half of a connection
pub struct Backend<S> {
    stream: S,
}

impl<S> Backend<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    pub async fn send_all(&mut self, messages: &[Vec<u8>]) {
        self.send(&messages.concat()).await;
    }

    /// Read the 8-byte SSLRequest
    pub async fn read_ssl_request(&mut self) {
        let mut request = [0u8; 8];
        self.stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[0..4], &8i32.to_be_bytes());
        assert_eq!(&request[4..8], &SSL_REQUEST_CODE.to_be_bytes());
    }

    /// Read the StartupMessage and return its parameters
    pub async fn read_startup(&mut self) -> Vec<(String, String)> {
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body[0..4], &PROTOCOL_VERSION.to_be_bytes());

        let mut strings = body[4..]
            .split(|&b| b == 0)
            .map(|s| String::from_utf8(s.to_vec()).unwrap());
        let mut params = Vec::new();
        loop {
            let key = strings.next().unwrap();
            if key.is_empty() {
                break;
            }
            params.push((key, strings.next().unwrap()));
        }
        params
    }

    /// Read one tagged frontend message
    pub async fn read_message(&mut self) -> (u8, Vec<u8>) {
        let tag = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap() as usize;
        let mut body = vec![0u8; len - 4];
        self.stream.read_exact(&mut body).await.unwrap();
        (tag, body)
    }

    /// Read one message and check its tag
    pub async fn expect(&mut self, tag: u8) -> Vec<u8> {
        let (got, body) = self.read_message().await;
        assert_eq!(got as char, tag as char, "unexpected frontend message");
        body
    }

    /// Answer every simple query with `SELECT 1` until Terminate or hang-up; returns
    /// the number of queries served
    pub async fn serve_queries(mut self) -> usize {
        let mut served = 0;
        loop {
            let Ok(tag) = self.stream.read_u8().await else {
                return served;
            };
            let Ok(len) = self.stream.read_i32().await else {
                return served;
            };
            let mut body = vec![0u8; len as usize - 4];
            if self.stream.read_exact(&mut body).await.is_err() || tag == b'X' {
                return served;
            }
            assert_eq!(tag, b'Q');
            served += 1;
            self.send_all(&[
                row_description(&[("n", 23)]),
                data_row(&[Some(b"1")]),
                command_complete("SELECT 1"),
                ready(b'I'),
            ])
            .await;
        }
    }

    /// Trust authentication, a few parameters, key data, ReadyForQuery
    pub async fn accept(&mut self) {
        self.send_all(&[
            auth_ok(),
            parameter_status("server_version", "16.2"),
            parameter_status("client_encoding", "UTF8"),
            backend_key(4242, 99),
            ready(b'I'),
        ])
        .await;
    }
}

/// Route engine logs to the test output (`RUST_LOG=pgpump=debug` for the detail)
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

pub fn config() -> SessionConfig {
    init_logging();
    SessionConfig::builder("app")
        .database("shop")
        .build()
        .unwrap()
}

/// Established plaintext connection plus the backend serving it
pub async fn connected() -> (Connection, Backend<DuplexStream>) {
    let (client, server) = tokio::io::duplex(16 * 1024);
    let backend = tokio::spawn(async move {
        let mut backend = Backend::new(server);
        backend.read_startup().await;
        backend.accept().await;
        backend
    });
    let conn = Connection::establish(&config(), Transport::from_stream(client))
        .await
        .unwrap();
    (conn, backend.await.unwrap())
}
