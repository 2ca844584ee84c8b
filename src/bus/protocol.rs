//! NATS client protocol.
//!
//! Only the operations the router needs. Every frame is a CRLF-terminated
//! control line, `MSG` and `PUB` are followed by a payload of the announced
//! length and another CRLF.
//!
//! ```text
//! server → client: INFO {json} | MSG <subject> <sid> [reply-to] <#bytes> | PING | PONG | +OK | -ERR '<reason>'
//! client → server: CONNECT {json} | SUB <subject> <sid> | PUB <subject> [reply-to] <#bytes> | PING | PONG
//! ```

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::bus::message::BusError;

/// Operation received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(serde_json::Value),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// Operation sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(ConnectInfo),
    Sub {
        subject: String,
        sid: u64,
    },
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Vec<u8>,
    },
    Ping,
    Pong,
}

/// Options announced in `CONNECT`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub name: String,
    pub lang: &'static str,
    pub version: &'static str,
    pub protocol: u8,
}

impl ConnectInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            verbose: false,
            pedantic: false,
            name: name.into(),
            lang: "rust",
            version: env!("CARGO_PKG_VERSION"),
            protocol: 0,
        }
    }
}

fn check_subject(subject: &str) -> Result<(), BusError> {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        return Err(BusError::Protocol(format!("invalid subject {subject:?}")));
    }
    Ok(())
}

impl ClientOp {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        let mut out = Vec::new();
        match self {
            ClientOp::Connect(info) => {
                out.extend_from_slice(b"CONNECT ");
                out.extend(serde_json::to_vec(info)?);
                out.extend_from_slice(b"\r\n");
            }
            ClientOp::Sub { subject, sid } => {
                check_subject(subject)?;
                out.extend(format!("SUB {subject} {sid}\r\n").into_bytes());
            }
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                check_subject(subject)?;
                let head = match reply {
                    Some(reply) => {
                        check_subject(reply)?;
                        format!("PUB {subject} {reply} {}\r\n", payload.len())
                    }
                    None => format!("PUB {subject} {}\r\n", payload.len()),
                };
                out.extend(head.into_bytes());
                out.extend_from_slice(payload);
                out.extend_from_slice(b"\r\n");
            }
            ClientOp::Ping => out.extend_from_slice(b"PING\r\n"),
            ClientOp::Pong => out.extend_from_slice(b"PONG\r\n"),
        }
        Ok(out)
    }
}

fn bad_line(line: &str) -> BusError {
    BusError::Protocol(format!("malformed line {line:?}"))
}

/// Read the next server operation. `None` means the server closed the connection.
pub async fn read_op<R>(reader: &mut R) -> Result<Option<ServerOp>, BusError>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = String::new();
    loop {
        raw.clear();
        if reader.read_line(&mut raw).await? == 0 {
            return Ok(None);
        }
        if !raw.trim_end_matches(['\r', '\n']).is_empty() {
            break;
        }
    }
    let line = raw.trim_end_matches(['\r', '\n']);

    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let op = match verb.to_ascii_uppercase().as_str() {
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(rest.trim().trim_matches('\'').to_string()),
        "INFO" => ServerOp::Info(serde_json::from_str(rest)?),
        "MSG" => {
            let args: Vec<&str> = rest.split_whitespace().collect();
            let (subject, sid, reply, len) = match args.as_slice() {
                [subject, sid, len] => (*subject, *sid, None, *len),
                [subject, sid, reply, len] => (*subject, *sid, Some(reply.to_string()), *len),
                _ => return Err(bad_line(line)),
            };
            let sid = sid.parse().map_err(|_| bad_line(line))?;
            let len: usize = len.parse().map_err(|_| bad_line(line))?;
            let subject = subject.to_string();

            let mut payload = vec![0; len + 2];
            reader.read_exact(&mut payload).await?;
            if !payload.ends_with(b"\r\n") {
                return Err(BusError::Protocol(format!(
                    "payload on {subject} is not terminated"
                )));
            }
            payload.truncate(len);
            ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            }
        }
        _ => return Err(BusError::Protocol(format!("unknown operation {verb:?}"))),
    };
    Ok(Some(op))
}

/// An established NATS client connection.
pub struct BusConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    info: serde_json::Value,
}

impl BusConnection {
    /// Connect, wait for `INFO` and send `CONNECT`.
    pub async fn connect(address: &str, name: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let info = match read_op(&mut reader).await? {
            Some(ServerOp::Info(info)) => info,
            Some(ServerOp::Err(reason)) => return Err(BusError::Server(reason)),
            Some(other) => {
                return Err(BusError::Protocol(format!("expected INFO, got {other:?}")))
            }
            None => return Err(BusError::Closed),
        };

        let mut conn = Self {
            reader,
            writer,
            info,
        };
        conn.send(&ClientOp::Connect(ConnectInfo::new(name))).await?;
        Ok(conn)
    }

    /// `INFO` document sent by the server on connect.
    pub fn server_info(&self) -> &serde_json::Value {
        &self.info
    }

    pub async fn send(&mut self, op: &ClientOp) -> Result<(), BusError> {
        self.writer.write_all(&op.encode()?).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn subscribe(&mut self, subject: &str, sid: u64) -> Result<(), BusError> {
        self.send(&ClientOp::Sub {
            subject: subject.to_string(),
            sid,
        })
        .await
    }

    pub async fn publish(
        &mut self,
        subject: &str,
        reply: Option<&str>,
        payload: Vec<u8>,
    ) -> Result<(), BusError> {
        self.send(&ClientOp::Pub {
            subject: subject.to_string(),
            reply: reply.map(str::to_owned),
            payload,
        })
        .await
    }

    /// Next operation from the server. `PING` is answered here and never returned.
    pub async fn next(&mut self) -> Result<Option<ServerOp>, BusError> {
        loop {
            match read_op(&mut self.reader).await? {
                Some(ServerOp::Ping) => self.send(&ClientOp::Pong).await?,
                other => return Ok(other),
            }
        }
    }

    /// Round-trip a `PING` so the server has processed everything sent before it.
    pub async fn flush(&mut self) -> Result<(), BusError> {
        self.send(&ClientOp::Ping).await?;
        loop {
            match self.next().await? {
                Some(ServerOp::Pong) => return Ok(()),
                Some(ServerOp::Err(reason)) => return Err(BusError::Server(reason)),
                Some(_) => {}
                None => return Err(BusError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn parse(input: &'static [u8]) -> Result<Option<ServerOp>, BusError> {
        let mut reader = BufReader::new(input);
        read_op(&mut reader).await
    }

    #[tokio::test]
    async fn parses_msg_with_and_without_reply() {
        let op = parse(b"MSG router.register 1 5\r\nhello\r\n").await.unwrap();
        assert_eq!(
            op,
            Some(ServerOp::Msg {
                subject: "router.register".into(),
                sid: 1,
                reply: None,
                payload: b"hello".to_vec(),
            })
        );

        let op = parse(b"msg router.list 3 _INBOX.abc 2\r\n{}\r\n").await.unwrap();
        match op {
            Some(ServerOp::Msg { reply, payload, .. }) => {
                assert_eq!(reply.as_deref(), Some("_INBOX.abc"));
                assert_eq!(payload, b"{}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn parses_control_lines() {
        assert_eq!(parse(b"PING\r\n").await.unwrap(), Some(ServerOp::Ping));
        assert_eq!(parse(b"\r\n+OK\r\n").await.unwrap(), Some(ServerOp::Ok));
        assert_eq!(
            parse(b"-ERR 'Unknown Protocol Operation'\r\n").await.unwrap(),
            Some(ServerOp::Err("Unknown Protocol Operation".into()))
        );
        let info = parse(b"INFO {\"server_id\":\"x\",\"max_payload\":1048576}\r\n")
            .await
            .unwrap();
        assert!(matches!(info, Some(ServerOp::Info(v)) if v["max_payload"] == 1048576));
        assert_eq!(parse(b"").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_malformed_frames() {
        assert!(matches!(
            parse(b"MSG router.register one 5\r\nhello\r\n").await,
            Err(BusError::Protocol(_))
        ));
        assert!(matches!(
            parse(b"MSG a 1 3\r\nhello\r\n").await,
            Err(BusError::Protocol(_))
        ));
        assert!(matches!(parse(b"HELLO\r\n").await, Err(BusError::Protocol(_))));
    }

    #[test]
    fn encodes_client_ops() {
        let sub = ClientOp::Sub {
            subject: "router.register".into(),
            sid: 1,
        };
        assert_eq!(sub.encode().unwrap(), b"SUB router.register 1\r\n");

        let publish = ClientOp::Pub {
            subject: "router.list".into(),
            reply: Some("_INBOX.1".into()),
            payload: b"{}".to_vec(),
        };
        assert_eq!(publish.encode().unwrap(), b"PUB router.list _INBOX.1 2\r\n{}\r\n");

        let bad = ClientOp::Sub {
            subject: "has space".into(),
            sid: 1,
        };
        assert!(matches!(bad.encode(), Err(BusError::Protocol(_))));

        let connect = String::from_utf8(ClientOp::Connect(ConnectInfo::new("w")).encode().unwrap())
            .unwrap();
        assert!(connect.starts_with("CONNECT {"));
        assert!(connect.contains("\"verbose\":false"));
    }

    #[tokio::test]
    async fn handshake_answers_ping_and_flushes() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();

        let hub = tokio::spawn(async move {
            let (stream, _) = server.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"INFO {\"server_id\":\"test\"}\r\n").await.unwrap();

            let connect = lines.next_line().await.unwrap().unwrap();
            assert!(connect.starts_with("CONNECT "));

            write.write_all(b"PING\r\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "PING");
            write.write_all(b"PONG\r\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "PONG");
        });

        let mut conn = BusConnection::connect(&address, "test").await.unwrap();
        assert_eq!(conn.server_info()["server_id"], "test");
        // The server's PING arrives before our flush is answered.
        conn.flush().await.unwrap();
        hub.await.unwrap();
    }

    #[tokio::test]
    async fn server_error_before_info_is_reported() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = server.accept().await.unwrap();
            stream
                .write_all(b"-ERR 'maximum connections exceeded'\r\n")
                .await
                .unwrap();
        });

        let err = BusConnection::connect(&address, "test").await.err().unwrap();
        assert!(matches!(err, BusError::Server(reason) if reason == "maximum connections exceeded"));
    }
}
