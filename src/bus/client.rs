//! Control bus client.
//!
//! # Responsibilities
//! - Connect to the NATS server and subscribe to register, unregister and list
//! - Announce readiness on `<prefix>.start`
//! - Apply register/unregister messages to the local registry
//! - Answer `list` requests on their reply subject with this worker's view
//! - Reconnect with jittered exponential backoff

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::bus::message::{BusCommand, BusError, Envelope, ListReply, Subjects};
use crate::bus::protocol::{BusConnection, ServerOp};
use crate::config::BusConfig;
use crate::registry::BackendRegistry;
use crate::resilience::Backoff;

/// How long `route-ctl list` collects replies from every worker.
pub const LIST_REPLY_WINDOW: Duration = Duration::from_millis(500);

pub struct BusClient {
    config: BusConfig,
    subjects: Subjects,
    registry: Arc<BackendRegistry>,
    uid: String,
}

impl BusClient {
    pub fn new(config: BusConfig, registry: Arc<BackendRegistry>, uid: impl Into<String>) -> Self {
        let subjects = Subjects::new(&config.subject_prefix);
        Self {
            config,
            subjects,
            registry,
            uid: uid.into(),
        }
    }

    /// Stay connected until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = Backoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        );

        loop {
            tokio::select! {
                res = self.session(&mut backoff) => match res {
                    Ok(()) => tracing::warn!(address = %self.config.address, "Control bus closed the connection"),
                    Err(e) => tracing::warn!(address = %self.config.address, error = %e, "Control bus session failed"),
                },
                _ = shutdown.recv() => break,
            }

            let delay = backoff.next_delay();
            tracing::info!(attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "Reconnecting to control bus");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("Control bus client stopped");
    }

    async fn session(&self, backoff: &mut Backoff) -> Result<(), BusError> {
        let mut conn = BusConnection::connect(&self.config.address, &format!("route-machine-{}", self.uid)).await?;
        for (subject, sid) in self.subjects.subscriptions() {
            conn.subscribe(subject, sid).await?;
        }
        let start = serde_json::to_vec(&serde_json::json!({ "uid": self.uid }))?;
        conn.publish(&self.subjects.start, None, start).await?;
        conn.flush().await?;

        tracing::info!(
            address = %self.config.address,
            server_id = %conn.server_info()["server_id"],
            "Connected to control bus"
        );
        backoff.reset();

        while let Some(op) = conn.next().await? {
            match op {
                ServerOp::Msg {
                    subject,
                    reply,
                    payload,
                    ..
                } => {
                    let envelope = match Envelope::from_payload(subject, reply, &payload) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            tracing::warn!(error = %e, "Ignoring control bus message");
                            continue;
                        }
                    };
                    if let Some(answer) = self.handle(envelope) {
                        conn.publish(&answer.subject, None, answer.payload()?).await?;
                    }
                }
                ServerOp::Err(reason) => return Err(BusError::Server(reason)),
                ServerOp::Info(_) | ServerOp::Ok | ServerOp::Pong | ServerOp::Ping => {}
            }
        }
        Ok(())
    }

    /// Apply one inbound message. Returns the envelope to publish in response, if any.
    pub fn handle(&self, envelope: Envelope) -> Option<Envelope> {
        match self.subjects.parse(envelope) {
            Ok(BusCommand::Registry(event)) => {
                self.registry.apply(&event);
                None
            }
            Ok(BusCommand::List { reply }) => {
                let body = ListReply {
                    uid: self.uid.clone(),
                    hosts: self.registry.list_all(),
                };
                match serde_json::to_value(&body) {
                    Ok(data) => Some(Envelope::new(reply, data)),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode list reply");
                        None
                    }
                }
            }
            Ok(BusCommand::Ignore) => None,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring control bus message");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Selection;
    use serde_json::json;
    use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    fn client(registry: Arc<BackendRegistry>) -> BusClient {
        BusClient::new(BusConfig::default(), registry, "worker-uid")
    }

    #[test]
    fn register_and_list_round_trip() {
        let registry = Arc::new(BackendRegistry::default());
        let client = client(registry.clone());

        let register = Envelope::new(
            "router.register",
            json!({"hostname": "10.0.0.2", "port": 8080, "uris": ["a.test", "B.test"]}),
        );
        assert!(client.handle(register).is_none());
        assert!(matches!(registry.select(Some("b.test")), Ok(Selection::Backend { .. })));

        let mut list = Envelope::new("router.list", json!({}));
        list.reply = Some("_INBOX.1".to_string());
        let reply = client.handle(list).unwrap();
        assert_eq!(reply.subject, "_INBOX.1");

        let body: ListReply = serde_json::from_value(reply.data).unwrap();
        assert_eq!(body.uid, "worker-uid");
        assert_eq!(body.hosts.len(), 2);
        assert_eq!(body.hosts["a.test"][0].port, 8080);
    }

    #[tokio::test]
    async fn subscribes_announces_and_serves_a_nats_server() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = BusConfig::default();
        config.address = server.local_addr().unwrap().to_string();

        let registry = Arc::new(BackendRegistry::default());
        let shutdown = crate::lifecycle::Shutdown::new();
        let task = tokio::spawn(
            BusClient::new(config, registry.clone(), "uid-1").run(shutdown.subscribe()),
        );

        let (stream, _) = server.accept().await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        write
            .write_all(b"INFO {\"server_id\":\"nats-test\",\"max_payload\":1048576}\r\n")
            .await
            .unwrap();

        assert!(next_line(&mut reader).await.starts_with("CONNECT {"));
        assert_eq!(next_line(&mut reader).await, "SUB router.register 1");
        assert_eq!(next_line(&mut reader).await, "SUB router.unregister 2");
        assert_eq!(next_line(&mut reader).await, "SUB router.list 3");
        let start = r#"{"uid":"uid-1"}"#;
        assert_eq!(next_line(&mut reader).await, format!("PUB router.start {}", start.len()));
        assert_eq!(next_line(&mut reader).await, start);
        assert_eq!(next_line(&mut reader).await, "PING");
        write.write_all(b"PONG\r\n").await.unwrap();

        let register = json!({"hostname": "127.0.0.1", "port": 9000, "uris": ["live.test"]}).to_string();
        write
            .write_all(format!("MSG router.register 1 {}\r\n{register}\r\n", register.len()).as_bytes())
            .await
            .unwrap();
        write
            .write_all(b"MSG router.list 3 _INBOX.xyz 2\r\n{}\r\n")
            .await
            .unwrap();

        // The list reply is published after the register message is applied.
        let head = next_line(&mut reader).await;
        let len: usize = head
            .strip_prefix("PUB _INBOX.xyz ")
            .expect("list reply")
            .parse()
            .unwrap();
        let mut payload = vec![0; len + 2];
        reader.read_exact(&mut payload).await.unwrap();
        let reply: ListReply = serde_json::from_slice(&payload[..len]).unwrap();
        assert_eq!(reply.uid, "uid-1");
        assert_eq!(reply.hosts["live.test"][0].port, 9000);
        assert_eq!(registry.pool_len("live.test"), 1);

        write.write_all(b"PING\r\n").await.unwrap();
        assert_eq!(next_line(&mut reader).await, "PONG");

        shutdown.trigger();
        task.await.unwrap();
    }
}
