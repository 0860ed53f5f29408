// ── In-process fake device ──
//
// A tiny RouterOS API server on a loopback listener. `/login` is handled
// internally; every other request is recorded and answered by a handler
// closure. Used by this crate's integration tests and by `wgkeeper-core`.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use secrecy::SecretString;
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::client::ClientConfig;
use crate::proto::{self, Command, Record, Reply};

pub const FAKE_USERNAME: &str = "admin";
pub const FAKE_PASSWORD: &str = "secret";

type Handler = dyn Fn(&Command) -> Vec<Reply> + Send + Sync;

/// A running fake device. Dropping it stops the accept loop.
pub struct FakeDevice {
    address: String,
    requests: Arc<Mutex<Vec<Command>>>,
    connections: Arc<Mutex<usize>>,
    cancel: CancellationToken,
}

impl FakeDevice {
    /// Start a device whose replies are produced by `handler`.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Command) -> Vec<Reply> + Send + Sync + 'static,
    {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
            Ok(l) => l,
            Err(e) => panic!("fake device bind failed: {e}"),
        };
        let address = match listener.local_addr() {
            Ok(a) => a.to_string(),
            Err(e) => panic!("fake device has no address: {e}"),
        };
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let cancel = CancellationToken::new();
        let handler: Arc<Handler> = Arc::new(handler);

        let accept_requests = Arc::clone(&requests);
        let accept_connections = Arc::clone(&connections);
        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        *accept_connections.lock().unwrap_or_else(PoisonError::into_inner) += 1;
                        tokio::spawn(serve(
                            stream,
                            Arc::clone(&handler),
                            Arc::clone(&accept_requests),
                        ));
                    }
                }
            }
        });

        Self {
            address,
            requests,
            connections,
            cancel,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Client settings that log in successfully against this device.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            address: self.address.clone(),
            username: FAKE_USERNAME.into(),
            password: SecretString::from(FAKE_PASSWORD.to_string()),
            dial_timeout: Duration::from_secs(2),
        }
    }

    /// Every non-login request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Command> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests whose command path equals `path`.
    pub fn requests_to(&self, path: &str) -> Vec<Command> {
        self.requests()
            .into_iter()
            .filter(|c| c.path() == path)
            .collect()
    }

    /// Number of TCP connections accepted.
    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(stream: TcpStream, handler: Arc<Handler>, requests: Arc<Mutex<Vec<Command>>>) {
    let mut stream = BufStream::new(stream);
    loop {
        let Ok(words) = proto::read_sentence(&mut stream).await else {
            return;
        };
        let Ok(command) = Command::from_words(&words) else {
            return;
        };
        let replies = match command.path() {
            "/login" => login_replies(&command),
            "/quit" => return,
            _ => {
                requests
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(command.clone());
                handler(&command)
            }
        };
        for reply in replies {
            if proto::write_sentence(&mut stream, &reply.words()).await.is_err() {
                return;
            }
        }
    }
}

fn login_replies(command: &Command) -> Vec<Reply> {
    let ok = command.attribute("name") == Some(FAKE_USERNAME)
        && command.attribute("password") == Some(FAKE_PASSWORD);
    if ok {
        vec![done()]
    } else {
        vec![
            trap("invalid user name or password (6)"),
            done(),
        ]
    }
}

// ── Reply helpers ───────────────────────────────────────────────────

pub fn done() -> Reply {
    Reply::Done(Record::default())
}

pub fn done_ret(ret: &str) -> Reply {
    Reply::Done([("ret", ret)].into_iter().collect())
}

pub fn trap(message: &str) -> Reply {
    Reply::Trap([("message", message)].into_iter().collect())
}

pub fn row(attributes: &[(&str, &str)]) -> Reply {
    Reply::Re(attributes.iter().copied().collect())
}
