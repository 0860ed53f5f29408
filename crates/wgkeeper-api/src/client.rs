// RouterOS API connection
//
// One authenticated TCP session. Requests are strictly sequential: a command
// is written, then replies are read until `!done`. Any framing or socket
// failure marks the connection broken so the pool can discard it.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::proto::{self, Command, Record, Reply};

/// Default RouterOS API port (plaintext).
pub const DEFAULT_PORT: u16 = 8728;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// How to reach and authenticate against one device.
#[derive(Clone)]
pub struct ClientConfig {
    /// `host:port` of the API service.
    pub address: String,
    pub username: String,
    pub password: SecretString,
    /// Upper bound for TCP connect plus login.
    pub dial_timeout: Duration,
}

impl ClientConfig {
    /// `address` may omit the port, in which case [`DEFAULT_PORT`] is used.
    pub fn new(address: &str, username: impl Into<String>, password: SecretString) -> Self {
        Self {
            address: with_default_port(address),
            username: username.into(),
            password,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

fn with_default_port(address: &str) -> String {
    if address.parse::<std::net::SocketAddr>().is_ok() {
        return address.to_owned();
    }
    if let Ok(ip) = address.parse::<std::net::Ipv6Addr>() {
        return format!("[{ip}]:{DEFAULT_PORT}");
    }
    match address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => address.to_owned(),
        _ => format!("{address}:{DEFAULT_PORT}"),
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

/// Everything a command produced: `!re` rows plus the `!done` attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub records: Vec<Record>,
    pub done: Record,
}

impl Response {
    /// The `ret` attribute of `!done` (the id of a newly added item).
    pub fn ret(&self) -> Option<&str> {
        self.done.get("ret")
    }
}

/// A live, logged-in API session.
pub struct DeviceClient {
    stream: BufStream<TcpStream>,
    address: String,
    broken: bool,
}

impl DeviceClient {
    /// Dial the device and log in, bounded by `dial_timeout`.
    pub async fn connect(config: &ClientConfig) -> Result<Self, Error> {
        let address = config.address.clone();
        let dial = async {
            let stream = TcpStream::connect(&config.address)
                .await
                .map_err(|e| Error::Connect {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
            if let Err(e) = stream.set_nodelay(true) {
                trace!(error = %e, "set_nodelay failed");
            }
            let mut client = Self {
                stream: BufStream::new(stream),
                address: address.clone(),
                broken: false,
            };
            client.login(&config.username, &config.password).await?;
            Ok::<Self, Error>(client)
        };

        let client = tokio::time::timeout(config.dial_timeout, dial)
            .await
            .map_err(|_| Error::Timeout {
                address: address.clone(),
                timeout_secs: config.dial_timeout.as_secs(),
            })??;
        debug!(address = %address, "device session established");
        Ok(client)
    }

    /// The `host:port` this client is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// `true` once an I/O, framing, or `!fatal` error has been observed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    async fn login(&mut self, username: &str, password: &SecretString) -> Result<(), Error> {
        let cmd = Command::new("/login")
            .attr("name", username)
            .attr("password", password.expose_secret());
        match self.execute(&cmd).await {
            Ok(_) => Ok(()),
            Err(Error::Trap { message, .. }) => Err(Error::Login { message }),
            Err(e) => Err(e),
        }
    }

    /// Send one command and collect its replies.
    ///
    /// A `!trap` is returned as [`Error::Trap`] after the trailing `!done`
    /// has been consumed, so the session stays usable.
    pub async fn execute(&mut self, command: &Command) -> Result<Response, Error> {
        if self.broken {
            return Err(Error::Protocol(format!(
                "connection to {} is no longer usable",
                self.address
            )));
        }
        trace!(command = ?command, "sending");
        let result = self.exchange(command).await;
        if let Err(ref e) = result {
            if e.is_connection_lost() {
                warn!(address = %self.address, error = %e, "device connection lost");
                self.broken = true;
            }
        }
        result
    }

    async fn exchange(&mut self, command: &Command) -> Result<Response, Error> {
        proto::write_sentence(&mut self.stream, &command.words()).await?;

        let mut response = Response::default();
        let mut trap: Option<Error> = None;
        loop {
            let words = proto::read_sentence(&mut self.stream).await?;
            match Reply::parse(&words)? {
                Reply::Re(record) => response.records.push(record),
                Reply::Trap(record) => {
                    if trap.is_none() {
                        trap = Some(Error::Trap {
                            message: record.get("message").unwrap_or_default().to_string(),
                            category: record.get("category").map(String::from),
                        });
                    }
                }
                Reply::Done(record) => {
                    response.done = record;
                    return match trap {
                        Some(err) => Err(err),
                        None => Ok(response),
                    };
                }
                Reply::Fatal(message) => return Err(Error::Fatal(message)),
            }
        }
    }

    /// Politely end the session. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        if !self.broken {
            let quit = Command::new("/quit");
            if let Err(e) = proto::write_sentence(&mut self.stream, &quit.words()).await {
                trace!(error = %e, "quit failed");
            }
        }
        debug!(address = %self.address, "device session closed");
    }
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("address", &self.address)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}
