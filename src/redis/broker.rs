//! Broker connections and the lifecycle of a self-managed `redis-server`.

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use redis::{Client, Connection, RedisResult};
use tempfile::TempDir;

use crate::config::RedisConfig;
use crate::core::backoff;
use crate::error::TransportError;

const READY_POLL: Duration = Duration::from_millis(50);
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// A broker connection that reconnects on transient failures.
pub struct BrokerConnection {
    client: Client,
    con: Connection,
    max_retries: usize,
}

impl BrokerConnection {
    /// Opens a connection, failing with [`TransportError::Unreachable`] if the
    /// broker does not answer.
    pub fn connect(config: &RedisConfig) -> Result<Self, TransportError> {
        let url = config.url();
        let client = Client::open(url.as_str())
            .map_err(|e| TransportError::Unreachable(format!("invalid broker url {url}: {e}")))?;
        let con = client
            .get_connection()
            .map_err(|e| TransportError::Unreachable(format!("cannot reach broker at {url}: {e}")))?;
        Ok(Self {
            client,
            con,
            max_retries: config.max_retries,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.con = self.client.get_connection()?;
        Ok(())
    }

    /// Runs an idempotent operation, reconnecting and retrying on transient failures.
    pub fn run<T>(
        &mut self,
        mut op: impl FnMut(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, TransportError> {
        let mut attempt = 0;
        loop {
            let err = match op(&mut self.con) {
                Ok(value) => return Ok(value),
                Err(err) => TransportError::from(err),
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                return Err(TransportError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: Box::new(err),
                });
            }
            attempt += 1;
            log::warn!("broker command failed ({err}), reconnecting (retry {attempt})");
            thread::sleep(backoff(attempt));
            if let Err(e) = self.reconnect() {
                log::debug!("reconnect failed: {e}");
            }
        }
    }

    /// Runs a non-idempotent operation exactly once. A transient failure
    /// still triggers a reconnect so the next call starts clean.
    pub fn run_once<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> RedisResult<T>,
    ) -> Result<T, TransportError> {
        op(&mut self.con).map_err(|err| {
            let err = TransportError::from(err);
            if err.is_transient() && self.reconnect().is_err() {
                log::debug!("reconnect after failed script call did not succeed");
            }
            err
        })
    }

    pub fn ping(&mut self) -> Result<(), TransportError> {
        self.run(|con| redis::cmd("PING").query::<String>(con))
            .map(|_| ())
    }
}

/// A private `redis-server` child process listening on localhost.
///
/// The server keeps no snapshot or append-only file and works inside a
/// temporary directory that is removed with it.
pub struct BrokerProcess {
    child: Option<Child>,
    port: u16,
    _dir: TempDir,
}

/// Asks the OS for a port that is free right now.
fn free_port() -> Result<u16, TransportError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

impl BrokerProcess {
    /// Launches `config.redis_server` and waits until it answers `PING`.
    pub fn start(config: &RedisConfig) -> Result<Self, TransportError> {
        let port = if config.port == 0 {
            free_port()?
        } else {
            config.port
        };
        let dir = tempfile::tempdir()?;
        let child = Command::new(&config.redis_server)
            .arg("--port")
            .arg(port.to_string())
            .args(["--bind", "127.0.0.1", "--save", "", "--appendonly", "no"])
            .arg("--dir")
            .arg(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TransportError::Unreachable(format!("cannot launch {}: {e}", config.redis_server))
            })?;
        let mut broker = Self {
            child: Some(child),
            port,
            _dir: dir,
        };

        let ready_check = RedisConfig {
            host: "127.0.0.1".to_string(),
            port,
            max_retries: 0,
            ..config.clone()
        };
        for _ in 0..config.connect_attempts {
            if let Ok(mut con) = BrokerConnection::connect(&ready_check) {
                if con.ping().is_ok() {
                    log::info!("started redis broker on port {port}");
                    return Ok(broker);
                }
            }
            let exited = broker
                .child
                .as_mut()
                .and_then(|c| c.try_wait().ok().flatten());
            if let Some(status) = exited {
                broker.child = None;
                return Err(TransportError::Unreachable(format!(
                    "redis-server exited during startup with {status}"
                )));
            }
            thread::sleep(READY_POLL);
        }
        broker.stop();
        Err(TransportError::Unreachable(format!(
            "redis-server on port {port} did not become ready"
        )))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Shuts the server down. Safe to call repeatedly; failures are logged.
    pub fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let url = format!("redis://127.0.0.1:{}/", self.port);
        if let Ok(client) = Client::open(url.as_str()) {
            if let Ok(mut con) = client.get_connection() {
                // the server drops the connection instead of replying
                let _: RedisResult<()> = redis::cmd("SHUTDOWN").arg("NOSAVE").query(&mut con);
            }
        }

        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() < deadline => thread::sleep(READY_POLL),
                Ok(None) => {
                    log::warn!("redis-server on port {} ignored SHUTDOWN, killing it", self.port);
                    if let Err(e) = child.kill() {
                        log::warn!("cannot kill redis-server: {e}");
                    }
                    if let Err(e) = child.wait() {
                        log::warn!("cannot reap redis-server: {e}");
                    }
                    break;
                }
                Err(e) => {
                    log::warn!("cannot query redis-server status: {e}");
                    break;
                }
            }
        }
        log::info!("stopped redis broker on port {}", self.port);
    }
}

impl Drop for BrokerProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Whether a `redis-server` executable can be launched from `PATH`.
pub fn redis_server_available(executable: &str) -> bool {
    Command::new(executable)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}
