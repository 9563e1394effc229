//! SSH Pool: at most N live sessions keyed by `(host, port, user)`,
//! with idle eviction and health checks. `ssh2`'s `Session` is synchronous,
//! so every dial/exec runs inside `spawn_blocking` — the same pattern the
//! libvirt provider uses for its C bindings.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ssh2::Session;
use tokio::sync::Mutex;

use crate::error::RangeError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Authentication precedence: explicit key path, then explicit
/// password, then agent/default keys. Missing all three is a hard error
/// raised before dialling.
#[derive(Debug, Clone)]
pub enum Credentials {
    KeyPath(std::path::PathBuf),
    Password(String),
    Agent,
}

#[derive(Debug, Clone)]
pub struct Dial {
    pub key: SessionKey,
    pub creds: Credentials,
}

struct PooledSession {
    session: Arc<Session>,
    last_used: Instant,
}

pub struct SshPool {
    max_connections: usize,
    idle_timeout: Duration,
    sessions: Mutex<HashMap<SessionKey, PooledSession>>,
    dial_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
}

impl SshPool {
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            max_connections,
            idle_timeout,
            sessions: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns an existing healthy session, or dials a new one. Per-key
    /// dial locks make concurrent `Get` calls for different keys
    /// independent while serialising dials for the same key.
    pub async fn get(&self, dial: &Dial) -> Result<Arc<Session>, RangeError> {
        if let Some(session) = self.try_existing(&dial.key).await {
            return Ok(session);
        }

        let lock = {
            let mut locks = self.dial_locks.lock().await;
            locks
                .entry(dial.key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        if let Some(session) = self.try_existing(&dial.key).await {
            return Ok(session);
        }

        {
            let sessions = self.sessions.lock().await;
            if sessions.len() >= self.max_connections {
                return Err(RangeError::Ssh {
                    host: dial.key.host.clone(),
                    message: "SSH pool is full".into(),
                    retryable: true,
                });
            }
        }

        let session = dial_session(dial).await?;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(
            dial.key.clone(),
            PooledSession {
                session: session.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(session)
    }

    async fn try_existing(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(pooled) = sessions.get_mut(key) {
            if health_check(pooled.session.clone()).await {
                pooled.last_used = Instant::now();
                return Some(pooled.session.clone());
            }
            sessions.remove(key);
        }
        None
    }

    pub async fn close(&self, key: &SessionKey) {
        self.sessions.lock().await.remove(key);
    }

    pub async fn close_all(&self) {
        self.sessions.lock().await.clear();
    }

    /// Evicts sessions unused beyond the idle timeout. Intended to be
    /// driven by a background sweeper task owned by the orchestrator.
    pub async fn sweep_idle(&self) {
        let deadline = self.idle_timeout;
        let mut sessions = self.sessions.lock().await;
        sessions.retain(|_, pooled| pooled.last_used.elapsed() < deadline);
    }
}

async fn dial_session(dial: &Dial) -> Result<Arc<Session>, RangeError> {
    let dial = dial.clone();
    tokio::task::spawn_blocking(move || -> Result<Arc<Session>, RangeError> {
        let addr = format!("{}:{}", dial.key.host, dial.key.port);
        let tcp = TcpStream::connect(&addr).map_err(|e| RangeError::Ssh {
            host: dial.key.host.clone(),
            message: format!("TCP dial failed: {e}"),
            retryable: true,
        })?;
        let mut session = Session::new().map_err(|e| RangeError::Ssh {
            host: dial.key.host.clone(),
            message: format!("failed to create session: {e}"),
            retryable: false,
        })?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| RangeError::Ssh {
            host: dial.key.host.clone(),
            message: format!("handshake failed: {e}"),
            retryable: true,
        })?;

        // Host-key policy: accept-and-record, documented as lab-only.
        authenticate(&session, &dial.key.user, &dial.creds)?;

        Ok(Arc::new(session))
    })
    .await
    .map_err(|e| RangeError::Internal {
        operation: "ssh_dial".into(),
        message: e.to_string(),
    })?
}

fn authenticate(session: &Session, user: &str, creds: &Credentials) -> Result<(), RangeError> {
    let result = match creds {
        Credentials::KeyPath(path) => session.userauth_pubkey_file(user, None, path, None),
        Credentials::Password(password) => session.userauth_password(user, password),
        Credentials::Agent => session.userauth_agent(user),
    };
    result.map_err(|e| RangeError::Ssh {
        host: user.to_string(),
        message: format!("authentication failed: {e}"),
        retryable: false,
    })
}

/// Issues a trivial command with a short timeout; a dead session is
/// reported unhealthy rather than propagating its error.
async fn health_check(session: Arc<Session>) -> bool {
    tokio::task::spawn_blocking(move || -> bool {
        session.set_timeout(3000);
        let result = (|| -> Result<(), ssh2::Error> {
            let mut channel = session.channel_session()?;
            channel.exec("echo cyris-health")?;
            channel.wait_close()?;
            Ok(())
        })();
        session.set_timeout(0);
        result.is_ok()
    })
    .await
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_display() {
        let key = SessionKey {
            host: "10.0.0.5".into(),
            port: 22,
            user: "ubuntu".into(),
        };
        assert_eq!(key.to_string(), "ubuntu@10.0.0.5:22");
    }

    #[tokio::test]
    async fn pool_full_rejects_new_dials() {
        let pool = SshPool::new(0, Duration::from_secs(60));
        let dial = Dial {
            key: SessionKey {
                host: "10.0.0.5".into(),
                port: 22,
                user: "ubuntu".into(),
            },
            creds: Credentials::Agent,
        };
        let err = pool.get(&dial).await.unwrap_err();
        assert!(matches!(err, RangeError::Ssh { retryable: true, .. }));
    }
}
