//! Bounded connection pool with per-command leases.
//!
//! A command leases a connection for its whole duration; connections
//! are never shared between concurrent commands. On release the
//! connection is health-checked with a cheap echo and dropped if the
//! check fails, so a broken session never serves a second command.

use crate::{
    error::OperationTimeoutSnafu,
    session::{CommandOutput, Connector, Transport},
    RdsError,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::Semaphore;

pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    max_connections: usize,
    acquire_timeout: Duration,
    command_timeout: Duration,
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<C::Conn>>,
    closed: AtomicBool,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(
        connector: C,
        max_connections: usize,
        acquire_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                max_connections,
                acquire_timeout,
                command_timeout,
                semaphore: Arc::new(Semaphore::new(max_connections)),
                idle: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Lease a connection, run one command on the blocking pool, and
    /// return the connection on success. The lease permit is released
    /// by the blocking task itself, so a command that outlives its
    /// watchdog keeps its slot occupied until it actually finishes
    /// instead of letting callers pile onto a stuck appliance.
    pub async fn execute(
        &self,
        command: String,
    ) -> Result<CommandOutput, RdsError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RdsError::PoolClosed {});
        }

        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| RdsError::ResourceExhausted {
            text: format!(
                "no appliance connection available within {:?}",
                self.inner.acquire_timeout
            ),
        })?
        .map_err(|_| RdsError::PoolClosed {})?;

        let inner = self.inner.clone();
        let command_timeout = inner.command_timeout;

        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;

            let mut conn = match inner.idle.lock().pop() {
                Some(conn) => conn,
                None => inner.connector.connect()?,
            };

            let result = conn.exec(&command);

            let keep = result.is_ok()
                && !inner.closed.load(Ordering::SeqCst)
                && conn.healthy();
            if keep {
                inner.idle.lock().push(conn);
            }
            result
        });

        // watchdog over connect + exec; the blocking task cannot be
        // cancelled, it is simply abandoned together with its session
        match tokio::time::timeout(
            command_timeout + self.inner.acquire_timeout,
            task,
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(RdsError::Transport {
                context: "command task".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Other,
                    join.to_string(),
                ),
            }),
            Err(_) => OperationTimeoutSnafu {
                text: format!(
                    "appliance command did not finish within {:?}",
                    command_timeout
                ),
            }
            .fail(),
        }
    }

    /// Stop handing out leases, drop idle connections, and wait up to
    /// `deadline` for in-flight commands to drain.
    pub async fn close(&self, deadline: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.idle.lock().clear();

        let drained = tokio::time::timeout(
            deadline,
            self.inner
                .semaphore
                .clone()
                .acquire_many_owned(self.inner.max_connections as u32),
        )
        .await;

        match drained {
            Ok(_) => info!("appliance connection pool drained"),
            Err(_) => warn!(
                "appliance connection pool closed with commands still in flight"
            ),
        }
        self.inner.semaphore.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    struct FakeConn {
        fail_next: bool,
    }

    impl Transport for FakeConn {
        fn exec(&mut self, command: &str) -> Result<CommandOutput, RdsError> {
            if self.fail_next {
                return Err(RdsError::Transport {
                    context: "exec".to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "eof",
                    ),
                });
            }
            if command == "sleep" {
                std::thread::sleep(Duration::from_millis(300));
            }
            Ok(CommandOutput {
                stdout: format!("ran: {}", command),
                exit_status: 0,
            })
        }

        fn healthy(&mut self) -> bool {
            !self.fail_next
        }
    }

    struct FakeConnector {
        connects: AtomicUsize,
        fail_exec: bool,
    }

    impl FakeConnector {
        fn new(fail_exec: bool) -> Self {
            Self {
                connects: AtomicUsize::new(0),
                fail_exec,
            }
        }
    }

    impl Connector for Arc<FakeConnector> {
        type Conn = FakeConn;

        fn connect(&self) -> Result<FakeConn, RdsError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn {
                fail_next: self.fail_exec,
            })
        }
    }

    fn pool(
        connector: Arc<FakeConnector>,
        max: usize,
        acquire: Duration,
        command: Duration,
    ) -> ConnectionPool<Arc<FakeConnector>> {
        ConnectionPool::new(connector, max, acquire, command)
    }

    #[tokio::test]
    async fn executes_and_reuses_connections() {
        let connector = Arc::new(FakeConnector::new(false));
        let p = pool(
            connector.clone(),
            2,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        let out = p.execute("a".to_string()).await.unwrap();
        assert_eq!(out.stdout, "ran: a");
        let _ = p.execute("b".to_string()).await.unwrap();

        // second command reuses the idle connection from the first
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_deadline_is_resource_exhausted() {
        let connector = Arc::new(FakeConnector::new(false));
        let p = pool(
            connector,
            1,
            Duration::from_millis(50),
            Duration::from_secs(2),
        );

        let busy = p.clone();
        let slow =
            tokio::spawn(async move { busy.execute("sleep".to_string()).await });
        // let the slow command take the only slot
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = p.execute("fast".to_string()).await.unwrap_err();
        assert_matches!(err, RdsError::ResourceExhausted { .. });
        let _ = slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn broken_connections_are_not_reused() {
        let connector = Arc::new(FakeConnector::new(true));
        let p = pool(
            connector.clone(),
            1,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        assert!(p.execute("a".to_string()).await.is_err());
        assert!(p.execute("b".to_string()).await.is_err());
        // each command had to dial a fresh connection
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_commands() {
        let connector = Arc::new(FakeConnector::new(false));
        let p = pool(
            connector,
            1,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        p.close(Duration::from_millis(100)).await;
        assert_matches!(
            p.execute("a".to_string()).await.unwrap_err(),
            RdsError::PoolClosed {}
        );
    }
}
