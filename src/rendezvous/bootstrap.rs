//! Bootstrap orchestration.
//!
//! A bootstrap attempt walks the session through
//!
//! ```text
//! Created -> PortAllocated -> Listening -> StartRequested -> Connected
//! ```
//!
//! or ends in `Failed` from any step. The listener is always opened before the launcher is asked
//! to start the server, otherwise the server could dial an address nobody listens on yet.

use std::{future::Future, net::SocketAddr, pin::pin, time::Duration};

use futures::{select_biased, FutureExt};
use tracing::{debug, info, warn};

use crate::{
    cancellation::CancellationToken,
    config::BootstrapConfig,
    error::{BootstrapError, BootstrapStep},
    launch::{LauncherRegistry, ResolvedLauncher},
    port::PortAllocator,
    rendezvous::{listener::RendezvousListener, stream::DuplexStream},
};

/// State of a bootstrap session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    PortAllocated,
    Listening,
    StartRequested,
    Connected,
    Failed,
}

impl SessionState {
    fn successor(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::PortAllocated),
            Self::PortAllocated => Some(Self::Listening),
            Self::Listening => Some(Self::StartRequested),
            Self::StartRequested => Some(Self::Connected),
            Self::Connected | Self::Failed => None,
        }
    }
}

/// One bootstrap attempt.
///
/// Every attempt gets its own session, hence its own port and listener.
#[derive(Debug)]
pub struct BootstrapSession {
    label: String,
    port: Option<u16>,
    address: Option<SocketAddr>,
    state: SessionState,
}

impl BootstrapSession {
    /// Creates a session for a server of kind `label`.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            port: None,
            address: None,
            state: SessionState::Created,
        }
    }

    /// Allocated port, once past `PortAllocated`.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Listening address, once past `Listening`.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert_eq!(self.state.successor(), Some(next));
        debug!(label = %self.label, from = ?self.state, to = ?next, "Session transition");
        self.state = next;
    }

    fn fail(&mut self, err: &BootstrapError) {
        warn!(label = %self.label, from = ?self.state, step = %err.step(), %err, "Bootstrap failed");
        self.state = SessionState::Failed;
    }
}

/// Runs bootstrap attempts against a resolved launcher.
#[derive(Debug)]
pub struct ConnectionBootstrapper<P> {
    allocator: P,
    launcher: ResolvedLauncher,
    connect_timeout: Duration,
}

impl<P> ConnectionBootstrapper<P> {
    /// Name of the launcher in use.
    pub fn launcher_name(&self) -> &str {
        self.launcher.name()
    }

    /// Time given to the server to dial back.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl<P> ConnectionBootstrapper<P>
where
    P: PortAllocator,
{
    /// Creates a bootstrapper.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] if `connect_timeout` is zero.
    pub fn new(
        allocator: P,
        launcher: ResolvedLauncher,
        connect_timeout: Duration,
    ) -> Result<Self, BootstrapError> {
        if connect_timeout.is_zero() {
            return Err(BootstrapError::Config(
                "connect timeout must be greater than zero".to_owned(),
            ));
        }
        Ok(Self {
            allocator,
            launcher,
            connect_timeout,
        })
    }

    /// Creates a bootstrapper, resolving the launcher named by the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Config`] for an invalid configuration and
    /// [`BootstrapError::LauncherMissing`] if the launcher is not registered.
    pub fn from_registry(
        allocator: P,
        registry: &LauncherRegistry,
        config: &BootstrapConfig,
    ) -> Result<Self, BootstrapError> {
        config.validate()?;
        let launcher = registry.resolve(&config.launcher_capability)?;
        Self::new(allocator, launcher, config.connect_timeout())
    }

    /// Runs a fresh session for a server of kind `label`.
    ///
    /// # Errors
    ///
    /// See [`ConnectionBootstrapper::run`].
    pub async fn bootstrap(
        &self,
        label: &str,
        cancellation: &CancellationToken,
    ) -> Result<DuplexStream, BootstrapError> {
        let mut session = BootstrapSession::new(label);
        self.run(&mut session, cancellation).await
    }

    /// Drives `session` until the server is connected or a step fails.
    ///
    /// The listening socket never outlives this call, whatever the outcome.
    ///
    /// # Errors
    ///
    /// Fails with the error of the first failing step, with [`BootstrapError::Cancelled`] if
    /// `cancellation` fires first, or with [`BootstrapError::Config`] if the session already ran.
    pub async fn run(
        &self,
        session: &mut BootstrapSession,
        cancellation: &CancellationToken,
    ) -> Result<DuplexStream, BootstrapError> {
        if session.state != SessionState::Created {
            return Err(BootstrapError::Config(format!(
                "session already ran ({:?})",
                session.state
            )));
        }

        match self.drive(session, cancellation).await {
            Ok(stream) => {
                session.advance(SessionState::Connected);
                info!(
                    address = ?session.address,
                    peer = %stream.peer_addr(),
                    "Connected to language server"
                );
                Ok(stream)
            }
            Err(err) => {
                session.fail(&err);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: &mut BootstrapSession,
        cancellation: &CancellationToken,
    ) -> Result<DuplexStream, BootstrapError> {
        info!(label = %session.label, "Finding open port for language server");
        let port = until_cancelled(
            cancellation,
            BootstrapStep::AllocatePort,
            self.allocator.allocate(),
        )
        .await?;
        session.port = Some(port);
        session.advance(SessionState::PortAllocated);

        let listener = until_cancelled(
            cancellation,
            BootstrapStep::Listen,
            RendezvousListener::open(port),
        )
        .await?;
        let address = listener.local_addr();
        session.address = Some(address);
        session.advance(SessionState::Listening);

        if cancellation.is_cancelled() {
            return Err(BootstrapError::Cancelled {
                step: BootstrapStep::RequestStart,
            });
        }
        let report = self.launcher.request_start(&session.label, address);
        session.advance(SessionState::StartRequested);

        let mut accept = pin!(listener
            .await_connection(Some(self.connect_timeout))
            .fuse());
        let mut report = report.fuse();
        let mut cancelled = pin!(cancellation.cancelled().fuse());
        loop {
            select_biased! {
                () = cancelled => {
                    return Err(BootstrapError::Cancelled {
                        step: BootstrapStep::AwaitConnection,
                    });
                }
                conn = accept => return conn,
                outcome = report => match outcome {
                    Ok(()) => debug!(%address, "Launcher accepted start request"),
                    Err(source) => return Err(BootstrapError::RemoteStart { address, source }),
                },
            }
        }
    }
}

async fn until_cancelled<T, F>(
    cancellation: &CancellationToken,
    step: BootstrapStep,
    step_future: F,
) -> Result<T, BootstrapError>
where
    F: Future<Output = Result<T, BootstrapError>>,
{
    let mut step_future = pin!(step_future.fuse());
    let mut cancelled = pin!(cancellation.cancelled().fuse());
    select_biased! {
        () = cancelled => Err(BootstrapError::Cancelled { step }),
        res = step_future => res,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::{
        future::Future,
        io::Write,
        net::{Ipv4Addr, TcpListener, TcpStream},
        rc::Rc,
        sync::{Arc, Mutex},
        time::Duration,
    };

    use assert_matches::assert_matches;
    use async_io::Timer;
    use futures::{executor::LocalPool, select, task::LocalSpawnExt, AsyncReadExt, FutureExt};

    use super::*;
    use crate::{
        launch::{
            callback::CallbackLauncher, dummy::DummyLauncher, LaunchError, LaunchReport,
            RemoteLauncher,
        },
        port::{EphemeralPort, PortRange},
    };

    const LAUNCHER: &str = "test-launcher";

    type Journal = Arc<Mutex<Vec<String>>>;

    fn run<T>(job: impl Future<Output = T>) -> T {
        let mut exec = LocalPool::new();

        let res = exec.run_until(async {
            let timeout = Timer::after(Duration::from_secs(5));

            select! {
                a = job.fuse() => a,
                _ = timeout.fuse() => panic!("Test timeout"),
            }
        });

        exec.run();

        res
    }

    fn free_port() -> u16 {
        futures::executor::block_on(EphemeralPort.allocate()).unwrap()
    }

    /// Allocator answering with a fixed port and logging its calls.
    struct FixedPort {
        port: u16,
        journal: Journal,
    }

    impl PortAllocator for FixedPort {
        async fn allocate(&self) -> Result<u16, BootstrapError> {
            self.journal.lock().unwrap().push("allocate".to_owned());
            Ok(self.port)
        }
    }

    /// Allocator which never answers in time.
    struct StalledPort;

    impl PortAllocator for StalledPort {
        async fn allocate(&self) -> Result<u16, BootstrapError> {
            Timer::after(Duration::from_secs(60)).await;
            Ok(0)
        }
    }

    /// Allocator tearing the session down right after answering.
    struct CancellingPort {
        port: u16,
        token: CancellationToken,
    }

    impl PortAllocator for CancellingPort {
        async fn allocate(&self) -> Result<u16, BootstrapError> {
            self.token.cancel();
            Ok(self.port)
        }
    }

    #[derive(Clone)]
    enum Behavior {
        Dial(Vec<u8>),
        Ignore,
        Fail(&'static str),
    }

    /// Launcher logging its calls, and whether the listener was up when called.
    #[derive(Clone)]
    struct RecordingLauncher {
        behavior: Behavior,
        journal: Journal,
    }

    impl RemoteLauncher for RecordingLauncher {
        fn start_server(&self, kind: &str, address: &str) -> LaunchReport {
            // Bind, not connect: a connect would be the accepted connection.
            let listening = TcpListener::bind(address).is_err();
            self.journal
                .lock()
                .unwrap()
                .push(format!("start {kind} {address} listening={listening}"));
            match &self.behavior {
                Behavior::Dial(payload) => {
                    let address = address.to_owned();
                    let payload = payload.clone();
                    std::thread::spawn(move || {
                        let mut stream = TcpStream::connect(address).unwrap();
                        stream.write_all(&payload).unwrap();
                    });
                    LaunchReport::accepted()
                }
                Behavior::Ignore => LaunchReport::detached(),
                Behavior::Fail(message) => LaunchReport::failed(LaunchError::new(*message)),
            }
        }
    }

    fn bootstrapper<P: PortAllocator>(
        allocator: P,
        behavior: Behavior,
        journal: &Journal,
        timeout: Duration,
    ) -> ConnectionBootstrapper<P> {
        let mut registry = LauncherRegistry::new();
        registry.register(
            LAUNCHER,
            RecordingLauncher {
                behavior,
                journal: journal.clone(),
            },
        );
        let config = BootstrapConfig {
            launcher_capability: LAUNCHER.to_owned(),
            ..BootstrapConfig::default()
        }
        .with_connect_timeout(timeout);
        ConnectionBootstrapper::from_registry(allocator, &registry, &config).unwrap()
    }

    fn launcher_calls(journal: &Journal) -> usize {
        journal
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.starts_with("start"))
            .count()
    }

    #[test]
    fn test_connects_and_round_trips_bytes() {
        let _ports = crate::tests::PORT_REUSE_TEST_MUTEX.lock();
        let port = free_port();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            FixedPort {
                port,
                journal: journal.clone(),
            },
            Behavior::Dial(vec![0x01, 0x02]),
            &journal,
            Duration::from_secs(5),
        );

        let mut session = BootstrapSession::new("R");
        let token = CancellationToken::new();
        let stream = run(bootstrapper.run(&mut session, &token)).unwrap();
        journal.lock().unwrap().push("accepted".to_owned());

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.port(), Some(port));
        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "allocate".to_owned(),
                format!("start R 127.0.0.1:{port} listening=true"),
                "accepted".to_owned(),
            ]
        );

        let mut transport = stream.into_transport();
        let mut buf = [0u8; 2];
        run(transport.reader.read_exact(&mut buf)).unwrap();
        assert_eq!(buf, [0x01, 0x02]);

        // The listener is closed once the connection is handed over.
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn test_port_exhaustion_never_requests_start() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            PortRange::new(port, port).unwrap(),
            Behavior::Dial(vec![0x01]),
            &journal,
            Duration::from_secs(5),
        );

        let mut session = BootstrapSession::new("R");
        let res = run(bootstrapper.run(&mut session, &CancellationToken::new()));

        assert_matches!(res, Err(BootstrapError::PortExhaustion { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.port(), None);
        assert_eq!(session.address(), None);
        assert_eq!(launcher_calls(&journal), 0);
    }

    #[test]
    fn test_bind_failure_never_requests_start() {
        let busy = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            FixedPort {
                port,
                journal: journal.clone(),
            },
            Behavior::Dial(vec![0x01]),
            &journal,
            Duration::from_secs(5),
        );

        let mut session = BootstrapSession::new("R");
        let res = run(bootstrapper.run(&mut session, &CancellationToken::new()));

        assert_matches!(res, Err(BootstrapError::Bind { address, .. }) if address.port() == port);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.port(), Some(port));
        assert_eq!(launcher_calls(&journal), 0);
    }

    #[test]
    fn test_timeout_closes_listener() {
        let _ports = crate::tests::PORT_REUSE_TEST_MUTEX.lock();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            EphemeralPort,
            Behavior::Ignore,
            &journal,
            Duration::from_millis(50),
        );

        let mut session = BootstrapSession::new("R");
        let res = run(bootstrapper.run(&mut session, &CancellationToken::new()));

        assert_matches!(
            res,
            Err(BootstrapError::ConnectTimeout { timeout, .. }) if timeout == Duration::from_millis(50)
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(launcher_calls(&journal), 1);

        let address = session.address().unwrap();
        assert!(TcpStream::connect(address).is_err());
        TcpListener::bind(address).unwrap();
    }

    #[test]
    fn test_launch_failure_ends_before_timeout() {
        let _ports = crate::tests::PORT_REUSE_TEST_MUTEX.lock();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            EphemeralPort,
            Behavior::Fail("R is not installed"),
            &journal,
            Duration::from_secs(60),
        );

        let mut session = BootstrapSession::new("R");
        let res = run(bootstrapper.run(&mut session, &CancellationToken::new()));

        assert_matches!(
            res,
            Err(BootstrapError::RemoteStart { source, .. }) if source.message() == "R is not installed"
        );
        assert_eq!(session.state(), SessionState::Failed);
        TcpListener::bind(session.address().unwrap()).unwrap();
    }

    #[test]
    fn test_cancel_twice_releases_listener() {
        let _ports = crate::tests::PORT_REUSE_TEST_MUTEX.lock();
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            EphemeralPort,
            Behavior::Ignore,
            &journal,
            Duration::from_secs(60),
        );

        let mut session = BootstrapSession::new("R");
        let token = CancellationToken::new();
        let (res, cancelled) = run(async {
            let cancel = async {
                Timer::after(Duration::from_millis(20)).await;
                (token.cancel(), token.cancel())
            };
            futures::join!(bootstrapper.run(&mut session, &token), cancel)
        });

        assert_eq!(cancelled, (true, false));
        assert_matches!(
            res,
            Err(BootstrapError::Cancelled {
                step: BootstrapStep::AwaitConnection
            })
        );
        assert_eq!(session.state(), SessionState::Failed);
        TcpListener::bind(session.address().unwrap()).unwrap();
    }

    #[test]
    fn test_cancelled_before_start_allocates_nothing() {
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            FixedPort {
                port: free_port(),
                journal: journal.clone(),
            },
            Behavior::Ignore,
            &journal,
            Duration::from_secs(60),
        );

        let token = CancellationToken::new();
        token.cancel();
        let res = run(bootstrapper.bootstrap("R", &token));

        assert_matches!(
            res,
            Err(BootstrapError::Cancelled {
                step: BootstrapStep::AllocatePort
            })
        );
        assert!(journal.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_while_allocating_never_requests_start() {
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            StalledPort,
            Behavior::Dial(vec![0x01]),
            &journal,
            Duration::from_secs(60),
        );

        let mut session = BootstrapSession::new("R");
        let token = CancellationToken::new();
        let (res, ()) = run(async {
            let cancel = async {
                Timer::after(Duration::from_millis(20)).await;
                token.cancel();
            };
            futures::join!(bootstrapper.run(&mut session, &token), cancel)
        });

        assert_matches!(
            res,
            Err(BootstrapError::Cancelled {
                step: BootstrapStep::AllocatePort
            })
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.port(), None);
        assert_eq!(launcher_calls(&journal), 0);
        assert_eq!(token.waiter_count(), 0);
    }

    #[test]
    fn test_cancel_after_allocation_never_listens() {
        let journal = Journal::default();
        let token = CancellationToken::new();
        let bootstrapper = bootstrapper(
            CancellingPort {
                port: free_port(),
                token: token.clone(),
            },
            Behavior::Dial(vec![0x01]),
            &journal,
            Duration::from_secs(60),
        );

        let mut session = BootstrapSession::new("R");
        let res = run(bootstrapper.run(&mut session, &token));

        assert_matches!(
            res,
            Err(BootstrapError::Cancelled {
                step: BootstrapStep::Listen
            })
        );
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.port().is_some());
        assert_eq!(session.address(), None);
        assert_eq!(launcher_calls(&journal), 0);
    }

    #[test]
    fn test_finished_sessions_release_cancellation_wakers() {
        let _ports = crate::tests::PORT_REUSE_TEST_MUTEX.lock();
        let journal = Journal::default();
        let bootstrapper = Rc::new(bootstrapper(
            EphemeralPort,
            Behavior::Ignore,
            &journal,
            Duration::from_millis(5),
        ));
        let token = CancellationToken::new();

        let mut exec = LocalPool::new();
        let spawner = exec.spawner();
        for _ in 0..50 {
            let bootstrapper = Rc::clone(&bootstrapper);
            let token = token.clone();
            spawner
                .spawn_local(async move {
                    assert_matches!(
                        bootstrapper.bootstrap("R", &token).await,
                        Err(BootstrapError::ConnectTimeout { .. })
                    );
                })
                .unwrap();
        }
        exec.run();

        assert_eq!(launcher_calls(&journal), 50);
        assert_eq!(token.waiter_count(), 0);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_session_runs_once() {
        let journal = Journal::default();
        let bootstrapper = bootstrapper(
            EphemeralPort,
            Behavior::Ignore,
            &journal,
            Duration::from_millis(10),
        );

        let mut session = BootstrapSession::new("R");
        let token = CancellationToken::new();
        assert!(run(bootstrapper.run(&mut session, &token)).is_err());
        assert_matches!(
            run(bootstrapper.run(&mut session, &token)),
            Err(BootstrapError::Config(_))
        );
        assert_eq!(launcher_calls(&journal), 1);
    }

    #[test]
    fn test_missing_launcher() {
        let registry = LauncherRegistry::new();
        assert_matches!(
            ConnectionBootstrapper::from_registry(
                EphemeralPort,
                &registry,
                &BootstrapConfig::default()
            ),
            Err(BootstrapError::LauncherMissing { .. })
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut registry = LauncherRegistry::new();
        registry.register(LAUNCHER, DummyLauncher);
        let launcher = registry.resolve(LAUNCHER).unwrap();
        assert_matches!(
            ConnectionBootstrapper::new(EphemeralPort, launcher, Duration::ZERO),
            Err(BootstrapError::Config(_))
        );
    }

    #[test]
    fn test_concurrent_sessions_use_distinct_ports() {
        let mut registry = LauncherRegistry::new();
        registry.register(
            LAUNCHER,
            CallbackLauncher::new(|_kind: &str, address: &str| {
                let address = address.to_owned();
                std::thread::spawn(move || {
                    let _stream = TcpStream::connect(address).unwrap();
                });
                LaunchReport::detached()
            }),
        );
        let config = BootstrapConfig {
            launcher_capability: LAUNCHER.to_owned(),
            ..BootstrapConfig::default()
        };
        let bootstrapper =
            ConnectionBootstrapper::from_registry(EphemeralPort, &registry, &config).unwrap();

        let token = CancellationToken::new();
        let mut first = BootstrapSession::new("R");
        let mut second = BootstrapSession::new("Python");
        let (a, b) = run(async {
            futures::join!(
                bootstrapper.run(&mut first, &token),
                bootstrapper.run(&mut second, &token)
            )
        });

        a.unwrap();
        b.unwrap();
        assert_ne!(first.port(), second.port());
        assert_eq!(first.state(), SessionState::Connected);
        assert_eq!(second.state(), SessionState::Connected);
    }
}
