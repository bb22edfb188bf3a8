//! Control stream lifecycle for a single tunnel connection

use crate::error::ControlError;
use crate::fuse::ConnectedFuse;
use crate::observer::Observer;
use crate::rpc::{default_rpc_client_factory, ControlStream, RegistrationClient, RpcClientFactory};
use edgeline_proto::{ConnectionOptions, TunnelIdentity};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Grace period used when the caller has no opinion
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Where a handler is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStreamState {
    Idle,
    Registering,
    Connected,
    Unregistering,
    /// Registration failed; nothing was unregistered
    Failed,
    /// Unregistration finished. `graceful` is set when the shared shutdown
    /// trigger, not cancellation, ended the connection.
    Stopped { graceful: bool },
}

impl ControlStreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControlStreamState::Failed | ControlStreamState::Stopped { .. }
        )
    }
}

/// Registers one tunnel connection and drains it on shutdown
///
/// One handler exists per connection index. [`ControlStreamHandler::run`]
/// blocks for the lifetime of the connection.
pub struct ControlStreamHandler {
    observer: Arc<Observer>,
    connected_fuse: Arc<dyn ConnectedFuse>,
    identity: Arc<TunnelIdentity>,
    conn_index: u8,
    rpc_client_factory: RpcClientFactory,
    graceful_shutdown: CancellationToken,
    grace_period: Duration,
    state: watch::Sender<ControlStreamState>,
}

impl ControlStreamHandler {
    pub fn new(
        observer: Arc<Observer>,
        connected_fuse: Arc<dyn ConnectedFuse>,
        identity: Arc<TunnelIdentity>,
        conn_index: u8,
        graceful_shutdown: CancellationToken,
        grace_period: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ControlStreamState::Idle);
        Self {
            observer,
            connected_fuse,
            identity,
            conn_index,
            rpc_client_factory: default_rpc_client_factory(),
            graceful_shutdown,
            grace_period,
            state,
        }
    }

    /// Replace the production RPC client, e.g. with a test double
    pub fn with_rpc_client_factory(mut self, factory: RpcClientFactory) -> Self {
        self.rpc_client_factory = factory;
        self
    }

    pub fn conn_index(&self) -> u8 {
        self.conn_index
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Drive the connection's control stream until it is unregistered
    ///
    /// Registers the connection, fires the connected fuse, then waits for
    /// either `ctx` to be cancelled or the shared graceful-shutdown trigger.
    /// Whichever comes first, the connection is unregistered within the grace
    /// period before returning. Only a failed registration is an error.
    pub async fn run<S: ControlStream>(
        &self,
        ctx: &CancellationToken,
        stream: S,
        options: &ConnectionOptions,
    ) -> Result<(), ControlError> {
        let mut rpc_client = ReleaseOnDrop::new((self.rpc_client_factory)(Box::new(stream)));

        self.set_state(ControlStreamState::Registering);
        if let Err(e) = rpc_client
            .register_connection(ctx, &self.identity, options, self.conn_index, &self.observer)
            .await
        {
            drop(rpc_client);
            self.set_state(ControlStreamState::Failed);
            return Err(e);
        }
        self.set_state(ControlStreamState::Connected);
        self.connected_fuse.connected();

        // Unbiased: if both are ready either may win
        let graceful = tokio::select! {
            _ = ctx.cancelled() => false,
            _ = self.graceful_shutdown.cancelled() => true,
        };
        debug!(conn_index = self.conn_index, graceful, "Control stream stopping");

        self.set_state(ControlStreamState::Unregistering);
        self.observer.send_unregistering_event(self.conn_index);
        rpc_client
            .graceful_shutdown(ctx, self.grace_period)
            .await;
        self.observer.log_unregistered(self.conn_index);

        drop(rpc_client);
        self.set_state(ControlStreamState::Stopped { graceful });
        Ok(())
    }

    /// Whether the last run completed because of the graceful-shutdown trigger
    ///
    /// `false` both while running and after an abrupt stop, so this is not a
    /// "has finished" check; use [`ControlStreamHandler::state`] for that.
    pub fn is_gracefully_stopped(&self) -> bool {
        *self.state.borrow() == ControlStreamState::Stopped { graceful: true }
    }

    pub fn state(&self) -> ControlStreamState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ControlStreamState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ControlStreamState) {
        self.state.send_replace(state);
    }
}

/// Owns the RPC client for one run and releases it on every exit path,
/// including the run future being dropped mid-await
struct ReleaseOnDrop {
    client: Box<dyn RegistrationClient>,
}

impl ReleaseOnDrop {
    fn new(client: Box<dyn RegistrationClient>) -> Self {
        Self { client }
    }
}

impl Deref for ReleaseOnDrop {
    type Target = dyn RegistrationClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl DerefMut for ReleaseOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut()
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ConnectionEvent, EventKind};
    use crate::rpc::BoxedControlStream;
    use async_trait::async_trait;
    use edgeline_proto::{ClientInfo, ConnectionDetails, TunnelCredentials};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    const TEST_GRACE_PERIOD: Duration = Duration::from_secs(2);

    /// What the mock registration should do
    #[derive(Clone)]
    enum Registration {
        Accept,
        Reject(&'static str),
        /// Never answer; only cancellation gets out
        Hang,
    }

    /// Calls observed by mock clients, shared with the test
    #[derive(Default)]
    struct MockCalls {
        created: AtomicUsize,
        closed: AtomicUsize,
        graceful_shutdowns: Mutex<Vec<Duration>>,
        journal: Mutex<Vec<&'static str>>,
    }

    impl MockCalls {
        fn record(&self, entry: &'static str) {
            self.journal.lock().unwrap().push(entry);
        }

        fn journal(&self) -> Vec<&'static str> {
            self.journal.lock().unwrap().clone()
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }

        fn graceful_shutdowns(&self) -> Vec<Duration> {
            self.graceful_shutdowns.lock().unwrap().clone()
        }
    }

    struct MockRpcClient {
        registration: Registration,
        calls: Arc<MockCalls>,
        _stream: BoxedControlStream,
    }

    #[async_trait]
    impl RegistrationClient for MockRpcClient {
        async fn register_connection(
            &mut self,
            ctx: &CancellationToken,
            _identity: &TunnelIdentity,
            _options: &ConnectionOptions,
            _conn_index: u8,
            _observer: &Observer,
        ) -> Result<ConnectionDetails, ControlError> {
            self.calls.record("register");
            match self.registration {
                Registration::Accept => Ok(ConnectionDetails {
                    uuid: Uuid::new_v4(),
                    location: "test01".to_string(),
                    is_remotely_managed: false,
                }),
                Registration::Reject(reason) => Err(ControlError::RegistrationRejected {
                    reason: reason.to_string(),
                    retry_after: None,
                    permanent: false,
                }),
                Registration::Hang => {
                    ctx.cancelled().await;
                    Err(ControlError::Cancelled)
                }
            }
        }

        async fn graceful_shutdown(&mut self, _ctx: &CancellationToken, grace_period: Duration) {
            self.calls.record("graceful_shutdown");
            self.calls
                .graceful_shutdowns
                .lock()
                .unwrap()
                .push(grace_period);
        }

        fn close(&mut self) {
            self.calls.record("close");
            self.calls.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mock_factory(registration: Registration, calls: Arc<MockCalls>) -> RpcClientFactory {
        Arc::new(
            move |stream: BoxedControlStream| -> Box<dyn RegistrationClient> {
                calls.created.fetch_add(1, Ordering::SeqCst);
                Box::new(MockRpcClient {
                    registration: registration.clone(),
                    calls: calls.clone(),
                    _stream: stream,
                })
            },
        )
    }

    /// Fuse counting how often it was fired
    struct CountingFuse {
        fired: AtomicUsize,
        calls: Arc<MockCalls>,
    }

    impl ConnectedFuse for CountingFuse {
        fn connected(&self) {
            self.calls.record("connected");
            self.fired.fetch_add(1, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.fired.load(Ordering::SeqCst) > 0
        }
    }

    struct Fixture {
        calls: Arc<MockCalls>,
        fuse: Arc<CountingFuse>,
        observer: Arc<Observer>,
        identity: Arc<TunnelIdentity>,
        shutdown: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let calls = Arc::new(MockCalls::default());
            Self {
                fuse: Arc::new(CountingFuse {
                    fired: AtomicUsize::new(0),
                    calls: calls.clone(),
                }),
                calls,
                observer: Arc::new(Observer::new()),
                identity: Arc::new(TunnelIdentity::new(
                    TunnelCredentials {
                        account_tag: "acct".to_string(),
                        tunnel_secret: vec![0; 32],
                        tunnel_id: Uuid::new_v4(),
                    },
                    ClientInfo::default(),
                )),
                shutdown: CancellationToken::new(),
            }
        }

        fn handler(&self, conn_index: u8, registration: Registration) -> Arc<ControlStreamHandler> {
            Arc::new(
                ControlStreamHandler::new(
                    self.observer.clone(),
                    self.fuse.clone(),
                    self.identity.clone(),
                    conn_index,
                    self.shutdown.clone(),
                    TEST_GRACE_PERIOD,
                )
                .with_rpc_client_factory(mock_factory(registration, self.calls.clone())),
            )
        }

        fn options(&self) -> ConnectionOptions {
            ConnectionOptions::new(self.identity.client.clone())
        }

        fn fired(&self) -> usize {
            self.fuse.fired.load(Ordering::SeqCst)
        }
    }

    fn spawn_run(
        handler: Arc<ControlStreamHandler>,
        ctx: CancellationToken,
        options: ConnectionOptions,
    ) -> tokio::task::JoinHandle<Result<(), ControlError>> {
        tokio::spawn(async move {
            let (stream, _peer) = tokio::io::duplex(64);
            handler.run(&ctx, stream, &options).await
        })
    }

    async fn wait_for_state(handler: &ControlStreamHandler, state: ControlStreamState) {
        let mut rx = handler.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_abruptly() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Accept);
        let ctx = CancellationToken::new();

        let task = spawn_run(handler.clone(), ctx.clone(), fixture.options());
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();

        assert!(task.await.unwrap().is_ok());
        assert!(!handler.is_gracefully_stopped());
        assert_eq!(
            handler.state(),
            ControlStreamState::Stopped { graceful: false }
        );
        assert_eq!(fixture.calls.created.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.calls.closed(), 1);
        assert_eq!(fixture.calls.graceful_shutdowns(), vec![TEST_GRACE_PERIOD]);
        assert_eq!(fixture.fired(), 1);
    }

    #[tokio::test]
    async fn test_registration_failure_is_returned() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Reject("registration refused"));

        let (stream, _peer) = tokio::io::duplex(64);
        let result = handler
            .run(&CancellationToken::new(), stream, &fixture.options())
            .await;

        match result {
            Err(ControlError::RegistrationRejected { reason, .. }) => {
                assert_eq!(reason, "registration refused")
            }
            other => panic!("Expected registration failure, got {:?}", other),
        }
        assert_eq!(fixture.fired(), 0);
        assert_eq!(fixture.calls.closed(), 1);
        assert!(fixture.calls.graceful_shutdowns().is_empty());
        assert_eq!(fixture.calls.journal(), vec!["register", "close"]);
        assert_eq!(handler.state(), ControlStreamState::Failed);
        assert!(!handler.is_gracefully_stopped());
    }

    #[tokio::test]
    async fn test_shutdown_trigger_stops_gracefully() {
        let fixture = Fixture::new();
        let handler = fixture.handler(4, Registration::Accept);
        let mut events = fixture.observer.subscribe();
        let ctx = CancellationToken::new();

        let task = spawn_run(handler.clone(), ctx.clone(), fixture.options());
        wait_for_state(&handler, ControlStreamState::Connected).await;
        fixture.shutdown.cancel();

        assert!(task.await.unwrap().is_ok());
        ctx.cancel();

        assert!(handler.is_gracefully_stopped());
        assert_eq!(
            fixture.calls.graceful_shutdowns(),
            vec![Duration::from_secs(2)]
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent {
                index: 4,
                kind: EventKind::Unregistering
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent {
                index: 4,
                kind: EventKind::Unregistered
            }
        );
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Accept);
        fixture.shutdown.cancel();

        let (stream, _peer) = tokio::io::duplex(64);
        handler
            .run(&CancellationToken::new(), stream, &fixture.options())
            .await
            .unwrap();

        assert_eq!(
            fixture.calls.journal(),
            vec!["register", "connected", "graceful_shutdown", "close"]
        );
        assert!(handler.is_gracefully_stopped());
    }

    #[tokio::test]
    async fn test_shared_trigger_stops_every_handler() {
        let fixture = Fixture::new();
        let handler0 = fixture.handler(0, Registration::Accept);
        let handler1 = fixture.handler(1, Registration::Accept);
        let ctx = CancellationToken::new();

        let task0 = spawn_run(handler0.clone(), ctx.clone(), fixture.options());
        let task1 = spawn_run(handler1.clone(), ctx.clone(), fixture.options());
        wait_for_state(&handler0, ControlStreamState::Connected).await;
        wait_for_state(&handler1, ControlStreamState::Connected).await;

        fixture.shutdown.cancel();

        let (r0, r1) = tokio::time::timeout(Duration::from_secs(5), async {
            (task0.await.unwrap(), task1.await.unwrap())
        })
        .await
        .expect("both handlers should stop");
        assert!(r0.is_ok());
        assert!(r1.is_ok());

        assert!(handler0.is_gracefully_stopped());
        assert!(handler1.is_gracefully_stopped());
        assert_eq!(fixture.calls.created.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.calls.closed(), 2);
        assert_eq!(fixture.calls.graceful_shutdowns().len(), 2);
        // Both registered, but the fuse only counts calls here; BooleanFuse dedups
        assert_eq!(fixture.fired(), 2);
    }

    #[tokio::test]
    async fn test_not_gracefully_stopped_before_or_during_run() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Accept);
        assert_eq!(handler.state(), ControlStreamState::Idle);
        assert!(!handler.is_gracefully_stopped());

        let ctx = CancellationToken::new();
        let task = spawn_run(handler.clone(), ctx.clone(), fixture.options());
        wait_for_state(&handler, ControlStreamState::Connected).await;
        assert!(!handler.is_gracefully_stopped());
        assert!(!handler.state().is_terminal());

        fixture.shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(handler.state().is_terminal());
        assert!(handler.is_gracefully_stopped());
    }

    #[tokio::test]
    async fn test_cancel_during_registration() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Hang);
        let ctx = CancellationToken::new();

        let task = spawn_run(handler.clone(), ctx.clone(), fixture.options());
        wait_for_state(&handler, ControlStreamState::Registering).await;
        ctx.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(ControlError::Cancelled)));
        assert_eq!(fixture.fired(), 0);
        assert_eq!(fixture.calls.closed(), 1);
        assert!(fixture.calls.graceful_shutdowns().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_run_still_releases_client() {
        let fixture = Fixture::new();
        let handler = fixture.handler(0, Registration::Accept);

        let task = spawn_run(handler.clone(), CancellationToken::new(), fixture.options());
        wait_for_state(&handler, ControlStreamState::Connected).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(fixture.calls.closed(), 1);
        assert!(fixture.calls.graceful_shutdowns().is_empty());
    }

    #[tokio::test]
    async fn test_handler_can_run_again() {
        let fixture = Fixture::new();
        let handler = fixture.handler(2, Registration::Accept);

        let ctx = CancellationToken::new();
        ctx.cancel();
        let (stream, _peer) = tokio::io::duplex(64);
        handler.run(&ctx, stream, &fixture.options()).await.unwrap();
        assert!(!handler.is_gracefully_stopped());

        fixture.shutdown.cancel();
        let (stream, _peer) = tokio::io::duplex(64);
        handler
            .run(&CancellationToken::new(), stream, &fixture.options())
            .await
            .unwrap();
        assert!(handler.is_gracefully_stopped());
        assert_eq!(fixture.calls.created.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.calls.closed(), 2);
    }

    #[test]
    fn test_defaults() {
        let fixture = Fixture::new();
        let handler = ControlStreamHandler::new(
            fixture.observer.clone(),
            fixture.fuse.clone(),
            fixture.identity.clone(),
            7,
            fixture.shutdown.clone(),
            DEFAULT_GRACE_PERIOD,
        );
        assert_eq!(handler.conn_index(), 7);
        assert_eq!(handler.grace_period(), Duration::from_secs(30));
        assert_eq!(handler.state(), ControlStreamState::Idle);
    }
}
