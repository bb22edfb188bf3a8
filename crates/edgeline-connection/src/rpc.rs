//! Registration RPC client used on a connection's control stream
//!
//! [`RegistrationClient`] is the seam between the lifecycle state machine and
//! the wire: the handler only needs to register, unregister within a grace
//! period, and release. [`RegistrationRpcClient`] is the production
//! implementation speaking [`ControlMessage`]s over a [`ControlCodec`] frame.

use crate::error::ControlError;
use crate::observer::Observer;
use async_trait::async_trait;
use edgeline_proto::{
    ConnectionDetails, ConnectionOptions, ControlCodec, ControlMessage, TunnelIdentity,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Duplex byte stream a control stream runs over
pub trait ControlStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ControlStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedControlStream = Box<dyn ControlStream>;

/// Registers and unregisters one connection with the edge
#[async_trait]
pub trait RegistrationClient: Send {
    /// Register connection `conn_index` of the tunnel described by `identity`
    async fn register_connection(
        &mut self,
        ctx: &CancellationToken,
        identity: &TunnelIdentity,
        options: &ConnectionOptions,
        conn_index: u8,
        observer: &Observer,
    ) -> Result<ConnectionDetails, ControlError>;

    /// Unregister the connection, giving up after `grace_period`
    ///
    /// Failures are the implementation's to report; callers never see them.
    async fn graceful_shutdown(&mut self, ctx: &CancellationToken, grace_period: Duration);

    /// Release the underlying stream. Must be safe to call more than once.
    fn close(&mut self);
}

/// Builds a fresh [`RegistrationClient`] bound to a control stream
pub type RpcClientFactory =
    Arc<dyn Fn(BoxedControlStream) -> Box<dyn RegistrationClient> + Send + Sync>;

/// Factory producing [`RegistrationRpcClient`]s
pub fn default_rpc_client_factory() -> RpcClientFactory {
    Arc::new(
        |stream: BoxedControlStream| -> Box<dyn RegistrationClient> {
            Box::new(RegistrationRpcClient::new(stream))
        },
    )
}

/// Production registration client
pub struct RegistrationRpcClient {
    framed: Option<Framed<BoxedControlStream, ControlCodec>>,
    conn_index: Option<u8>,
}

impl RegistrationRpcClient {
    pub fn new(stream: BoxedControlStream) -> Self {
        Self {
            framed: Some(Framed::new(stream, ControlCodec)),
            conn_index: None,
        }
    }

    fn framed(&mut self) -> Result<&mut Framed<BoxedControlStream, ControlCodec>, ControlError> {
        self.framed.as_mut().ok_or(ControlError::Released)
    }

    async fn send(&mut self, message: ControlMessage) -> Result<(), ControlError> {
        self.framed()?.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ControlMessage, ControlError> {
        match self.framed()?.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) => Err(e.into()),
            None => Err(ControlError::StreamClosed),
        }
    }

    async fn register(
        &mut self,
        identity: &TunnelIdentity,
        options: &ConnectionOptions,
        conn_index: u8,
    ) -> Result<ConnectionDetails, ControlError> {
        self.send(identity.register_message(conn_index, options))
            .await?;
        debug!(conn_index, "Sent RegisterConnection");

        match self.recv().await? {
            ControlMessage::ConnectionRegistered { details } => Ok(details),
            ControlMessage::ConnectionRejected {
                reason,
                retry_after_secs,
                permanent,
            } => Err(ControlError::RegistrationRejected {
                reason,
                retry_after: retry_after_secs.map(Duration::from_secs),
                permanent,
            }),
            other => Err(ControlError::UnexpectedMessage(format!("{:?}", other))),
        }
    }

    async fn unregister(&mut self) -> Result<(), ControlError> {
        self.send(ControlMessage::UnregisterConnection).await?;

        match self.recv().await? {
            ControlMessage::UnregisterAck => Ok(()),
            other => Err(ControlError::UnexpectedMessage(format!("{:?}", other))),
        }
    }
}

#[async_trait]
impl RegistrationClient for RegistrationRpcClient {
    async fn register_connection(
        &mut self,
        ctx: &CancellationToken,
        identity: &TunnelIdentity,
        options: &ConnectionOptions,
        conn_index: u8,
        observer: &Observer,
    ) -> Result<ConnectionDetails, ControlError> {
        self.conn_index = Some(conn_index);

        let result = tokio::select! {
            _ = ctx.cancelled() => Err(ControlError::Cancelled),
            result = self.register(identity, options, conn_index) => result,
        };

        match result {
            Ok(details) => {
                info!(
                    conn_index,
                    connection = %details.uuid,
                    location = %details.location,
                    "Registered tunnel connection"
                );
                observer.send_connected_event(conn_index, &details.location);
                Ok(details)
            }
            Err(e) => {
                warn!(conn_index, "Failed to register tunnel connection: {}", e);
                Err(e)
            }
        }
    }

    async fn graceful_shutdown(&mut self, ctx: &CancellationToken, grace_period: Duration) {
        let conn_index = self.conn_index;

        // The deadline hangs off the caller's context: once that is gone there is
        // nothing left to wait for.
        if ctx.is_cancelled() {
            debug!(?conn_index, "Context cancelled, skipping unregistration");
            return;
        }

        let result = tokio::select! {
            _ = ctx.cancelled() => Err(ControlError::Cancelled),
            result = tokio::time::timeout(grace_period, self.unregister()) => {
                result.unwrap_or(Err(ControlError::Timeout))
            }
        };

        match result {
            Ok(()) => debug!(?conn_index, "Edge acknowledged unregistration"),
            Err(e) => warn!(
                ?conn_index,
                grace_period_ms = grace_period.as_millis() as u64,
                "Failed to unregister tunnel connection: {}",
                e
            ),
        }
    }

    fn close(&mut self) {
        if self.framed.take().is_some() {
            debug!(conn_index = ?self.conn_index, "Released control stream");
        }
    }
}
