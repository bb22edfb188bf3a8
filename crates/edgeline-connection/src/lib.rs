//! Control-plane lifecycle of tunnel connections
//!
//! Each tunnel connection to the edge carries a control stream. A
//! [`ControlStreamHandler`] registers the connection over that stream, fires
//! the shared connected fuse, waits for either cancellation or the shared
//! graceful-shutdown trigger, and then unregisters the connection within the
//! configured grace period.

pub mod control;
pub mod error;
pub mod fuse;
pub mod observer;
pub mod rpc;

pub use control::{ControlStreamHandler, ControlStreamState, DEFAULT_GRACE_PERIOD};
pub use error::ControlError;
pub use fuse::{BooleanFuse, ConnectedFuse};
pub use observer::{ConnectionEvent, EventKind, Observer};
pub use rpc::{
    default_rpc_client_factory, BoxedControlStream, ControlStream, RegistrationClient,
    RegistrationRpcClient, RpcClientFactory,
};

pub use edgeline_proto::{ConnectionDetails, ConnectionOptions, TunnelIdentity};
pub use tokio_util::sync::CancellationToken;
