//! Protocol message types

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

/// Messages exchanged on a connection's control stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Client asks the edge to activate connection `conn_index` of a tunnel
    RegisterConnection {
        auth: TunnelAuth,
        tunnel_id: Uuid,
        conn_index: u8,
        options: ConnectionOptions,
    },
    /// Edge accepted the registration
    ConnectionRegistered { details: ConnectionDetails },
    /// Edge refused the registration
    ConnectionRejected {
        reason: String,
        /// Seconds the client should wait before trying again, if the edge has an opinion
        #[serde(default)]
        retry_after_secs: Option<u64>,
        /// The edge will never accept this registration (bad credentials, deleted tunnel)
        permanent: bool,
    },
    /// Client is draining this connection
    UnregisterConnection,
    /// Edge finished unregistering the connection
    UnregisterAck,
}

/// Secret material presented when registering a connection
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelAuth {
    pub account_tag: String,
    #[serde(with = "serde_bytes")]
    pub tunnel_secret: Vec<u8>,
}

// Never print the secret
impl std::fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAuth")
            .field("account_tag", &self.account_tag)
            .field("tunnel_secret", &"<redacted>")
            .finish()
    }
}

/// Credentials of a named tunnel
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelCredentials {
    pub account_tag: String,
    #[serde(with = "serde_bytes")]
    pub tunnel_secret: Vec<u8>,
    pub tunnel_id: Uuid,
}

impl std::fmt::Debug for TunnelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelCredentials")
            .field("account_tag", &self.account_tag)
            .field("tunnel_secret", &"<redacted>")
            .field("tunnel_id", &self.tunnel_id)
            .finish()
    }
}

impl TunnelCredentials {
    pub fn auth(&self) -> TunnelAuth {
        TunnelAuth {
            account_tag: self.account_tag.clone(),
            tunnel_secret: self.tunnel_secret.clone(),
        }
    }
}

/// Information about the client software registering connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub client_id: Uuid,
    pub features: Vec<String>,
    pub version: String,
    pub arch: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            client_id: Uuid::new_v4(),
            features: Vec::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            arch: format!("{}_{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

/// Identity of the tunnel every connection registers against
///
/// Shared read-only by all connection handlers of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelIdentity {
    pub credentials: TunnelCredentials,
    pub client: ClientInfo,
}

impl TunnelIdentity {
    pub fn new(credentials: TunnelCredentials, client: ClientInfo) -> Self {
        Self {
            credentials,
            client,
        }
    }

    pub fn tunnel_id(&self) -> Uuid {
        self.credentials.tunnel_id
    }

    /// Build the registration request for one connection
    pub fn register_message(&self, conn_index: u8, options: &ConnectionOptions) -> ControlMessage {
        ControlMessage::RegisterConnection {
            auth: self.credentials.auth(),
            tunnel_id: self.credentials.tunnel_id,
            conn_index,
            options: options.clone(),
        }
    }
}

/// Per-connection registration options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub client: ClientInfo,
    /// Local address the connection to the edge originates from
    pub origin_local_ip: Option<IpAddr>,
    /// Ask the edge to evict another connection holding the same index
    pub replace_existing: bool,
    pub compression_quality: u8,
    /// How many times this index has already tried to connect
    pub num_previous_attempts: u8,
}

impl ConnectionOptions {
    pub fn new(client: ClientInfo) -> Self {
        Self {
            client,
            origin_local_ip: None,
            replace_existing: false,
            compression_quality: 0,
            num_previous_attempts: 0,
        }
    }
}

/// What the edge reports back about an accepted connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionDetails {
    pub uuid: Uuid,
    /// Edge location serving the connection, e.g. "ams01"
    pub location: String,
    pub is_remotely_managed: bool,
}

mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
