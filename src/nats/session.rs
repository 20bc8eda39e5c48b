/// Authenticated broker sessions
///
/// Opens a connection with materialized credentials and resolves the
/// caller's tenant namespace through a request/reply RPC.

use async_nats::jetstream;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::BridgeSettings;
use crate::error::BridgeError;
use crate::nats::credentials::{self, MaterializedCredentials};

/// Subject answering namespace lookups.
pub const NAMESPACE_SUBJECT: &str = "accounts.user.get_namespace";

/// Upper bound for the namespace RPC.
pub const NAMESPACE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct NamespaceRequest<'a> {
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct NamespaceReply {
    #[serde(default)]
    status: String,
    data: NamespaceData,
}

#[derive(Debug, Deserialize)]
struct NamespaceData {
    #[serde(default)]
    namespace: String,
}

pub fn encode_namespace_request(api_key: &str) -> Result<Vec<u8>, BridgeError> {
    serde_json::to_vec(&NamespaceRequest { api_key }).map_err(BridgeError::NamespaceDecode)
}

/// Decode a namespace reply, rejecting empty namespaces.
pub fn decode_namespace_reply(payload: &[u8]) -> Result<String, BridgeError> {
    let reply: NamespaceReply =
        serde_json::from_slice(payload).map_err(BridgeError::NamespaceDecode)?;

    let namespace = reply.data.namespace.trim();
    if namespace.is_empty() {
        tracing::warn!(status = %reply.status, "Namespace reply without namespace");
        return Err(BridgeError::EmptyNamespace);
    }

    tracing::debug!(status = %reply.status, namespace, "Resolved namespace");
    Ok(namespace.to_string())
}

/// An authenticated connection plus the caller's resolved namespace.
///
/// Owned by a single stream request. Dropping it releases the connection
/// handle and removes any credentials file written for it.
#[derive(Debug)]
pub struct Session {
    client: async_nats::Client,
    namespace: String,
    _credentials: MaterializedCredentials,
}

impl Session {
    /// Connect, then resolve the namespace for `settings.identity`.
    pub async fn connect(settings: &BridgeSettings) -> Result<Self, BridgeError> {
        let (client, credentials) = open(settings).await?;
        let namespace = resolve_namespace(&client, &settings.identity.api_key).await?;

        tracing::info!(namespace = %namespace, "Session established");

        Ok(Self {
            client,
            namespace,
            _credentials: credentials,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// JetStream context bound to this session's connection
    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }
}

/// Connect step only: the exact condition the health probe reports on.
pub async fn probe(settings: &BridgeSettings) -> Result<(), BridgeError> {
    let (client, _credentials) = open(settings).await?;
    client
        .flush()
        .await
        .map_err(|e| BridgeError::Connect(e.to_string()))?;
    Ok(())
}

async fn open(
    settings: &BridgeSettings,
) -> Result<(async_nats::Client, MaterializedCredentials), BridgeError> {
    let credentials =
        credentials::materialize(&settings.identity.auth, &settings.credential_storage)?;

    let address = settings.broker_address();
    let options = credentials
        .connect_options()
        .await?
        .name("relay-bridge")
        .connection_timeout(settings.connect_timeout)
        .request_timeout(Some(NAMESPACE_TIMEOUT));

    let client = options.connect(address.as_str()).await.map_err(|e| {
        tracing::warn!(address = %address, error = %e, "Unable to connect to broker");
        BridgeError::Connect(e.to_string())
    })?;

    tracing::info!(address = %address, "Connected to broker");
    Ok((client, credentials))
}

async fn resolve_namespace(client: &async_nats::Client, api_key: &str) -> Result<String, BridgeError> {
    let payload = encode_namespace_request(api_key)?;

    let reply = tokio::time::timeout(
        NAMESPACE_TIMEOUT,
        client.request(NAMESPACE_SUBJECT.to_string(), payload.into()),
    )
    .await
    .map_err(|_| BridgeError::NamespaceTimeout)?
    .map_err(|e| BridgeError::NamespaceRequest(e.to_string()))?;

    decode_namespace_reply(&reply.payload)
}
