//! Chunk-aware dispatcher: the user-facing DB client.
//!
//! Every call maps its key to a chunk, snapshots the chunk's holders
//! from the membership view, fans the operation out to them in parallel,
//! and reconciles the replies under last-write-wins. Values carry their
//! write timestamp as an 8-byte little-endian nanosecond prefix; clock
//! skew across clients decides which concurrent write wins, which is the
//! documented trade of the LWW policy. Callers that need ordering use
//! `cas`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use futures::future::join_all;

use tokio::time::Duration;

use crate::client::broker::Connection;
use crate::client::server::ServerEntry;
use crate::cluster::{ClusterDescriptor, ClusterView};
use crate::proto::Operation;
use crate::utils::{chunk_of, fnv1a_64, ChunkDbError};

/// Deadline for the bootstrap `GetConf` exchange and for `cas` when Sets
/// are configured fire-and-forget.
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Dispatcher configuration, overridable from a TOML string.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Per-holder deadline on Get, in milliseconds.
    pub get_timeout_ms: u64,

    /// Per-holder deadline on Set, in milliseconds; 0 makes Sets
    /// fire-and-forget.
    pub set_timeout_ms: u64,

    /// Per-holder deadline on Del, in milliseconds.
    pub del_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            get_timeout_ms: 500,
            set_timeout_ms: 500,
            del_timeout_ms: 500,
        }
    }
}

impl ClientConfig {
    /// Composes a configuration from the default values, overwriting the
    /// timeout fields named in the given TOML string if it's not `None`.
    /// Field names outside the three timeouts are rejected.
    pub fn from_toml(
        config_str: Option<&str>,
    ) -> Result<Self, ChunkDbError> {
        let mut config = ClientConfig::default();
        let Some(config_str) = config_str else {
            return Ok(config);
        };

        let mut table = config_str.parse::<toml::Table>()?;
        for (name, timeout_ms) in [
            ("get_timeout_ms", &mut config.get_timeout_ms),
            ("set_timeout_ms", &mut config.set_timeout_ms),
            ("del_timeout_ms", &mut config.del_timeout_ms),
        ] {
            if let Some(value) = table.remove(name) {
                *timeout_ms = value.try_into()?;
            }
        }

        // anything left over is not a field this client knows
        if !table.is_empty() {
            return Err(ChunkDbError::Config(format!(
                "unknown config field '{}'",
                table.keys().next().unwrap(),
            )));
        }

        Ok(config)
    }
}

/// The DB client handle. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct DbClient {
    /// Membership view, maintained by the heartbeat collaborator after
    /// bootstrap.
    view: Arc<ClusterView>,

    config: ClientConfig,
}

impl DbClient {
    /// Connects to a cluster through any of its servers with default
    /// configuration.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ChunkDbError> {
        Self::connect_with_config(addr, None).await
    }

    /// Connects to a cluster through any of its servers. `config_str`
    /// optionally overrides `ClientConfig` fields in TOML, e.g.
    /// `"get_timeout_ms = 100"`.
    pub async fn connect_with_config(
        addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, ChunkDbError> {
        let config = ClientConfig::from_toml(config_str)?;

        // bootstrap: fetch the access info descriptor and populate the
        // initial view; the heartbeat collaborator maintains it from here
        let bootstrap = Connection::open(addr, None).await?;
        let raw = bootstrap
            .request(
                Operation::GetConf,
                Bytes::new(),
                Bytes::new(),
                DEFAULT_OP_TIMEOUT,
            )
            .await?;
        let desc = ClusterDescriptor::decode(&raw)?;
        let view = Arc::new(ClusterView::from_descriptor(&desc).await?);
        pf_info!(
            "joined cluster via '{}': {} chunks across {} servers",
            addr,
            desc.num_chunks,
            desc.servers.len()
        );

        Ok(DbClient { view, config })
    }

    /// The membership view, for the heartbeat collaborator and tests.
    pub fn view(&self) -> &Arc<ClusterView> {
        &self.view
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Reads a key. Fans out to every usable holder of the key's chunk,
    /// keeps the reply with the greatest embedded timestamp, and returns
    /// its payload together with that timestamp. Best-effort: total
    /// failure comes back as `(None, 0)`, never as an error.
    pub async fn get(&self, key: &[u8]) -> (Option<Vec<u8>>, u64) {
        let holders = self.usable_holders(key).await;
        let key = Bytes::copy_from_slice(key);
        let timeout = Duration::from_millis(self.config.get_timeout_ms);

        let replies = join_all(
            holders.iter().map(|holder| holder.get(key.clone(), timeout)),
        )
        .await;

        // last-write-wins reconciliation; ties keep the earliest holder
        let mut value: Option<Bytes> = None;
        let mut last_time = 0u64;
        for reply in replies {
            let stored = match reply {
                Ok(stored) => stored,
                Err(e) => {
                    pf_debug!("get fan-out reply discarded: {}", e);
                    continue;
                }
            };
            if stored.len() >= 8 {
                let t = u64::from_le_bytes(stored[..8].try_into().unwrap());
                if value.is_none() || t > last_time {
                    last_time = t;
                    value = Some(stored);
                }
            }
        }

        match value {
            Some(stored) => (Some(stored[8..].to_vec()), last_time),
            None => (None, 0),
        }
    }

    /// Writes a key. The value is prefixed with the current wall-clock
    /// nanosecond timestamp and fanned out to every usable holder in
    /// parallel. Returns whether at least one holder accepted, plus the
    /// last non-success cause for observability.
    pub async fn set(
        &self,
        key: &[u8],
        value: &[u8],
    ) -> (bool, Option<ChunkDbError>) {
        let holders = self.usable_holders(key).await;
        if holders.is_empty() {
            return (false, Some(ChunkDbError::Unreachable));
        }

        let key = Bytes::copy_from_slice(key);
        let framed = timestamped(now_nanos(), value);
        let timeout = Duration::from_millis(self.config.set_timeout_ms);

        let mut written = false;
        let mut last_err = None;
        let replies = join_all(holders.iter().map(|holder| {
            holder.set(key.clone(), framed.clone(), timeout)
        }))
        .await;
        for reply in replies {
            match reply {
                Ok(()) => written = true,
                Err(e) => last_err = Some(e),
            }
        }
        (written, last_err)
    }

    /// Deletes a key on every usable holder, best-effort. Returns the
    /// last error observed, if any.
    pub async fn del(&self, key: &[u8]) -> Option<ChunkDbError> {
        let holders = self.usable_holders(key).await;
        if holders.is_empty() {
            return Some(ChunkDbError::Unreachable);
        }

        let key = Bytes::copy_from_slice(key);
        let timeout = Duration::from_millis(self.config.del_timeout_ms);

        let mut last_err = None;
        let replies = join_all(
            holders.iter().map(|holder| holder.del(key.clone(), timeout)),
        )
        .await;
        for reply in replies {
            if let Err(e) = reply {
                last_err = Some(e);
            }
        }
        last_err
    }

    /// Conditionally replaces a key on the chunk's primary holder. The
    /// write succeeds only if the stored record still matches
    /// `(expected_ts, expected_payload)`; the comparison happens
    /// atomically on the single holder, which is what gives `cas` its
    /// ordering guarantee. A conflict or any failure returns
    /// `written = false`; the caller retries with freshly read state.
    pub async fn cas(
        &self,
        key: &[u8],
        new_value: &[u8],
        expected_ts: u64,
        expected_payload: &[u8],
    ) -> (bool, Option<ChunkDbError>) {
        let holders = self.usable_holders(key).await;
        let Some(primary) = holders.first() else {
            return (false, Some(ChunkDbError::Unreachable));
        };

        let request = encode_cas(
            expected_ts,
            expected_payload,
            now_nanos(),
            new_value,
        );
        let timeout = if self.config.set_timeout_ms > 0 {
            Duration::from_millis(self.config.set_timeout_ms)
        } else {
            DEFAULT_OP_TIMEOUT
        };

        match primary
            .cas(Bytes::copy_from_slice(key), request, timeout)
            .await
        {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        }
    }

    /// Drops every established connection. Operations issued afterwards
    /// redial lazily.
    pub async fn close(&self) {
        self.view.disconnect_all().await;
    }

    /// Snapshot of the alive holders of the key's chunk.
    async fn usable_holders(&self, key: &[u8]) -> Vec<Arc<ServerEntry>> {
        let chunk = chunk_of(key, self.view.num_chunks());
        self.view
            .holders_of(chunk)
            .await
            .into_iter()
            .filter(|holder| holder.is_alive())
            .collect()
    }
}

/// Current wall-clock time in nanoseconds since the epoch.
fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Prepends the write timestamp to a payload.
fn timestamped(ts: u64, payload: &[u8]) -> Bytes {
    let mut framed = Vec::with_capacity(8 + payload.len());
    framed.extend_from_slice(&ts.to_le_bytes());
    framed.extend_from_slice(payload);
    Bytes::from(framed)
}

/// Encodes a CAS request value:
/// `expected_ts(8) || fnv1a64(expected_payload)(8) || new_ts(8) || new_payload`,
/// all little-endian. The stored record the server compares against is an
/// absent key for `(0, fnv1a64(b""))`.
fn encode_cas(
    expected_ts: u64,
    expected_payload: &[u8],
    new_ts: u64,
    new_payload: &[u8],
) -> Bytes {
    let mut request = Vec::with_capacity(24 + new_payload.len());
    request.extend_from_slice(&expected_ts.to_le_bytes());
    request.extend_from_slice(&fnv1a_64(expected_payload).to_le_bytes());
    request.extend_from_slice(&new_ts.to_le_bytes());
    request.extend_from_slice(new_payload);
    Bytes::from(request)
}
