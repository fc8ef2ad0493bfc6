use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::server::PersistentConnection;

#[derive(Debug)]
pub enum RegistryError {
    ConnectionNotFound { connection_id: u64 },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound { connection_id } => {
                write!(f, "connection {connection_id} not found")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

struct ConnectionRecord {
    connection: Arc<PersistentConnection>,
    connected_at: DateTime<Utc>,
    request_count: u64,
}

#[derive(Clone, Debug)]
pub struct ConnectionSnapshot {
    pub connection_id: u64,
    pub peer_addr: String,
    pub connected_at: DateTime<Utc>,
    pub request_count: u64,
}

/// Tracks every open client connection from accept to close. Shutdown walks
/// the registry to shut the sockets down; each session removes its own entry
/// when its receive loop ends.
#[derive(Default)]
pub struct ConnectionRegistry {
    records: Mutex<HashMap<u64, ConnectionRecord>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<PersistentConnection>) -> u64 {
        let connection_id = connection.id();
        let record = ConnectionRecord {
            connection,
            connected_at: Utc::now(),
            request_count: 0,
        };

        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .insert(connection_id, record);

        connection_id
    }

    pub fn unregister(&self, connection_id: u64) -> Result<(), RegistryError> {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .remove(&connection_id)
            .map(|_| ())
            .ok_or(RegistryError::ConnectionNotFound { connection_id })
    }

    pub fn record_request(&self, connection_id: u64) -> Result<(), RegistryError> {
        let mut records = self
            .records
            .lock()
            .expect("connection registry lock poisoned");
        let record = records
            .get_mut(&connection_id)
            .ok_or(RegistryError::ConnectionNotFound { connection_id })?;
        record.request_count += 1;
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .len()
    }

    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        self.records
            .lock()
            .expect("connection registry lock poisoned")
            .values()
            .map(|record| ConnectionSnapshot {
                connection_id: record.connection.id(),
                peer_addr: record.connection.peer_addr().to_string(),
                connected_at: record.connected_at,
                request_count: record.request_count,
            })
            .collect()
    }

    pub fn snapshot(&self) -> Value {
        let connections = self
            .connections()
            .into_iter()
            .map(|snapshot| {
                json!({
                    "connection_id": snapshot.connection_id,
                    "peer_addr": snapshot.peer_addr,
                    "connected_at": snapshot.connected_at.to_rfc3339(),
                    "request_count": snapshot.request_count,
                })
            })
            .collect::<Vec<_>>();

        json!({
            "count": connections.len(),
            "connections": connections,
        })
    }

    /// Shuts down every registered socket. Records stay until each session
    /// observes the closed socket and unregisters itself.
    pub fn shutdown_all(&self) -> usize {
        let records = self
            .records
            .lock()
            .expect("connection registry lock poisoned");

        for record in records.values() {
            let _ = record.connection.shutdown();
        }
        records.len()
    }
}
