//! Ref-counted libvirt connection cache keyed by URI. Each
//! `Handle` increments the refcount on clone and decrements on drop; the
//! underlying `Connect` is closed once the last handle is gone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use virt::connect::Connect;
use virt::error as virt_error;

use crate::error::RangeError;

struct Entry {
    conn: Arc<Connect>,
    refs: usize,
}

#[derive(Default)]
pub struct ConnectionCache {
    entries: Mutex<HashMap<String, Entry>>,
}

pub struct Handle {
    pub conn: Arc<Connect>,
    uri: String,
    cache: Arc<ConnectionCache>,
}

impl std::ops::Deref for Handle {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.conn
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let mut entries = self.cache.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(&self.uri) {
            entry.refs -= 1;
            if entry.refs == 0 {
                if let Some(entry) = entries.remove(&self.uri) {
                    drop(entry.conn);
                }
            }
        }
    }
}

impl ConnectionCache {
    pub fn new() -> Arc<Self> {
        virt_error::clear_error_callback();
        Arc::new(Self::default())
    }

    /// Returns a ref-counted handle to a connection for `uri`, opening one
    /// if none is cached yet.
    pub fn get(self: &Arc<Self>, uri: &str) -> Result<Handle, RangeError> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(uri) {
            entry.refs += 1;
            return Ok(Handle {
                conn: entry.conn.clone(),
                uri: uri.to_string(),
                cache: self.clone(),
            });
        }

        let conn = Connect::open(Some(uri)).map_err(|e| RangeError::Virtualization {
            operation: "connect".into(),
            message: format!("failed to connect to libvirt at {uri}: {e}"),
            hint: "ensure libvirtd is running and you have access to this URI".into(),
        })?;
        let conn = Arc::new(conn);
        entries.insert(
            uri.to_string(),
            Entry {
                conn: conn.clone(),
                refs: 1,
            },
        );
        Ok(Handle {
            conn,
            uri: uri.to_string(),
            cache: self.clone(),
        })
    }

    /// Closes every cached connection regardless of refcount, for provider
    /// shutdown.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            let _ = entry.conn.close();
        }
    }
}
