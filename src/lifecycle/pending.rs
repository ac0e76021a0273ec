//! Records awaiting the device
//!
//! While a mutation has written its record but the device has not yet
//! accepted it, readers are served the last committed record instead.

use crate::error::{GuardError, Result};
use crate::wireguard::Tunnel;
use std::collections::HashMap;
use std::sync::Mutex;

/// Last committed record per tunnel with an unconfirmed store write.
/// `None` means the tunnel did not exist before the write.
#[derive(Debug, Default)]
pub struct PendingWrites {
    committed: Mutex<HashMap<String, Option<Tunnel>>>,
}

impl PendingWrites {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `committed` to readers of `id` until the returned guard drops
    pub fn begin(&self, id: &str, committed: Option<Tunnel>) -> Result<PendingGuard<'_>> {
        self.committed
            .lock()
            .map_err(|_| GuardError::Infrastructure("pending write table poisoned".to_string()))?
            .insert(id.to_string(), committed);
        Ok(PendingGuard {
            writes: self,
            id: id.to_string(),
        })
    }

    /// The view readers get of a stored record
    pub fn visible(&self, stored: Tunnel) -> Result<Option<Tunnel>> {
        let committed = self
            .committed
            .lock()
            .map_err(|_| GuardError::Infrastructure("pending write table poisoned".to_string()))?;
        Ok(match committed.get(&stored.id) {
            Some(previous) => previous.clone(),
            None => Some(stored),
        })
    }
}

/// Ends a pending write on drop
pub struct PendingGuard<'a> {
    writes: &'a PendingWrites,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut committed = self
            .writes
            .committed
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        committed.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wireguard::KeyPair;

    fn tunnel(id: &str, port: u16) -> Tunnel {
        let keypair = KeyPair::generate().unwrap();
        Tunnel {
            id: id.to_string(),
            address: "10.0.0.1/24".parse().unwrap(),
            endpoint: "1.2.3.4:51820".to_string(),
            private_key: Some(keypair.private),
            public_key: keypair.public,
            listen_port: port,
            peers: vec![],
        }
    }

    #[test]
    fn test_pending_create_is_hidden() {
        let writes = PendingWrites::new();
        let guard = writes.begin("t0", None).unwrap();
        assert!(writes.visible(tunnel("t0", 51820)).unwrap().is_none());

        drop(guard);
        assert!(writes.visible(tunnel("t0", 51820)).unwrap().is_some());
    }

    #[test]
    fn test_pending_update_serves_committed_record() {
        let writes = PendingWrites::new();
        let committed = tunnel("t0", 51820);
        let _guard = writes.begin("t0", Some(committed.clone())).unwrap();

        assert_eq!(writes.visible(tunnel("t0", 51999)).unwrap(), Some(committed));
        let other = tunnel("t1", 51821);
        assert_eq!(writes.visible(other.clone()).unwrap(), Some(other));
    }
}
