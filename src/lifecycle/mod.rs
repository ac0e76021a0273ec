//! Tunnel lifecycle management
//!
//! Every mutating operation runs under the tunnel's exclusive lock, writes the
//! new desired state to the store, then reconciles the device. When the device
//! rejects the change the previous record is restored, so the store never
//! describes a state the device failed to reach. Until the device accepts a
//! change, `list` and `get` keep serving the last committed record.

mod context;
mod locks;
mod pending;

pub use context::Context;
pub use locks::TunnelLocks;

use pending::PendingWrites;

use crate::config::{validation, ServerConfig};
use crate::device::Reconciler;
use crate::error::{ErrorKind, GuardError, Result};
use crate::store::TunnelStore;
use crate::wireguard::{host_net, AddressAllocator, KeyPair, Peer, Tunnel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Parameters for creating a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnel {
    /// Tunnel ID, also the interface name
    pub id: String,
    /// Tunnel address in CIDR form, e.g. `10.0.0.1/24`
    pub address: String,
    /// Endpoint peers dial, `host:port`
    pub endpoint: String,
}

/// Parameters for adding a peer to a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeer {
    /// Owning tunnel
    pub tunnel_id: String,
    /// Peer ID, unique within the tunnel
    pub peer_id: String,
    /// Address to assign instead of the next free one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Resolver hint stored with the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,
    /// Extra ranges routed to the peer, after its own address
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_ips: Vec<String>,
}

/// A freshly created peer and the tunnel it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPeerResult {
    /// The peer, carrying its private key this one time
    pub peer: Peer,
    /// The updated tunnel, without private keys
    pub tunnel: Tunnel,
}

/// Coordinates the store, key generation, address allocation and the device
pub struct LifecycleManager {
    store: Arc<dyn TunnelStore>,
    reconciler: Reconciler,
    locks: TunnelLocks,
    pending: PendingWrites,
    /// Serializes listen-port selection with tunnel creation
    ports: Mutex<()>,
    base_listen_port: u16,
}

impl LifecycleManager {
    /// Create a manager over a store and a reconciler
    pub fn new(store: Arc<dyn TunnelStore>, reconciler: Reconciler, base_listen_port: u16) -> Self {
        Self {
            store,
            reconciler,
            locks: TunnelLocks::new(),
            pending: PendingWrites::new(),
            ports: Mutex::new(()),
            base_listen_port,
        }
    }

    /// Create a tunnel and bring up its device.
    ///
    /// The returned tunnel carries its private key; later reads never do.
    pub async fn create(&self, ctx: &Context, req: CreateTunnel) -> Result<Tunnel> {
        validation::validate_id(&req.id)?;
        let address = validation::parse_cidr(&req.address)?;
        validation::validate_endpoint(&req.endpoint)?;

        let _guard = self.locks.lock(&req.id).await;
        match self.store.get(&req.id) {
            Ok(_) => return Err(GuardError::tunnel_exists(&req.id)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        ctx.check("create tunnel")?;

        let keypair = KeyPair::generate()?;
        let mut tunnel = Tunnel {
            id: req.id.clone(),
            address,
            endpoint: req.endpoint,
            private_key: Some(keypair.private),
            public_key: keypair.public,
            listen_port: 0,
            peers: Vec::new(),
        };
        let _pending = self.pending.begin(&tunnel.id, None)?;
        self.insert_with_port(&mut tunnel)?;

        if let Err(e) = self.apply(&tunnel).await {
            return Err(self.rollback(&req.id, None, e).await);
        }

        info!(
            "Created tunnel '{}' at {} listening on {}",
            tunnel.id, tunnel.address, tunnel.listen_port
        );
        Ok(tunnel)
    }

    /// Tear down a tunnel's device, then forget the tunnel
    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        let tunnel = self.store.get(id)?;
        ctx.check("delete tunnel")?;

        self.teardown(id).await?;
        self.store.delete(id).map_err(|e| {
            GuardError::Infrastructure(format!(
                "Device '{}' removed but its record could not be deleted: {}",
                id, e
            ))
        })?;

        info!("Deleted tunnel '{}' ({} peers)", id, tunnel.peers.len());
        Ok(())
    }

    /// Every tunnel, ordered by ID, without private keys
    pub fn list(&self) -> Result<Vec<Tunnel>> {
        let mut tunnels = Vec::new();
        for stored in self.store.list()? {
            if let Some(tunnel) = self.pending.visible(stored)? {
                tunnels.push(tunnel.redacted());
            }
        }
        tunnels.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tunnels)
    }

    /// One tunnel without private keys
    pub fn get(&self, id: &str) -> Result<Tunnel> {
        self.pending
            .visible(self.store.get(id)?)?
            .map(|tunnel| tunnel.redacted())
            .ok_or_else(|| GuardError::tunnel_not_found(id))
    }

    /// Add a peer to a tunnel and install it on the device
    pub async fn new_peer(&self, ctx: &Context, req: NewPeer) -> Result<NewPeerResult> {
        validation::validate_id(&req.peer_id)?;
        let extra_ips = req
            .allowed_ips
            .iter()
            .map(|ip| validation::parse_cidr(ip).map(|net| net.trunc()))
            .collect::<Result<Vec<_>>>()?;
        let dns = req
            .dns
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        let _guard = self.locks.lock(&req.tunnel_id).await;
        let previous = self.store.get(&req.tunnel_id)?;
        if previous.has_peer(&req.peer_id) {
            return Err(GuardError::peer_exists(&req.peer_id));
        }
        previous.check_routes(&req.peer_id, &extra_ips)?;

        let mut allocator = AddressAllocator::for_tunnel(&previous);
        let address = match &req.address {
            Some(requested) => allocator.reserve(validation::parse_host(requested)?)?,
            None => allocator.allocate()?,
        };

        let keypair = KeyPair::generate()?;
        let mut allowed_ips = vec![host_net(address)];
        allowed_ips.extend(extra_ips);
        let peer = Peer {
            id: req.peer_id.clone(),
            private_key: Some(keypair.private),
            public_key: keypair.public,
            allowed_ips,
            dns,
        };

        let mut updated = previous.clone();
        updated.peers.push(peer.redacted());
        updated.validate()?;

        ctx.check("new peer")?;
        self.replace(&previous, &updated).await?;

        info!(
            "Added peer '{}' to tunnel '{}' at {}",
            peer.id, updated.id, address
        );
        Ok(NewPeerResult {
            peer,
            tunnel: updated.redacted(),
        })
    }

    /// Remove a peer from a tunnel and from the device
    pub async fn delete_peer(&self, ctx: &Context, tunnel_id: &str, peer_id: &str) -> Result<Tunnel> {
        let _guard = self.locks.lock(tunnel_id).await;
        let previous = self.store.get(tunnel_id)?;

        let mut updated = previous.clone();
        updated
            .remove_peer(peer_id)
            .ok_or_else(|| GuardError::peer_not_found(peer_id))?;

        ctx.check("delete peer")?;
        self.replace(&previous, &updated).await?;

        info!("Removed peer '{}' from tunnel '{}'", peer_id, tunnel_id);
        Ok(updated.redacted())
    }

    /// Re-apply every stored tunnel onto the device.
    ///
    /// Returns the number of tunnels that failed; failures are logged and do
    /// not stop the remaining tunnels.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let mut failed = 0;

        for tunnel in self.store.list()? {
            let _guard = self.locks.lock(&tunnel.id).await;
            // Re-read under the lock so a concurrent mutation is not undone
            let current = match self.store.get(&tunnel.id) {
                Ok(current) => current,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            if let Err(e) = self.apply(&current).await {
                error!("Failed to reconcile tunnel '{}': {}", current.id, e);
                failed += 1;
            }
        }

        Ok(failed)
    }

    /// Make sure the daemon's own tunnel exists
    pub async fn ensure_guard_tunnel(&self, config: &ServerConfig) -> Result<Tunnel> {
        let req = CreateTunnel {
            id: config.guard_tunnel.clone(),
            address: config.guard_address()?,
            endpoint: config.guard_endpoint()?,
        };

        match self.create(&Context::background(), req).await {
            Ok(tunnel) => Ok(tunnel.redacted()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Guard tunnel '{}' already present", config.guard_tunnel);
                self.get(&config.guard_tunnel)
            }
            Err(e) => Err(e),
        }
    }

    /// Pick a listen port and insert the record in one step
    fn insert_with_port(&self, tunnel: &mut Tunnel) -> Result<()> {
        let _ports = self
            .ports
            .lock()
            .map_err(|_| GuardError::Infrastructure("listen port lock poisoned".to_string()))?;

        let used: BTreeSet<u16> = self
            .store
            .list()?
            .iter()
            .filter(|t| t.id != tunnel.id)
            .map(|t| t.listen_port)
            .collect();
        tunnel.listen_port = (self.base_listen_port..=u16::MAX)
            .find(|port| !used.contains(port))
            .ok_or_else(|| {
                GuardError::Infrastructure(format!(
                    "No free listen port at or above {}",
                    self.base_listen_port
                ))
            })?;

        tunnel.validate()?;
        self.store.create(tunnel)
    }

    /// Store `updated` and reconcile it, restoring `previous` on failure
    async fn replace(&self, previous: &Tunnel, updated: &Tunnel) -> Result<()> {
        let _pending = self.pending.begin(&updated.id, Some(previous.clone()))?;
        self.store.put(updated)?;
        if let Err(e) = self.apply(updated).await {
            return Err(self.rollback(&updated.id, Some(previous), e).await);
        }
        Ok(())
    }

    /// Undo a store write after the device rejected it.
    ///
    /// Returns the error to report: the original cause, or an infrastructure
    /// error when the store itself could not be restored.
    async fn rollback(&self, id: &str, previous: Option<&Tunnel>, cause: GuardError) -> GuardError {
        warn!("Rolling back tunnel '{}' after: {}", id, cause);

        let restored = match previous {
            Some(tunnel) => self.store.put(tunnel),
            None => self.store.delete(id),
        };
        if let Err(e) = restored {
            error!("Rollback of tunnel '{}' failed: {}", id, e);
            return GuardError::Infrastructure(format!(
                "Rollback of tunnel '{}' failed: {} (after: {})",
                id, e, cause
            ));
        }

        let repaired = match previous {
            Some(tunnel) => self.apply(tunnel).await,
            None => self.teardown(id).await,
        };
        if let Err(e) = repaired {
            warn!("Device '{}' not restored after rollback: {}", id, e);
        }

        cause
    }

    async fn apply(&self, tunnel: &Tunnel) -> Result<()> {
        let reconciler = self.reconciler.clone();
        let tunnel = tunnel.clone();
        tokio::task::spawn_blocking(move || reconciler.apply(&tunnel))
            .await
            .map_err(|e| GuardError::Infrastructure(format!("Device task failed: {}", e)))?
    }

    async fn teardown(&self, id: &str) -> Result<()> {
        let reconciler = self.reconciler.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || reconciler.teardown(&id))
            .await
            .map_err(|e| GuardError::Infrastructure(format!("Device task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceBackend, MemoryBackend, MockDeviceBackend};
    use crate::store::MemoryStore;
    use mockall::Sequence;

    fn create_req(id: &str, address: &str) -> CreateTunnel {
        CreateTunnel {
            id: id.to_string(),
            address: address.to_string(),
            endpoint: "1.2.3.4:51820".to_string(),
        }
    }

    fn peer_req(tunnel: &str, peer: &str) -> NewPeer {
        NewPeer {
            tunnel_id: tunnel.to_string(),
            peer_id: peer.to_string(),
            address: None,
            dns: None,
            allowed_ips: vec![],
        }
    }

    fn manager_with(backend: Arc<dyn DeviceBackend>) -> (LifecycleManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let manager = LifecycleManager::new(store.clone(), Reconciler::new(backend), 51820);
        (manager, store)
    }

    #[tokio::test]
    async fn test_create_then_first_peer() {
        let (manager, _) = manager_with(Arc::new(MemoryBackend::new()));
        let ctx = Context::background();

        let tunnel = manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();
        assert_eq!(tunnel.address.to_string(), "10.0.0.1/24");
        assert!(tunnel.private_key.is_some());
        assert!(tunnel.peers.is_empty());

        let created = manager.new_peer(&ctx, peer_req("t0", "p0")).await.unwrap();
        assert_eq!(created.peer.allowed_ips[0].to_string(), "10.0.0.2/32");
        assert!(created.peer.private_key.is_some());
        assert!(created.tunnel.private_key.is_none());
        assert!(created.tunnel.peers[0].private_key.is_none());
    }

    #[tokio::test]
    async fn test_listen_ports_are_distinct() {
        let (manager, _) = manager_with(Arc::new(MemoryBackend::new()));
        let ctx = Context::background();

        let t0 = manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();
        let t1 = manager.create(&ctx, create_req("t1", "10.1.0.1/24")).await.unwrap();
        assert_eq!(t0.listen_port, 51820);
        assert_eq!(t1.listen_port, 51821);

        manager.delete(&ctx, "t0").await.unwrap();
        let t2 = manager.create(&ctx, create_req("t2", "10.2.0.1/24")).await.unwrap();
        assert_eq!(t2.listen_port, 51820);
    }

    #[tokio::test]
    async fn test_create_apply_failure_removes_record() {
        let mut backend = MockDeviceBackend::new();
        let mut seq = Sequence::new();
        backend
            .expect_apply()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|d| {
                Err(GuardError::Device {
                    tunnel: d.interface.clone(),
                    message: "no kernel module".to_string(),
                })
            });
        backend
            .expect_teardown()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (manager, store) = manager_with(Arc::new(backend));
        let err = manager
            .create(&Context::background(), create_req("t0", "10.0.0.1/24"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_peer_apply_failure_restores_previous() {
        let backend = Arc::new(MemoryBackend::new());
        let (manager, store) = manager_with(backend.clone());
        let ctx = Context::background();

        manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();
        manager.new_peer(&ctx, peer_req("t0", "p0")).await.unwrap();
        let before = store.get("t0").unwrap();

        backend.fail_next_applies(1);
        let err = manager.new_peer(&ctx, peer_req("t0", "p1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);

        assert_eq!(store.get("t0").unwrap(), before);
        let device = backend.device("t0").unwrap();
        assert_eq!(device, crate::device::DeviceState::from_tunnel(&before).unwrap());
    }

    #[tokio::test]
    async fn test_rollback_store_failure_is_infrastructure() {
        let mut backend = MockDeviceBackend::new();
        backend.expect_apply().returning(|d| {
            Err(GuardError::Device {
                tunnel: d.interface.clone(),
                message: "boom".to_string(),
            })
        });
        backend.expect_teardown().returning(|_| Ok(()));

        struct ForgetfulStore(MemoryStore);
        impl TunnelStore for ForgetfulStore {
            fn get(&self, id: &str) -> Result<Tunnel> {
                self.0.get(id)
            }
            fn create(&self, tunnel: &Tunnel) -> Result<()> {
                self.0.create(tunnel)
            }
            fn put(&self, tunnel: &Tunnel) -> Result<()> {
                self.0.put(tunnel)
            }
            fn delete(&self, _id: &str) -> Result<()> {
                Err(GuardError::Infrastructure("disk gone".to_string()))
            }
            fn list(&self) -> Result<Vec<Tunnel>> {
                self.0.list()
            }
        }

        let manager = LifecycleManager::new(
            Arc::new(ForgetfulStore(MemoryStore::new())),
            Reconciler::new(Arc::new(backend)),
            51820,
        );
        let err = manager
            .create(&Context::background(), create_req("t0", "10.0.0.1/24"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn test_delete_teardown_failure_keeps_record() {
        let backend = Arc::new(MemoryBackend::new());
        let (manager, store) = manager_with(backend.clone());
        let ctx = Context::background();

        manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();
        backend.fail_next_teardowns(1);

        let err = manager.delete(&ctx, "t0").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Device);
        assert!(store.get("t0").is_ok());
        assert!(backend.device("t0").is_some());
    }

    #[tokio::test]
    async fn test_requested_address() {
        let (manager, _) = manager_with(Arc::new(MemoryBackend::new()));
        let ctx = Context::background();
        manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();

        let mut req = peer_req("t0", "p0");
        req.address = Some("10.0.0.50".to_string());
        req.allowed_ips = vec!["192.168.10.0/24".to_string()];
        let created = manager.new_peer(&ctx, req).await.unwrap();
        let ips: Vec<String> = created.peer.allowed_ips.iter().map(|n| n.to_string()).collect();
        assert_eq!(ips, vec!["10.0.0.50/32", "192.168.10.0/24"]);

        let mut taken = peer_req("t0", "p1");
        taken.address = Some("10.0.0.50/32".to_string());
        let err = manager.new_peer(&ctx, taken).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressConflict);

        let mut outside = peer_req("t0", "p2");
        outside.address = Some("10.9.0.5".to_string());
        let err = manager.new_peer(&ctx, outside).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_cancelled_request_touches_nothing() {
        let mut backend = MockDeviceBackend::new();
        backend.expect_apply().never();
        let (manager, store) = manager_with(Arc::new(backend));

        let ctx = Context::background();
        ctx.cancel();
        let err = manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(store.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_guard_tunnel_is_idempotent() {
        let (manager, _) = manager_with(Arc::new(MemoryBackend::new()));
        let config = ServerConfig::default();

        let first = manager.ensure_guard_tunnel(&config).await.unwrap();
        assert_eq!(first.id, "guard0");
        assert_eq!(first.address.to_string(), "10.199.199.1/24");
        assert_eq!(first.endpoint, "127.0.0.1:10100");

        let second = manager.ensure_guard_tunnel(&config).await.unwrap();
        assert_eq!(second, first);
        assert!(second.private_key.is_none());
    }

    #[tokio::test]
    async fn test_reconcile_all_rebuilds_devices() {
        let store = Arc::new(MemoryStore::new());
        let first = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(store.clone(), Reconciler::new(first), 51820);
        let ctx = Context::background();
        manager.create(&ctx, create_req("t0", "10.0.0.1/24")).await.unwrap();
        manager.create(&ctx, create_req("t1", "10.1.0.1/24")).await.unwrap();

        // Same store, fresh device as after a reboot
        let rebooted = Arc::new(MemoryBackend::new());
        let manager = LifecycleManager::new(store, Reconciler::new(rebooted.clone()), 51820);
        assert_eq!(manager.reconcile_all().await.unwrap(), 0);
        assert_eq!(rebooted.interfaces(), vec!["t0", "t1"]);
    }
}
