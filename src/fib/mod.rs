#[cfg(target_os = "linux")]
pub mod netlink;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::IpAddr;

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use log::{debug, info, trace, warn};

use crate::rib::NextHopResolver;

/// Install attempts per route before marking it failed
const MAX_INSTALL_ATTEMPTS: u8 = 3;

/// Which protocol claims a prefix; lower rank is preferred
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SourceProtocol {
    Connected,
    Ospf,
    Bgp,
}

impl SourceProtocol {
    fn rank(self) -> u8 {
        match self {
            SourceProtocol::Connected => 0,
            SourceProtocol::Ospf => 1,
            SourceProtocol::Bgp => 2,
        }
    }

    const ALL: [SourceProtocol; 3] = [
        SourceProtocol::Connected,
        SourceProtocol::Ospf,
        SourceProtocol::Bgp,
    ];
}

impl fmt::Display for SourceProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SourceProtocol::Connected => write!(f, "connected"),
            SourceProtocol::Ospf => write!(f, "ospf"),
            SourceProtocol::Bgp => write!(f, "bgp"),
        }
    }
}

/// One kernel-installable route
#[derive(Clone, Debug, PartialEq)]
pub struct FibRoute {
    pub prefix: IpNetwork,
    pub next_hop: IpAddr,
    pub metric: u32,
    pub source: SourceProtocol,
}

#[derive(Debug)]
pub enum FibError {
    Io(io::Error),
    Backend(String),
}

impl fmt::Display for FibError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FibError::Io(err) => write!(f, "FIB I/O error: {}", err),
            FibError::Backend(reason) => write!(f, "FIB backend error: {}", reason),
        }
    }
}

impl std::error::Error for FibError {}

impl From<io::Error> for FibError {
    fn from(err: io::Error) -> Self {
        FibError::Io(err)
    }
}

/// The host's route-manipulation surface. Implementations tag installed
/// routes so the agent only ever touches routes it created itself.
#[async_trait]
pub trait FibBackend: Send + Sync {
    /// Idempotent install/update (kernel route replace, no delete+add gap)
    async fn replace(&self, route: &FibRoute) -> Result<(), FibError>;
    async fn remove(&self, route: &FibRoute) -> Result<(), FibError>;
    /// The tagged subset of host routes, for startup reconciliation
    async fn list_owned(&self) -> Result<Vec<FibRoute>, FibError>;
}

/// In-memory backend: the default on non-Linux hosts and under test
#[derive(Debug, Default)]
pub struct MemoryFib {
    routes: std::sync::Mutex<HashMap<IpNetwork, FibRoute>>,
}

impl MemoryFib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routes(&self) -> Vec<FibRoute> {
        self.routes.lock().expect("FIB lock").values().cloned().collect()
    }
}

#[async_trait]
impl FibBackend for MemoryFib {
    async fn replace(&self, route: &FibRoute) -> Result<(), FibError> {
        self.routes
            .lock()
            .expect("FIB lock")
            .insert(route.prefix, route.clone());
        Ok(())
    }

    async fn remove(&self, route: &FibRoute) -> Result<(), FibError> {
        self.routes.lock().expect("FIB lock").remove(&route.prefix);
        Ok(())
    }

    async fn list_owned(&self) -> Result<Vec<FibRoute>, FibError> {
        Ok(self.routes())
    }
}

#[async_trait]
impl<T: FibBackend> FibBackend for std::sync::Arc<T> {
    async fn replace(&self, route: &FibRoute) -> Result<(), FibError> {
        (**self).replace(route).await
    }

    async fn remove(&self, route: &FibRoute) -> Result<(), FibError> {
        (**self).remove(route).await
    }

    async fn list_owned(&self) -> Result<Vec<FibRoute>, FibError> {
        (**self).list_owned().await
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstallState {
    Installed,
    FailedToInstall,
}

/// Snapshot row for the observable-state API
#[derive(Clone, Debug)]
pub struct InstalledRoute {
    pub route: FibRoute,
    pub state: InstallState,
}

#[derive(Debug, Default)]
struct SinkEntry {
    /// Offered candidate per source protocol
    candidates: HashMap<SourceProtocol, FibRoute>,
    /// What we have pushed to the kernel, if anything
    installed: Option<FibRoute>,
    failed: bool,
}

impl SinkEntry {
    fn winner(&self) -> Option<&FibRoute> {
        SourceProtocol::ALL
            .iter()
            .filter_map(|source| self.candidates.get(source))
            .min_by_key(|route| route.source.rank())
    }
}

/// The cross-protocol installer: tracks per-prefix candidates from the
/// Loc-RIB, the SPF table and connected interfaces, selects a single
/// winner per prefix (Connected > OSPF > BGP), and reconciles the
/// kernel FIB with replace/remove operations.
pub struct Installer {
    backend: Box<dyn FibBackend>,
    sink: HashMap<IpNetwork, SinkEntry>,
}

impl Installer {
    pub fn new(backend: Box<dyn FibBackend>) -> Self {
        Self {
            backend,
            sink: HashMap::new(),
        }
    }

    /// Startup reconciliation: our tag identifies leftovers from a prior
    /// run; the sink is empty, so any tagged route is removed
    pub async fn reconcile(&mut self) -> Result<(), FibError> {
        let leftovers = self.backend.list_owned().await?;
        for route in leftovers {
            info!("Reconcile: removing leftover route {} via {}", route.prefix, route.next_hop);
            self.backend.remove(&route).await?;
        }
        Ok(())
    }

    /// Offer (or withdraw, with `route` = None) a source's candidate for
    /// a prefix, then converge the kernel entry for that prefix
    pub async fn offer(
        &mut self,
        source: SourceProtocol,
        prefix: IpNetwork,
        route: Option<FibRoute>,
    ) {
        let entry = self.sink.entry(prefix).or_default();
        match route {
            Some(route) => {
                entry.candidates.insert(source, route);
            }
            None => {
                entry.candidates.remove(&source);
            }
        }
        self.converge(prefix).await;
    }

    /// Replace the complete candidate set for one source (SPF output,
    /// connected interfaces); prefixes the source no longer claims are
    /// withdrawn with fallback to the next protocol
    pub async fn sync_source(&mut self, source: SourceProtocol, routes: Vec<FibRoute>) {
        let fresh: HashMap<IpNetwork, FibRoute> =
            routes.into_iter().map(|route| (route.prefix, route)).collect();
        let stale: Vec<IpNetwork> = self
            .sink
            .iter()
            .filter(|(prefix, entry)| {
                entry.candidates.contains_key(&source) && !fresh.contains_key(prefix)
            })
            .map(|(prefix, _)| *prefix)
            .collect();
        for prefix in stale {
            self.offer(source, prefix, None).await;
        }
        for (prefix, route) in fresh {
            let current = self
                .sink
                .get(&prefix)
                .and_then(|entry| entry.candidates.get(&source));
            if current != Some(&route) {
                self.offer(source, prefix, Some(route)).await;
            }
        }
    }

    /// Converge the kernel state for one prefix toward its winner
    async fn converge(&mut self, prefix: IpNetwork) {
        let Some(entry) = self.sink.get_mut(&prefix) else {
            return;
        };
        let winner = entry.winner().cloned();
        match winner {
            // Connected prefixes are the kernel's own; ours must go
            Some(route) if route.source == SourceProtocol::Connected => {
                if let Some(installed) = entry.installed.take() {
                    debug!("{} now connected, removing our route", prefix);
                    if let Err(err) = self.backend.remove(&installed).await {
                        warn!("Error removing {}: {}", prefix, err);
                    }
                }
                entry.failed = false;
            }
            Some(route) => {
                if entry.installed.as_ref() == Some(&route) && !entry.failed {
                    return;
                }
                let mut attempts = 0;
                loop {
                    attempts += 1;
                    match self.backend.replace(&route).await {
                        Ok(()) => {
                            trace!("Installed {} via {} [{}]", prefix, route.next_hop, route.source);
                            entry.installed = Some(route);
                            entry.failed = false;
                            break;
                        }
                        Err(err) if attempts < MAX_INSTALL_ATTEMPTS => {
                            debug!("Install retry {} for {}: {}", attempts, prefix, err);
                        }
                        Err(err) => {
                            warn!("Failed to install {} after {} attempts: {}", prefix, attempts, err);
                            entry.failed = true;
                            break;
                        }
                    }
                }
            }
            None => {
                if let Some(installed) = entry.installed.take() {
                    debug!("Removing {} (no remaining candidate)", prefix);
                    if let Err(err) = self.backend.remove(&installed).await {
                        warn!("Error removing {}: {}", prefix, err);
                    }
                }
                entry.failed = false;
            }
        }
        // Drop empty bookkeeping rows
        if let Some(entry) = self.sink.get(&prefix) {
            if entry.candidates.is_empty() && entry.installed.is_none() {
                self.sink.remove(&prefix);
            }
        }
    }

    /// Snapshot of what this agent has pushed (or failed to push)
    pub fn snapshot(&self) -> Vec<InstalledRoute> {
        let mut rows: Vec<InstalledRoute> = self
            .sink
            .values()
            .filter_map(|entry| {
                if let Some(route) = &entry.installed {
                    Some(InstalledRoute {
                        route: route.clone(),
                        state: InstallState::Installed,
                    })
                } else if entry.failed {
                    entry.winner().map(|route| InstalledRoute {
                        route: route.clone(),
                        state: InstallState::FailedToInstall,
                    })
                } else {
                    None
                }
            })
            .collect();
        rows.sort_by_key(|row| (row.route.prefix.ip(), row.route.prefix.prefix()));
        rows
    }
}

/// Next-hop resolution for the BGP decision process: a next-hop is
/// usable when a connected subnet or an OSPF route covers it
impl NextHopResolver for Installer {
    fn resolve(&self, next_hop: IpAddr) -> Option<u32> {
        let mut best: Option<(u8, u32)> = None;
        for entry in self.sink.values() {
            for source in [SourceProtocol::Connected, SourceProtocol::Ospf] {
                if let Some(route) = entry.candidates.get(&source) {
                    if route.prefix.contains(next_hop) {
                        let candidate = (route.prefix.prefix(), route.metric);
                        // Longest prefix wins, then lowest metric
                        let better = match best {
                            None => true,
                            Some((length, metric)) => {
                                candidate.0 > length
                                    || (candidate.0 == length && candidate.1 < metric)
                            }
                        };
                        if better {
                            best = Some(candidate);
                        }
                    }
                }
            }
        }
        best.map(|(_, metric)| metric)
    }
}
