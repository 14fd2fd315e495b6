use std::net::IpAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::IpNetwork;
use log::trace;
use netlink_packet_route::route::Nla;
use netlink_packet_route::RouteMessage;
use rtnetlink::{Handle, IpVersion};

use super::{FibBackend, FibError, FibRoute, SourceProtocol};

/// rtm_protocol value tagging routes this agent owns; chosen from the
/// >RTPROT_STATIC space left to routing daemons
pub const ROUTE_PROTOCOL_TAG: u8 = 189;

/// Kernel FIB backend over rtnetlink. Every route is stamped with our
/// protocol tag so list/remove only ever see our own routes.
pub struct NetlinkFib {
    handle: Handle,
}

impl NetlinkFib {
    pub fn new() -> Result<Self, FibError> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|err| FibError::Backend(err.to_string()))?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    async fn find_owned(&self, prefix: &IpNetwork) -> Result<Option<RouteMessage>, FibError> {
        let version = match prefix {
            IpNetwork::V4(_) => IpVersion::V4,
            IpNetwork::V6(_) => IpVersion::V6,
        };
        let mut routes = self.handle.route().get(version).execute();
        while let Some(message) = routes
            .try_next()
            .await
            .map_err(|err| FibError::Backend(err.to_string()))?
        {
            if message.header.protocol != ROUTE_PROTOCOL_TAG {
                continue;
            }
            if message_prefix(&message).as_ref() == Some(prefix) {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl FibBackend for NetlinkFib {
    async fn replace(&self, route: &FibRoute) -> Result<(), FibError> {
        trace!("netlink replace {} via {}", route.prefix, route.next_hop);
        match (route.prefix, route.next_hop) {
            (IpNetwork::V4(prefix), IpAddr::V4(next_hop)) => {
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .replace()
                    .destination_prefix(prefix.network(), prefix.prefix())
                    .gateway(next_hop);
                request.message_mut().header.protocol = ROUTE_PROTOCOL_TAG;
                request.message_mut().nlas.push(Nla::Priority(route.metric));
                request
                    .execute()
                    .await
                    .map_err(|err| FibError::Backend(err.to_string()))
            }
            (IpNetwork::V6(prefix), IpAddr::V6(next_hop)) => {
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .replace()
                    .destination_prefix(prefix.network(), prefix.prefix())
                    .gateway(next_hop);
                request.message_mut().header.protocol = ROUTE_PROTOCOL_TAG;
                request.message_mut().nlas.push(Nla::Priority(route.metric));
                request
                    .execute()
                    .await
                    .map_err(|err| FibError::Backend(err.to_string()))
            }
            _ => Err(FibError::Backend(format!(
                "Address family mismatch: {} via {}",
                route.prefix, route.next_hop
            ))),
        }
    }

    async fn remove(&self, route: &FibRoute) -> Result<(), FibError> {
        trace!("netlink remove {}", route.prefix);
        match self.find_owned(&route.prefix).await? {
            Some(message) => self
                .handle
                .route()
                .del(message)
                .execute()
                .await
                .map_err(|err| FibError::Backend(err.to_string())),
            None => Ok(()), // Already gone; removal is idempotent
        }
    }

    async fn list_owned(&self) -> Result<Vec<FibRoute>, FibError> {
        let mut owned = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = self.handle.route().get(version).execute();
            while let Some(message) = routes
                .try_next()
                .await
                .map_err(|err| FibError::Backend(err.to_string()))?
            {
                if message.header.protocol != ROUTE_PROTOCOL_TAG {
                    continue;
                }
                let (Some(prefix), Some(next_hop)) =
                    (message_prefix(&message), message.gateway())
                else {
                    continue;
                };
                owned.push(FibRoute {
                    prefix,
                    next_hop,
                    metric: 0,
                    // The winning source is recomputed after reconcile
                    source: SourceProtocol::Bgp,
                });
            }
        }
        Ok(owned)
    }
}

fn message_prefix(message: &RouteMessage) -> Option<IpNetwork> {
    let (addr, len) = message.destination_prefix()?;
    IpNetwork::new(addr, len).ok()
}
