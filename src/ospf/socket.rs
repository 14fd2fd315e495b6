use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use super::packet::{ALL_SPF_ROUTERS, IP_PROTO_OSPF};

/// Raw IP socket speaking protocol 89, joined to AllSPFRouters per interface.
/// Reads strip the IPv4 header; writes let the kernel build it.
pub struct OspfSocket {
    inner: AsyncFd<Socket>,
}

impl OspfSocket {
    pub fn new() -> io::Result<Self> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(IP_PROTO_OSPF)),
        )?;
        socket.set_nonblocking(true)?;
        socket.set_multicast_ttl_v4(1)?;
        socket.set_multicast_loop_v4(false)?;
        Ok(Self {
            inner: AsyncFd::new(socket)?,
        })
    }

    /// Join AllSPFRouters on the interface owning `local`
    pub fn join(&self, local: Ipv4Addr) -> io::Result<()> {
        self.inner.get_ref().join_multicast_v4(&ALL_SPF_ROUTERS, &local)
    }

    /// Receive one OSPF packet, returning (payload, source address)
    pub async fn recv(&self) -> io::Result<(Vec<u8>, Ipv4Addr)> {
        loop {
            let mut guard = self.inner.readable().await?;
            let mut buf = [MaybeUninit::<u8>::uninit(); 65535];
            match guard.try_io(|inner| inner.get_ref().recv_from(&mut buf)) {
                Ok(Ok((len, addr))) => {
                    let src = addr
                        .as_socket_ipv4()
                        .map(|sa| *sa.ip())
                        .unwrap_or(Ipv4Addr::UNSPECIFIED);
                    let datagram: Vec<u8> = buf[..len]
                        .iter()
                        .map(|byte| unsafe { byte.assume_init() })
                        .collect();
                    match strip_ip_header(&datagram) {
                        Some(payload) => return Ok((payload.to_vec(), src)),
                        None => continue, // Runt datagram, ignore
                    }
                }
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }

    /// Send an OSPF payload; multicast sends pick the egress interface
    /// via the local interface address
    pub async fn send_to(
        &self,
        payload: &[u8],
        local: Ipv4Addr,
        dst: Ipv4Addr,
    ) -> io::Result<usize> {
        if dst.is_multicast() {
            self.inner.get_ref().set_multicast_if_v4(&local)?;
        }
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send_to(payload, &addr)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// Raw IPv4 sockets deliver the IP header with the payload
fn strip_ip_header(datagram: &[u8]) -> Option<&[u8]> {
    let first = *datagram.first()?;
    if first >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(first & 0x0f) * 4;
    if header_len < 20 || datagram.len() < header_len {
        return None;
    }
    Some(&datagram[header_len..])
}
