// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multicast receive sockets: creation, subscription pooling, and the
//! packet-info-aware receive path.
//!
//! Sockets are pooled: up to [`MAX_SUBS_PER_SOCKET`] universe subscriptions
//! share one socket per address family before another is created (a single
//! one on limit-bind platforms). Group joins/leaves and socket teardown are
//! queued here and applied by the owning receive thread at the top of each
//! cycle, so memberships are never manipulated from a thread that doesn't
//! own the socket.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::UdpSocket;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{IpSupport, MAX_SUBS_PER_SOCKET, RECEIVER_LIMIT_BIND, SACN_PORT};
use crate::error::{Error, Result};
use crate::protocol::{multicast_v4, multicast_v6};
use crate::transport::netint::{IpType, SysNetint};

/// Where a datagram came from: source address plus arrival interface.
/// An `ifindex` of 0 means the platform could not report the interface.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecvMeta {
    pub src: SocketAddr,
    pub ifindex: u32,
}

/// One pooled receive socket.
pub(crate) struct SocketRef {
    pub token: usize,
    pub socket: UdpSocket,
    pub ip_type: IpType,
    /// Number of universe subscriptions sharing this socket.
    pub refcount: usize,
    /// Not yet registered with the owning thread's poll.
    pub pending: bool,
}

/// A socket whose subscriptions drained; closed by the owning thread.
struct DeadSocket {
    socket: UdpSocket,
    registered: bool,
}

/// A queued multicast membership operation.
struct GroupReq {
    token: usize,
    group: IpAddr,
    iface_index: u32,
    iface_v4: Option<Ipv4Addr>,
}

/// Per-receive-thread socket state. Mutated under the engine lock; the
/// queued operations are applied by the owning thread.
#[derive(Default)]
pub(crate) struct SocketPool {
    pub refs: Vec<SocketRef>,
    dead: Vec<DeadSocket>,
    subscribes: Vec<GroupReq>,
    unsubscribes: Vec<GroupReq>,
    next_token: usize,
}

impl SocketPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Subscribe a universe on every matching interface, reusing a pooled
    /// socket when one has room. Returns the socket token the subscription
    /// landed on, or `None` if no interface matches the address family.
    pub(crate) fn subscribe_universe(
        &mut self,
        ip_type: IpType,
        universe: u16,
        netints: &[SysNetint],
    ) -> Result<Option<usize>> {
        if !netints.iter().any(|n| n.id.ip_type == ip_type) {
            return Ok(None);
        }

        let token = match self.find_socket(ip_type) {
            Some(token) => token,
            None => self.create_socket(ip_type)?,
        };

        for netint in netints.iter().filter(|n| n.id.ip_type == ip_type) {
            self.subscribes.push(GroupReq {
                token,
                group: group_for(ip_type, universe),
                iface_index: netint.id.index,
                iface_v4: match netint.addr {
                    IpAddr::V4(a) => Some(a),
                    IpAddr::V6(_) => None,
                },
            });
        }

        if let Some(entry) = self.refs.iter_mut().find(|r| r.token == token) {
            entry.refcount += 1;
        }
        Ok(Some(token))
    }

    /// Subscribe a universe on every supported address family, undoing any
    /// partial work on failure. Returns the socket tokens used (empty means
    /// no interface matched either family).
    pub(crate) fn subscribe_all(
        &mut self,
        ip_supported: IpSupport,
        universe: u16,
        netints: &[SysNetint],
    ) -> Result<Vec<usize>> {
        let mut tokens = Vec::new();
        let families = [
            (ip_supported.includes_v4(), IpType::V4),
            (ip_supported.includes_v6(), IpType::V6),
        ];
        for (wanted, ip_type) in families {
            if !wanted {
                continue;
            }
            match self.subscribe_universe(ip_type, universe, netints) {
                Ok(Some(token)) => tokens.push(token),
                Ok(None) => {}
                Err(e) => {
                    for &token in &tokens {
                        self.unsubscribe_universe(token, universe, netints);
                    }
                    return Err(e);
                }
            }
        }
        Ok(tokens)
    }

    /// Unsubscribe a universe from its socket. When the last subscription
    /// drains, the socket is queued for closure instead of leaving groups
    /// one by one.
    pub(crate) fn unsubscribe_universe(
        &mut self,
        token: usize,
        universe: u16,
        netints: &[SysNetint],
    ) {
        let Some(index) = self.refs.iter().position(|r| r.token == token) else {
            return;
        };

        if self.refs[index].refcount <= 1 {
            self.subscribes.retain(|req| req.token != token);
            self.unsubscribes.retain(|req| req.token != token);
            let entry = self.refs.remove(index);
            self.dead.push(DeadSocket {
                socket: entry.socket,
                registered: !entry.pending,
            });
            return;
        }

        let ip_type = self.refs[index].ip_type;
        self.refs[index].refcount -= 1;
        for netint in netints.iter().filter(|n| n.id.ip_type == ip_type) {
            self.unsubscribes.push(GroupReq {
                token,
                group: group_for(ip_type, universe),
                iface_index: netint.id.index,
                iface_v4: match netint.addr {
                    IpAddr::V4(a) => Some(a),
                    IpAddr::V6(_) => None,
                },
            });
        }
    }

    /// Tear everything down (deinit / networking reset).
    pub(crate) fn close_all(&mut self) {
        self.subscribes.clear();
        self.unsubscribes.clear();
        for entry in self.refs.drain(..) {
            self.dead.push(DeadSocket {
                socket: entry.socket,
                registered: !entry.pending,
            });
        }
    }

    /// Applied by the owning thread at the top of each cycle: register new
    /// sockets, apply queued joins/leaves, close dead sockets.
    pub(crate) fn apply_pending(&mut self, registry: &mio::Registry) {
        for entry in self.refs.iter_mut().filter(|r| r.pending) {
            match registry.register(&mut entry.socket, mio::Token(entry.token), mio::Interest::READABLE)
            {
                Ok(()) => entry.pending = false,
                Err(e) => {
                    log::debug!("[SOCKETS] register failed token={}: {}", entry.token, e);
                }
            }
        }

        for req in self.subscribes.drain(..) {
            if let Some(entry) = self.refs.iter().find(|r| r.token == req.token) {
                match change_membership(&entry.socket, &req, true) {
                    Ok(()) => log::debug!(
                        "[SOCKETS] joined {} on ifindex {}",
                        req.group,
                        req.iface_index
                    ),
                    // Per-interface failures are non-fatal; other
                    // interfaces may still deliver.
                    Err(e) => log::debug!(
                        "[SOCKETS] join {} on ifindex {} failed: {}",
                        req.group,
                        req.iface_index,
                        e
                    ),
                }
            }
        }

        for req in self.unsubscribes.drain(..) {
            if let Some(entry) = self.refs.iter().find(|r| r.token == req.token) {
                if let Err(e) = change_membership(&entry.socket, &req, false) {
                    log::debug!(
                        "[SOCKETS] leave {} on ifindex {} failed: {}",
                        req.group,
                        req.iface_index,
                        e
                    );
                }
            }
        }

        for mut entry in self.dead.drain(..) {
            if entry.registered {
                if let Err(e) = registry.deregister(&mut entry.socket) {
                    log::debug!("[SOCKETS] deregister failed: {}", e);
                }
            }
            // Dropping the socket closes it and leaves its groups.
        }
    }

    pub(crate) fn socket_by_token(&self, token: usize) -> Option<&SocketRef> {
        self.refs.iter().find(|r| r.token == token)
    }

    fn find_socket(&self, ip_type: IpType) -> Option<usize> {
        self.refs
            .iter()
            .find(|r| {
                r.ip_type == ip_type
                    && (RECEIVER_LIMIT_BIND || r.refcount < MAX_SUBS_PER_SOCKET)
            })
            .map(|r| r.token)
    }

    fn create_socket(&mut self, ip_type: IpType) -> Result<usize> {
        let socket = create_receive_socket(ip_type).map_err(Error::Sys)?;
        let token = self.next_token;
        self.next_token += 1;
        self.refs.push(SocketRef {
            token,
            socket,
            ip_type,
            refcount: 0,
            pending: true,
        });
        log::debug!("[SOCKETS] created {:?} receive socket token={}", ip_type, token);
        Ok(token)
    }
}

fn group_for(ip_type: IpType, universe: u16) -> IpAddr {
    match ip_type {
        IpType::V4 => IpAddr::V4(multicast_v4(universe)),
        IpType::V6 => IpAddr::V6(multicast_v6(universe)),
    }
}

/// Create a nonblocking socket bound to the sACN port with address reuse,
/// ready for multicast memberships and packet-info reception.
fn create_receive_socket(ip_type: IpType) -> io::Result<UdpSocket> {
    let domain = match ip_type {
        IpType::V4 => Domain::IPV4,
        IpType::V6 => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr: SocketAddr = match ip_type {
        IpType::V4 => (Ipv4Addr::UNSPECIFIED, SACN_PORT).into(),
        IpType::V6 => {
            socket.set_only_v6(true)?;
            (Ipv6Addr::UNSPECIFIED, SACN_PORT).into()
        }
    };
    enable_pktinfo(&socket, ip_type)?;
    socket.bind(&bind_addr.into())?;

    Ok(UdpSocket::from_std(socket.into()))
}

// ===== Platform layer (packet info + memberships) =====

#[cfg(target_os = "linux")]
fn enable_pktinfo(socket: &Socket, ip_type: IpType) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let (level, option) = match ip_type {
        IpType::V4 => (libc::IPPROTO_IP, libc::IP_PKTINFO),
        IpType::V6 => (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO),
    };
    let on: libc::c_int = 1;
    // SAFETY: setsockopt on a live fd with a correctly sized int option.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            std::ptr::addr_of!(on).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn enable_pktinfo(_socket: &Socket, _ip_type: IpType) -> io::Result<()> {
    // Arrival-interface reporting degrades gracefully (ifindex 0).
    Ok(())
}

/// Receive one datagram with its packet info. Linux reads control messages
/// through recvmsg; elsewhere the interface index is reported as 0.
#[cfg(target_os = "linux")]
pub(crate) fn recv_with_pktinfo(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, RecvMeta)> {
    use std::os::unix::io::AsRawFd;

    let mut addr_storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = [0u8; 128];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(addr_storage).cast();
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len();

    // SAFETY: msghdr points at stack buffers that outlive the call; the fd
    // is owned by `socket`.
    let received = unsafe { libc::recvmsg(socket.as_raw_fd(), &mut msg, 0) };
    if received < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut ifindex = 0u32;
    // SAFETY: CMSG_* walk the control buffer recvmsg just filled, bounded
    // by msg_controllen.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let header = &*cmsg;
            if header.cmsg_level == libc::IPPROTO_IP && header.cmsg_type == libc::IP_PKTINFO {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                ifindex = info.ipi_ifindex as u32;
            } else if header.cmsg_level == libc::IPPROTO_IPV6
                && header.cmsg_type == libc::IPV6_PKTINFO
            {
                let info = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                ifindex = info.ipi6_ifindex;
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let src = sockaddr_to_socketaddr(&addr_storage).unwrap_or_else(|| {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    });
    Ok((received as usize, RecvMeta { src, ifindex }))
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn recv_with_pktinfo(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, RecvMeta)> {
    let (len, src) = socket.recv_from(buf)?;
    Ok((len, RecvMeta { src, ifindex: 0 }))
}

#[cfg(target_os = "linux")]
fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: family checked; sockaddr_in fits in sockaddr_storage.
            let sin = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::from((ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            // SAFETY: family checked; sockaddr_in6 fits in sockaddr_storage.
            let sin6 = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::from((ip, u16::from_be(sin6.sin6_port))))
        }
        _ => None,
    }
}

/// Join or leave a multicast group on one interface.
#[cfg(unix)]
fn change_membership(socket: &UdpSocket, req: &GroupReq, join: bool) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let rc = match req.group {
        IpAddr::V4(group) => {
            let mreq = libc::ip_mreq {
                imr_multiaddr: libc::in_addr {
                    s_addr: u32::from(group).to_be(),
                },
                imr_interface: libc::in_addr {
                    s_addr: u32::from(req.iface_v4.unwrap_or(Ipv4Addr::UNSPECIFIED)).to_be(),
                },
            };
            let option = if join {
                libc::IP_ADD_MEMBERSHIP
            } else {
                libc::IP_DROP_MEMBERSHIP
            };
            // SAFETY: setsockopt with a correctly sized ip_mreq.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IP,
                    option,
                    std::ptr::addr_of!(mreq).cast(),
                    std::mem::size_of::<libc::ip_mreq>() as libc::socklen_t,
                )
            }
        }
        IpAddr::V6(group) => {
            let mreq = libc::ipv6_mreq {
                ipv6mr_multiaddr: libc::in6_addr {
                    s6_addr: group.octets(),
                },
                ipv6mr_interface: req.iface_index,
            };
            #[cfg(target_os = "linux")]
            let option = if join {
                libc::IPV6_ADD_MEMBERSHIP
            } else {
                libc::IPV6_DROP_MEMBERSHIP
            };
            #[cfg(not(target_os = "linux"))]
            let option = if join {
                libc::IPV6_JOIN_GROUP
            } else {
                libc::IPV6_LEAVE_GROUP
            };
            // SAFETY: setsockopt with a correctly sized ipv6_mreq.
            unsafe {
                libc::setsockopt(
                    fd,
                    libc::IPPROTO_IPV6,
                    option,
                    std::ptr::addr_of!(mreq).cast(),
                    std::mem::size_of::<libc::ipv6_mreq>() as libc::socklen_t,
                )
            }
        }
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn change_membership(_socket: &UdpSocket, _req: &GroupReq, _join: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "multicast membership management is unix-only",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn netint(index: u32, ip_type: IpType, addr: &str) -> SysNetint {
        SysNetint {
            id: crate::transport::netint::NetintId { index, ip_type },
            addr: addr.parse().unwrap(),
            name: format!("if{}", index),
        }
    }

    #[test]
    fn test_pool_shares_and_retires_sockets() {
        let mut pool = SocketPool::new();
        let netints = vec![netint(2, IpType::V4, "192.0.2.1")];

        let t1 = pool
            .subscribe_universe(IpType::V4, 1, &netints)
            .unwrap()
            .unwrap();
        let t2 = pool
            .subscribe_universe(IpType::V4, 2, &netints)
            .unwrap()
            .unwrap();
        assert_eq!(t1, t2, "subscriptions share a pooled socket");
        assert_eq!(pool.refs.len(), 1);
        assert_eq!(pool.refs[0].refcount, 2);
        assert_eq!(pool.subscribes.len(), 2);

        pool.unsubscribe_universe(t1, 1, &netints);
        assert_eq!(pool.refs[0].refcount, 1);

        pool.unsubscribe_universe(t2, 2, &netints);
        assert!(pool.refs.is_empty(), "last unsubscribe retires the socket");
        assert!(pool.subscribes.is_empty(), "queued ops for dead sockets are dropped");
        assert_eq!(pool.dead.len(), 1);
    }

    #[test]
    fn test_pool_overflow_creates_second_socket() {
        if RECEIVER_LIMIT_BIND {
            return; // one socket per family on this platform
        }
        let mut pool = SocketPool::new();
        let netints = vec![netint(2, IpType::V4, "192.0.2.1")];

        let mut tokens = Vec::new();
        for universe in 1..=(MAX_SUBS_PER_SOCKET as u16 + 1) {
            tokens.push(
                pool.subscribe_universe(IpType::V4, universe, &netints)
                    .unwrap()
                    .unwrap(),
            );
        }
        assert_eq!(pool.refs.len(), 2);
        assert_ne!(tokens[0], *tokens.last().unwrap());
    }

    #[test]
    fn test_family_without_netints_is_skipped() {
        let mut pool = SocketPool::new();
        let netints = vec![netint(2, IpType::V4, "192.0.2.1")];
        let token = pool.subscribe_universe(IpType::V6, 1, &netints).unwrap();
        assert!(token.is_none());
        assert!(pool.refs.is_empty());
    }
}
