//! ICMP echo packets and the socket they travel over.
//!
//! Privileged sockets are `SOCK_RAW`; IPv4 replies on those carry the IP
//! header in front of the ICMP message. Unprivileged sockets use the kernel
//! ping socket (`SOCK_DGRAM`), which rewrites the identifier to the socket's
//! port and only delivers replies addressed to it.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

pub const ECHO_REQUEST_V4: u8 = 8;
pub const ECHO_REPLY_V4: u8 = 0;
pub const ECHO_REQUEST_V6: u8 = 128;
pub const ECHO_REPLY_V6: u8 = 129;

const HEADER_LEN: usize = 8;
const PAYLOAD: &[u8] = b"gw-failover-probe";

/// Identifier and sequence number of an echo message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub ident: u16,
    pub seq: u16,
}

/// Internet checksum (RFC 1071)
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an echo request for the address family of the target.
///
/// ICMPv6 checksums cover a pseudo-header the kernel fills in, so they are
/// left at zero here.
pub fn encode_echo_request(ipv6: bool, echo: Echo) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + PAYLOAD.len());
    packet.push(if ipv6 { ECHO_REQUEST_V6 } else { ECHO_REQUEST_V4 });
    packet.push(0);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&echo.ident.to_be_bytes());
    packet.extend_from_slice(&echo.seq.to_be_bytes());
    packet.extend_from_slice(PAYLOAD);

    if !ipv6 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Extract the echo fields from a received datagram if it is an echo reply.
///
/// `has_ip_header` is true for IPv4 raw sockets.
pub fn parse_echo_reply(ipv6: bool, has_ip_header: bool, buf: &[u8]) -> Option<Echo> {
    let icmp = if has_ip_header {
        let ihl = usize::from(*buf.first()? & 0x0f) * 4;
        if ihl < 20 {
            return None;
        }
        buf.get(ihl..)?
    } else {
        buf
    };

    if icmp.len() < HEADER_LEN {
        return None;
    }
    let expected = if ipv6 { ECHO_REPLY_V6 } else { ECHO_REPLY_V4 };
    if icmp[0] != expected || icmp[1] != 0 {
        return None;
    }

    Some(Echo {
        ident: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

/// A bound ICMP socket for echo traffic towards one gateway
#[derive(Debug)]
pub struct IcmpSocket {
    fd: OwnedFd,
    ipv6: bool,
    privileged: bool,
    scope_id: u32,
}

impl IcmpSocket {
    /// Open a socket bound to `source` and, when given, to `interface`
    pub fn open(
        source: IpAddr,
        interface: Option<&str>,
        privileged: bool,
        read_timeout: Duration,
    ) -> io::Result<Self> {
        let ipv6 = source.is_ipv6();
        let (domain, protocol) = if ipv6 {
            (libc::AF_INET6, libc::IPPROTO_ICMPV6)
        } else {
            (libc::AF_INET, libc::IPPROTO_ICMP)
        };
        let kind = if privileged { libc::SOCK_RAW } else { libc::SOCK_DGRAM };

        let raw = unsafe { libc::socket(domain, kind | libc::SOCK_CLOEXEC, protocol) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let scope_id = match interface {
            Some(name) => interface_index(name)?,
            None => 0,
        };

        let socket = IcmpSocket {
            fd,
            ipv6,
            privileged,
            scope_id,
        };
        if let Some(name) = interface {
            socket.bind_to_device(name)?;
        }
        socket.bind(source)?;
        socket.set_read_timeout(read_timeout)?;
        Ok(socket)
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipv6
    }

    /// Whether replies must be matched on the identifier we chose
    pub fn filters_ident(&self) -> bool {
        self.privileged
    }

    pub fn send_echo(&self, target: IpAddr, echo: Echo) -> io::Result<()> {
        let packet = encode_echo_request(self.ipv6, echo);
        let (addr, len) = socket_addr(target, self.link_scope(target));
        let sent = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
                0,
                &addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if sent < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait up to the read timeout for the next echo reply.
    ///
    /// Returns `Ok(None)` on timeout or when a non-reply datagram was read.
    pub fn recv_echo_reply(&self) -> io::Result<Option<(IpAddr, Echo)>> {
        let mut buf = [0u8; 1500];
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let received = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                    Ok(None)
                }
                _ => Err(err),
            };
        }

        let has_ip_header = self.privileged && !self.ipv6;
        let echo = parse_echo_reply(self.ipv6, has_ip_header, &buf[..received as usize]);
        Ok(echo.and_then(|echo| ip_from_storage(&addr).map(|from| (from, echo))))
    }

    fn link_scope(&self, ip: IpAddr) -> u32 {
        match ip {
            IpAddr::V6(v6) if is_unicast_link_local(&v6) => self.scope_id,
            _ => 0,
        }
    }

    fn bind(&self, source: IpAddr) -> io::Result<()> {
        let (addr, len) = socket_addr(source, self.link_scope(source));
        let rc = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &addr as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn bind_to_device(&self, interface: &str) -> io::Result<()> {
        let name = interface.as_bytes();
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                name.as_ptr() as *const libc::c_void,
                name.len() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// fe80::/10
pub fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

fn interface_index(name: &str) -> io::Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

fn socket_addr(ip: IpAddr, scope_id: u32) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match ip {
        IpAddr::V4(v4) => {
            // SAFETY: sockaddr_storage is large enough and suitably aligned for sockaddr_in
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(v4.octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        IpAddr::V6(v6) => {
            // SAFETY: as above, for sockaddr_in6
            let sin6 = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr = libc::in6_addr { s6_addr: v6.octets() };
            sin6.sin6_scope_id = scope_id;
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn ip_from_storage(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in) };
            Some(IpAddr::V4(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes())))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6) };
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}
