use anyhow::Context;
use macaddr::MacAddr6;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

const IFNAMSIZ: usize = 16;
const SIOCGIFINDEX: libc::c_ulong = 0x8933;
const SIOCGIFHWADDR: libc::c_ulong = 0x8927;
const ARPHRD_ETHER: u16 = 1;
const PACKET_STATISTICS: libc::c_int = 6;

/// Snapshot length for captured frames; headers only, the on-wire length is
/// reported separately via MSG_TRUNC.
pub const SNAPLEN: usize = 256;

#[repr(C)]
struct IfReq {
    name: [u8; IFNAMSIZ],
    data: [u8; 24],
}

impl IfReq {
    fn new(ifname: &str) -> anyhow::Result<Self> {
        let bytes = ifname.as_bytes();
        if bytes.is_empty() || bytes.len() >= IFNAMSIZ {
            anyhow::bail!("invalid interface name {:?}", ifname);
        }
        let mut name = [0u8; IFNAMSIZ];
        name[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            name,
            data: [0u8; 24],
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SockFilter {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> SockFilter {
    SockFilter { code, jt, jf, k }
}

/// `tcpdump -dd "not ether src <hwaddr> and (ip or ip6)"` with the two MAC
/// immediates patched in at attach time.
pub(crate) fn egress_filter(hwaddr: MacAddr6) -> Vec<SockFilter> {
    let mac = hwaddr.into_array();
    let low = u32::from_be_bytes([mac[2], mac[3], mac[4], mac[5]]);
    let high = u32::from(u16::from_be_bytes([mac[0], mac[1]]));

    vec![
        insn(0x20, 0, 0, 0x00000008), // ld  [8]      last 4 bytes of ether src
        insn(0x15, 0, 2, low),
        insn(0x28, 0, 0, 0x00000006), // ldh [6]      first 2 bytes of ether src
        insn(0x15, 4, 0, high),
        insn(0x28, 0, 0, 0x0000000c), // ldh [12]     ethertype
        insn(0x15, 1, 0, 0x00000800),
        insn(0x15, 0, 1, 0x000086dd),
        insn(0x06, 0, 0, 0x0000ffff), // accept
        insn(0x06, 0, 0, 0x00000000), // drop
    ]
}

/// `tcpdump -dd "ip or ip6"`, for interfaces without an Ethernet-style
/// hardware address.
pub(crate) fn ip_filter() -> Vec<SockFilter> {
    vec![
        insn(0x28, 0, 0, 0x0000000c),
        insn(0x15, 1, 0, 0x00000800),
        insn(0x15, 0, 1, 0x000086dd),
        insn(0x06, 0, 0, 0x0000ffff),
        insn(0x06, 0, 0, 0x00000000),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareAddress {
    Ethernet(MacAddr6),
    Other,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

/// A non-blocking promiscuous AF_PACKET socket bound to one interface with
/// the classifying filter attached.
pub struct CaptureSocket {
    fd: RawFd,
    name: String,
    ifindex: i32,
}

/// Clonable handle so the statistics timer can read counters while the
/// event loop owns the readiness registration.
#[derive(Clone)]
pub struct CaptureHandle(pub Rc<CaptureSocket>);

impl AsRawFd for CaptureHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd
    }
}

impl std::ops::Deref for CaptureHandle {
    type Target = CaptureSocket;

    fn deref(&self) -> &CaptureSocket {
        &self.0
    }
}

impl CaptureSocket {
    pub fn open(ifname: &str) -> anyhow::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from((libc::ETH_P_ALL as u16).to_be()),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to open capture socket on {}", ifname));
        }

        let mut socket = Self {
            fd,
            name: ifname.to_string(),
            ifindex: 0,
        };
        socket.ifindex = socket.configure(ifname)?;
        Ok(socket)
    }

    fn configure(&self, ifname: &str) -> anyhow::Result<i32> {
        let mut req = IfReq::new(ifname)?;
        if unsafe { libc::ioctl(self.fd, SIOCGIFINDEX, &mut req) } < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to resolve interface index of {}", ifname));
        }
        let ifindex = i32::from_ne_bytes([req.data[0], req.data[1], req.data[2], req.data[3]]);

        let hwaddr = self.hardware_address(ifname)?;

        let addr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to bind capture socket to {}", ifname));
        }

        let filter = match hwaddr {
            HardwareAddress::Ethernet(mac) => egress_filter(mac),
            HardwareAddress::Other => ip_filter(),
        };
        let prog = SockFprog {
            len: filter.len() as u16,
            filter: filter.as_ptr(),
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ATTACH_FILTER,
                &prog as *const SockFprog as *const libc::c_void,
                std::mem::size_of::<SockFprog>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to attach capture filter on {}", ifname));
        }

        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                std::mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to enable promiscuous mode on {}", ifname));
        }

        Ok(ifindex)
    }

    fn hardware_address(&self, ifname: &str) -> anyhow::Result<HardwareAddress> {
        let mut req = IfReq::new(ifname)?;
        if unsafe { libc::ioctl(self.fd, SIOCGIFHWADDR, &mut req) } < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("failed to read hardware address of {}", ifname));
        }

        let family = u16::from_ne_bytes([req.data[0], req.data[1]]);
        if family != ARPHRD_ETHER {
            return Ok(HardwareAddress::Other);
        }

        let d = &req.data[2..8];
        Ok(HardwareAddress::Ethernet(MacAddr6::new(
            d[0], d[1], d[2], d[3], d[4], d[5],
        )))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    /// Receives the next frame into `buf`. Returns the snapshot length and
    /// the original on-wire length; `WouldBlock` signals a drained socket.
    pub fn next_packet(&self, buf: &mut [u8]) -> io::Result<(usize, usize)> {
        let rc = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_TRUNC | libc::MSG_DONTWAIT,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let wire_len = rc as usize;
        Ok((wire_len.min(buf.len()), wire_len))
    }

    /// Kernel capture counters since the previous read (the kernel resets
    /// them on every call).
    pub fn stats(&self) -> io::Result<CaptureStats> {
        let mut stats: [u32; 2] = [0; 2];
        let mut len = std::mem::size_of_val(&stats) as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                stats.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(CaptureStats {
            received: stats[0],
            dropped: stats[1],
        })
    }
}

impl AsRawFd for CaptureSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for CaptureSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
