use super::IcmpError;
use log::{debug, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsFd;
use std::time::Duration;

/// Room for the largest ICMP message plus a raw-socket IP header.
const RECV_BUFFER_SIZE: usize = 65536 + 64;

/// How a received frame is framed, which decides header stripping and
/// whether the identifier survived the kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DatagramKind {
    V4Raw,
    V4Dgram,
    V6Raw,
    V6Dgram,
}

impl DatagramKind {
    /// Datagram ICMP sockets rewrite the echo identifier on the way
    /// out, so replies cannot be matched on it.
    pub fn ident_rewritten(self) -> bool {
        matches!(self, DatagramKind::V4Dgram | DatagramKind::V6Dgram)
    }
}

/// One inbound ICMP frame.
#[derive(Clone, Debug)]
pub struct Datagram {
    pub buf: Vec<u8>,
    pub from: IpAddr,
    pub kind: DatagramKind,
}

/// The prober's only I/O seam: send one echo request, wait for one
/// inbound frame or a deadline. The kernel implementation multiplexes
/// the v4 and v6 sockets through a single `poll(2)`; tests substitute a
/// scripted in-memory channel.
pub trait PacketChannel {
    fn send(&mut self, target: IpAddr, buf: &[u8]) -> io::Result<usize>;
    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Datagram>>;
}

struct FamilySocket {
    socket: Socket,
    kind: DatagramKind,
}

/// Kernel ICMP sockets, datagram first with a raw fallback.
pub struct KernelChannel {
    v4: Option<FamilySocket>,
    v6: Option<FamilySocket>,
}

fn open_family(
    v6: bool,
    ttl: u32,
    source: Option<IpAddr>,
) -> Result<FamilySocket, IcmpError> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if v6 { Protocol::ICMPV6 } else { Protocol::ICMPV4 };

    // Unprivileged datagram ICMP first; raw needs elevated privilege or
    // the setuid bit.
    let (socket, kind) = match Socket::new(domain, Type::DGRAM, Some(protocol)) {
        Ok(socket) => {
            debug!("Opened datagram ICMP socket ({})", if v6 { "v6" } else { "v4" });
            let kind = if v6 {
                DatagramKind::V6Dgram
            } else {
                DatagramKind::V4Dgram
            };
            (socket, kind)
        }
        Err(dgram_err) => {
            debug!(
                "Datagram ICMP socket unavailable ({}), falling back to raw",
                dgram_err
            );
            match Socket::new(domain, Type::RAW, Some(protocol)) {
                Ok(socket) => {
                    let kind = if v6 {
                        DatagramKind::V6Raw
                    } else {
                        DatagramKind::V4Raw
                    };
                    (socket, kind)
                }
                Err(raw_err) if raw_err.kind() == io::ErrorKind::PermissionDenied => {
                    return Err(IcmpError::Privilege(raw_err.to_string()));
                }
                Err(raw_err) => return Err(IcmpError::Socket(raw_err)),
            }
        }
    };

    socket.set_nonblocking(true).map_err(IcmpError::Socket)?;
    if v6 {
        socket
            .set_unicast_hops_v6(ttl)
            .map_err(IcmpError::Socket)?;
    } else {
        socket.set_ttl(ttl).map_err(IcmpError::Socket)?;
    }

    if let Some(source) = source {
        let bind_addr = SocketAddr::new(source, 0);
        socket
            .bind(&SockAddr::from(bind_addr))
            .map_err(IcmpError::Socket)?;
        debug!("Pinned source address to {}", source);
    }

    Ok(FamilySocket { socket, kind })
}

impl KernelChannel {
    /// Open sockets for the address families actually present among the
    /// targets.
    pub fn open(
        need_v4: bool,
        need_v6: bool,
        ttl: u32,
        source: Option<IpAddr>,
    ) -> Result<Self, IcmpError> {
        let v4_source = source.filter(|s| s.is_ipv4());
        let v6_source = source.filter(|s| s.is_ipv6());
        Ok(KernelChannel {
            v4: if need_v4 {
                Some(open_family(false, ttl, v4_source)?)
            } else {
                None
            },
            v6: if need_v6 {
                Some(open_family(true, ttl, v6_source)?)
            } else {
                None
            },
        })
    }

    fn receive_one(family: &FamilySocket) -> io::Result<Option<Datagram>> {
        let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_SIZE];
        match family.socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                let from = match from.as_socket() {
                    Some(addr) => addr.ip(),
                    None => return Ok(None),
                };
                // SAFETY: recv_from initialized the first `len` bytes.
                let init =
                    unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
                Ok(Some(Datagram {
                    buf: init.to_vec(),
                    from,
                    kind: family.kind,
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl PacketChannel for KernelChannel {
    fn send(&mut self, target: IpAddr, buf: &[u8]) -> io::Result<usize> {
        let family = match target {
            IpAddr::V4(_) => self.v4.as_ref(),
            IpAddr::V6(_) => self.v6.as_ref(),
        };
        let family = family.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "no socket for this address family",
            )
        })?;
        let addr = SockAddr::from(SocketAddr::new(target, 0));
        family.socket.send_to(buf, &addr)
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Option<Datagram>> {
        // A frame may already be queued from the last poll round.
        for family in [self.v4.as_ref(), self.v6.as_ref()].into_iter().flatten() {
            if let Some(datagram) = Self::receive_one(family)? {
                return Ok(Some(datagram));
            }
        }

        let mut fds = Vec::with_capacity(2);
        if let Some(v4) = &self.v4 {
            fds.push(PollFd::new(v4.socket.as_fd(), PollFlags::POLLIN));
        }
        if let Some(v6) = &self.v6 {
            fds.push(PollFd::new(v6.socket.as_fd(), PollFlags::POLLIN));
        }
        if fds.is_empty() {
            return Ok(None);
        }

        let millis = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        match poll(&mut fds, PollTimeout::from(millis)) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(nix::Error::EINTR) => return Ok(None),
            Err(e) => return Err(io::Error::from(e)),
        }
        drop(fds);

        for family in [self.v4.as_ref(), self.v6.as_ref()].into_iter().flatten() {
            match Self::receive_one(family) {
                Ok(Some(datagram)) => return Ok(Some(datagram)),
                Ok(None) => continue,
                Err(e) => {
                    warn!("Receive error on ICMP socket: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    //! An in-memory channel replaying scripted replies, driving the
    //! prober without privileges or a network.

    use super::*;
    use std::time::Instant;

    pub(crate) struct ScriptedReply {
        pub delay: Duration,
        pub datagram: Datagram,
    }

    type ReplyScript = Box<dyn FnMut(u64, IpAddr, &[u8]) -> Vec<ScriptedReply>>;

    pub(crate) struct ScriptedChannel {
        script: ReplyScript,
        queue: Vec<(Instant, Datagram)>,
        pub sent: Vec<(IpAddr, Vec<u8>)>,
        /// The first N sends report one byte short, exercising the
        /// partial-send retry path.
        pub short_sends: u32,
    }

    impl ScriptedChannel {
        pub(crate) fn new(
            script: impl FnMut(u64, IpAddr, &[u8]) -> Vec<ScriptedReply> + 'static,
        ) -> Self {
            ScriptedChannel {
                script: Box::new(script),
                queue: Vec::new(),
                sent: Vec::new(),
                short_sends: 0,
            }
        }

        /// Turn a captured request into the matching kernel-style reply.
        pub(crate) fn reply_to(request: &[u8], from: IpAddr) -> Datagram {
            use crate::icmp::packet::{ICMP4_ECHO_REPLY, ICMP6_ECHO_REPLY, ICMP6_ECHO_REQUEST};

            let mut buf = request.to_vec();
            buf[0] = if request[0] == ICMP6_ECHO_REQUEST {
                ICMP6_ECHO_REPLY
            } else {
                ICMP4_ECHO_REPLY
            };
            Datagram {
                buf,
                from,
                kind: if from.is_ipv4() {
                    DatagramKind::V4Dgram
                } else {
                    DatagramKind::V6Dgram
                },
            }
        }
    }

    impl PacketChannel for ScriptedChannel {
        fn send(&mut self, target: IpAddr, buf: &[u8]) -> io::Result<usize> {
            if self.short_sends > 0 {
                self.short_sends -= 1;
                return Ok(buf.len() - 1);
            }
            let send_index = self.sent.len() as u64;
            self.sent.push((target, buf.to_vec()));
            let now = Instant::now();
            for reply in (self.script)(send_index, target, buf) {
                self.queue.push((now + reply.delay, reply.datagram));
            }
            Ok(buf.len())
        }

        fn wait(&mut self, timeout: Duration) -> io::Result<Option<Datagram>> {
            let now = Instant::now();
            let earliest = self
                .queue
                .iter()
                .enumerate()
                .min_by_key(|(_, (due, _))| *due)
                .map(|(index, (due, _))| (index, *due));

            match earliest {
                Some((index, due)) if due <= now + timeout => {
                    if due > now {
                        std::thread::sleep(due - now);
                    }
                    Ok(Some(self.queue.remove(index).1))
                }
                _ => {
                    std::thread::sleep(timeout);
                    Ok(None)
                }
            }
        }
    }
}
