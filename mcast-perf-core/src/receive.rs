//! Socket drain strategies for the collector.
//!
//! Both variants answer the same question: "what did one receive call
//! surface?" The single variant reads one datagram per call; the batched one
//! pulls up to its capacity through one `recvmmsg` on Linux. An empty slice
//! means the socket has nothing more right now.

use mio::net::UdpSocket;
use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::config::ReceiveMode;
use crate::packet::MAX_UDP_PAYLOAD;

/// One datagram sitting in a strategy-owned buffer
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    buffer: Box<[u8]>,
    len: usize,
    source: Option<SocketAddr>,
}

impl ReceivedDatagram {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            source: None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }
}

pub trait ReceiveStrategy {
    /// Perform one receive call. Datagrams come back in arrival order.
    fn receive(&mut self, socket: &UdpSocket) -> io::Result<&[ReceivedDatagram]>;

    /// Most datagrams a single call can return
    fn capacity(&self) -> usize;
}

/// Build the strategy selected by configuration
pub fn strategy_for(mode: ReceiveMode) -> Box<dyn ReceiveStrategy + Send> {
    match mode {
        ReceiveMode::Single => Box::new(SingleReceiver::new()),
        ReceiveMode::Batched(capacity) => Box::new(BatchReceiver::new(capacity)),
    }
}

/// One `recv_from` per call
#[derive(Debug)]
pub struct SingleReceiver {
    slot: [ReceivedDatagram; 1],
}

impl SingleReceiver {
    pub fn new() -> Self {
        Self {
            slot: [ReceivedDatagram::with_capacity(MAX_UDP_PAYLOAD)],
        }
    }
}

impl Default for SingleReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveStrategy for SingleReceiver {
    fn receive(&mut self, socket: &UdpSocket) -> io::Result<&[ReceivedDatagram]> {
        let slot = &mut self.slot[0];
        let received = loop {
            match socket.recv_from(&mut slot.buffer) {
                Ok((len, src)) => {
                    slot.len = len;
                    slot.source = Some(src);
                    break 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        Ok(&self.slot[..received])
    }

    fn capacity(&self) -> usize {
        1
    }
}

/// Up to `capacity` datagrams per system call.
///
/// The `recvmmsg` headers, iovecs and address slots are built once and point
/// into the slot buffers, so a receive call does not allocate.
pub struct BatchReceiver {
    slots: Vec<ReceivedDatagram>,
    #[cfg(target_os = "linux")]
    names: Vec<libc::sockaddr_in>,
    #[cfg(target_os = "linux")]
    iovecs: Vec<libc::iovec>,
    #[cfg(target_os = "linux")]
    headers: Vec<libc::mmsghdr>,
}

// SAFETY: the raw pointers in `iovecs` and `headers` only refer to heap
// storage owned by this same value (`names`, `iovecs` and the boxed slot
// buffers). Moving the receiver to another thread moves that storage with it.
#[cfg(target_os = "linux")]
unsafe impl Send for BatchReceiver {}

impl BatchReceiver {
    pub fn new(capacity: usize) -> Self {
        let slots: Vec<ReceivedDatagram> = (0..capacity.max(1))
            .map(|_| ReceivedDatagram::with_capacity(MAX_UDP_PAYLOAD))
            .collect();

        let mut receiver = Self {
            slots,
            #[cfg(target_os = "linux")]
            names: Vec::new(),
            #[cfg(target_os = "linux")]
            iovecs: Vec::new(),
            #[cfg(target_os = "linux")]
            headers: Vec::new(),
        };
        receiver.link_headers();
        receiver
    }

    #[cfg(not(target_os = "linux"))]
    fn link_headers(&mut self) {}

    /// Point one `mmsghdr` at each slot. The vectors are never resized
    /// afterwards, so the pointers stay valid for the receiver's lifetime.
    #[cfg(target_os = "linux")]
    fn link_headers(&mut self) {
        use std::mem;

        let capacity = self.slots.len();
        // SAFETY: sockaddr_in and mmsghdr are plain C structs for which
        // all-zero bytes is a valid value.
        self.names = vec![unsafe { mem::zeroed() }; capacity];
        self.iovecs = self
            .slots
            .iter_mut()
            .map(|slot| libc::iovec {
                iov_base: slot.buffer.as_mut_ptr() as *mut libc::c_void,
                iov_len: slot.buffer.len(),
            })
            .collect();

        self.headers = Vec::with_capacity(capacity);
        for (name, iov) in self.names.iter_mut().zip(self.iovecs.iter_mut()) {
            let mut header: libc::mmsghdr = unsafe { mem::zeroed() };
            header.msg_hdr.msg_name = name as *mut libc::sockaddr_in as *mut libc::c_void;
            header.msg_hdr.msg_iov = iov as *mut libc::iovec;
            header.msg_hdr.msg_iovlen = 1;
            self.headers.push(header);
        }
    }

    #[cfg(target_os = "linux")]
    fn recv_batch(&mut self, socket: &UdpSocket) -> io::Result<usize> {
        use std::os::unix::io::AsRawFd;

        // the kernel overwrites the address length with what it wrote
        for header in self.headers.iter_mut() {
            header.msg_hdr.msg_namelen =
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        }

        let received = loop {
            // SAFETY: every header points at a live name and iovec owned by
            // self, and each iovec at a slot buffer of the stated length.
            // None of them move or resize while the call runs.
            let rc = unsafe {
                libc::recvmmsg(
                    socket.as_raw_fd(),
                    self.headers.as_mut_ptr(),
                    self.headers.len() as libc::c_uint,
                    0 as _,
                    std::ptr::null_mut(),
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(0),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        };

        for ((slot, header), name) in self
            .slots
            .iter_mut()
            .zip(&self.headers)
            .zip(&self.names)
            .take(received)
        {
            slot.len = header.msg_len as usize;
            slot.source = sockaddr_to_std(name, header.msg_hdr.msg_namelen);
        }
        Ok(received)
    }

    #[cfg(not(target_os = "linux"))]
    fn recv_batch(&mut self, socket: &UdpSocket) -> io::Result<usize> {
        let mut received = 0;
        while received < self.slots.len() {
            let slot = &mut self.slots[received];
            match socket.recv_from(&mut slot.buffer) {
                Ok((len, src)) => {
                    slot.len = len;
                    slot.source = Some(src);
                    received += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(received)
    }
}

impl fmt::Debug for BatchReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchReceiver")
            .field("capacity", &self.slots.len())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn sockaddr_to_std(name: &libc::sockaddr_in, namelen: libc::socklen_t) -> Option<SocketAddr> {
    if (namelen as usize) < std::mem::size_of::<libc::sockaddr_in>()
        || name.sin_family != libc::AF_INET as libc::sa_family_t
    {
        return None;
    }
    let ip = std::net::Ipv4Addr::from(u32::from_be(name.sin_addr.s_addr));
    Some(SocketAddr::from((ip, u16::from_be(name.sin_port))))
}

impl ReceiveStrategy for BatchReceiver {
    fn receive(&mut self, socket: &UdpSocket) -> io::Result<&[ReceivedDatagram]> {
        let received = self.recv_batch(socket)?;
        Ok(&self.slots[..received])
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::{Duration, Instant};

    fn loopback_pair() -> (UdpSocket, std::net::UdpSocket) {
        let receiver = UdpSocket::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let sender = std::net::UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.connect(receiver.local_addr().unwrap()).unwrap();
        (receiver, sender)
    }

    /// Keep calling `receive` until `want` datagrams showed up or a second passed
    fn collect(
        strategy: &mut dyn ReceiveStrategy,
        socket: &UdpSocket,
        want: usize,
    ) -> (Vec<Vec<u8>>, usize) {
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut payloads = Vec::new();
        let mut largest = 0;
        while payloads.len() < want && Instant::now() < deadline {
            let batch = strategy.receive(socket).unwrap();
            largest = largest.max(batch.len());
            payloads.extend(batch.iter().map(|d| d.payload().to_vec()));
            if batch.is_empty() {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        (payloads, largest)
    }

    #[test]
    fn test_empty_socket_yields_nothing() {
        let (receiver, _sender) = loopback_pair();
        let mut single = SingleReceiver::new();
        assert!(single.receive(&receiver).unwrap().is_empty());

        let mut batch = BatchReceiver::new(8);
        assert!(batch.receive(&receiver).unwrap().is_empty());
    }

    #[test]
    fn test_single_receiver_one_per_call() {
        let (receiver, sender) = loopback_pair();
        for i in 0u8..3 {
            sender.send(&[i; 16]).unwrap();
        }

        let mut single = SingleReceiver::new();
        let (payloads, largest) = collect(&mut single, &receiver, 3);
        assert_eq!(largest, 1);
        assert_eq!(payloads, vec![vec![0u8; 16], vec![1u8; 16], vec![2u8; 16]]);
    }

    #[test]
    fn test_batch_receiver_keeps_order_and_sources() {
        let (receiver, sender) = loopback_pair();
        for i in 0u8..20 {
            sender.send(&[i; 32]).unwrap();
        }

        let mut batch = BatchReceiver::new(8);
        assert_eq!(batch.capacity(), 8);

        let (payloads, largest) = collect(&mut batch, &receiver, 20);
        assert!(largest <= 8);
        assert_eq!(payloads.len(), 20);
        for (i, p) in payloads.iter().enumerate() {
            assert_eq!(p, &vec![i as u8; 32]);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_batch_receiver_reports_source_address() {
        let (receiver, sender) = loopback_pair();
        sender.send(&[7u8; 12]).unwrap();

        let mut batch = BatchReceiver::new(4);
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let got = batch.receive(&receiver).unwrap();
            if let Some(first) = got.first() {
                assert_eq!(first.len(), 12);
                assert_eq!(first.source(), Some(sender.local_addr().unwrap()));
                break;
            }
            assert!(Instant::now() < deadline, "datagram never arrived");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_strategy_for_mode() {
        assert_eq!(strategy_for(ReceiveMode::Single).capacity(), 1);
        assert_eq!(strategy_for(ReceiveMode::Batched(32)).capacity(), 32);
    }
}
