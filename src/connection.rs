//! Buffered, descriptor-passing Wayland socket connection.
//!
//! A [`Connection`] owns one UNIX stream socket plus a fixed window per
//! direction: an inbound and an outbound [`RingBuffer`] for bytes and an
//! inbound and an outbound [`DescriptorQueue`] for file descriptors that
//! travel as `SCM_RIGHTS` ancillary data.
//!
//! # Data Path
//!
//! ```text
//! socket --recvmsg--> bytes_in / fds_in      (receive)
//! bytes_out / fds_out --sendmsg--> socket    (flush)
//! ```
//!
//! All socket calls are non-blocking. Nothing here grows: a full window is
//! reported as an error and the caller tears the session down.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use rustix::io::Errno;
use rustix::net::{
    recvmsg, sendmsg, RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags,
    SendAncillaryBuffer, SendAncillaryMessage, SendFlags,
};
use thiserror::Error;

use crate::ring::{DescriptorQueue, RingBuffer, RingError};

// =============================================================================
// Constants and Limits
// =============================================================================

/// Maximum file descriptors carried by one ancillary block (Wayland limit)
pub const MAX_FDS_OUT: usize = 28;

/// Window sizes for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Byte capacity of each direction (power of two)
    pub bytes: usize,
    /// Descriptor capacity of each direction (power of two)
    pub fds: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            bytes: RingBuffer::DEFAULT_CAPACITY,
            fds: DescriptorQueue::DEFAULT_CAPACITY,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by connection I/O. All of them are fatal to the session.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The outbound window could not be drained to make room.
    #[error("outbound buffer full ({requested} bytes requested, {free} free)")]
    BufferFull { requested: usize, free: usize },

    /// The inbound window (bytes or descriptors) overflowed.
    #[error("inbound buffer overflow")]
    Overflow,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome of one [`Connection::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Data arrived; the value is the inbound occupied size.
    Data(usize),
    /// The peer closed the socket.
    Closed,
    /// Nothing to read yet.
    WouldBlock,
}

// =============================================================================
// Socket I/O with File Descriptors
// =============================================================================

/// Receive into `spans`, collecting any `SCM_RIGHTS` descriptors.
///
/// Retries on `EINTR`. Returns `Ok(None)` when the call would block.
fn recv_with_fds(
    socket: &UnixStream,
    spans: (&mut [u8], &mut [u8]),
    fds: &mut Vec<Vec<OwnedFd>>,
) -> io::Result<Option<usize>> {
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_OUT))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut cmsg_space);
    let (first, second) = spans;
    let mut iov = [IoSliceMut::new(first), IoSliceMut::new(second)];
    let iov_count = if iov[1].is_empty() { 1 } else { 2 };

    let msg = loop {
        match recvmsg(
            socket.as_fd(),
            &mut iov[..iov_count],
            &mut cmsg_buffer,
            RecvFlags::DONTWAIT | RecvFlags::CMSG_CLOEXEC,
        ) {
            Ok(msg) => break msg,
            Err(Errno::INTR) => continue,
            Err(Errno::AGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    };

    if msg.flags.contains(rustix::net::ReturnFlags::CTRUNC) {
        log::warn!("[RECV] Ancillary data truncated, descriptors were lost");
    }

    // One batch per control message so an overflow can reject whole blocks
    for cmsg in cmsg_buffer.drain() {
        if let RecvAncillaryMessage::ScmRights(received) = cmsg {
            let batch: Vec<OwnedFd> = received.collect();
            log::trace!(
                "[FD] Received {:?}",
                batch.iter().map(|fd| fd.as_raw_fd()).collect::<Vec<RawFd>>()
            );
            fds.push(batch);
        }
    }

    Ok(Some(msg.bytes))
}

/// Send `spans` with up to [`MAX_FDS_OUT`] descriptors from `fds`.
///
/// Retries on `EINTR`. Returns `Ok(None)` when the call would block, and the
/// number of descriptors attached otherwise. Attached descriptors are left
/// in the queue; the caller closes them once the send succeeded.
fn send_with_fds(
    socket: &UnixStream,
    spans: (&[u8], &[u8]),
    fds: &DescriptorQueue,
) -> io::Result<Option<(usize, usize)>> {
    let (first, second) = spans;
    let iov = [IoSlice::new(first), IoSlice::new(second)];
    let iov_count = if second.is_empty() { 1 } else { 2 };

    let borrowed = fds.borrow_front(MAX_FDS_OUT);
    let mut cmsg_space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_OUT))];
    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut cmsg_space);
    if !borrowed.is_empty() {
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(&borrowed));
    }

    loop {
        match sendmsg(
            socket.as_fd(),
            &iov[..iov_count],
            &mut cmsg_buffer,
            SendFlags::DONTWAIT | SendFlags::NOSIGNAL,
        ) {
            Ok(sent) => {
                log::trace!("[SEND] {} bytes, {} fds", sent, borrowed.len());
                return Ok(Some((sent, borrowed.len())));
            }
            Err(Errno::INTR) => continue,
            Err(Errno::AGAIN) => return Ok(None),
            Err(e) => return Err(e.into()),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

/// One side of a proxied session.
///
/// Field order matters: descriptor queues drop (closing every queued
/// descriptor) before the socket closes.
pub struct Connection {
    bytes_in: RingBuffer,
    bytes_out: RingBuffer,
    fds_in: DescriptorQueue,
    fds_out: DescriptorQueue,
    want_flush: bool,
    socket: UnixStream,
}

impl Connection {
    /// Wrap `socket` with explicit window sizes.
    pub fn with_limits(socket: UnixStream, limits: Limits) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        Ok(Self {
            bytes_in: RingBuffer::new(limits.bytes),
            bytes_out: RingBuffer::new(limits.bytes),
            fds_in: DescriptorQueue::new(limits.fds),
            fds_out: DescriptorQueue::new(limits.fds),
            want_flush: false,
            socket,
        })
    }

    #[inline]
    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    #[inline]
    pub fn inbound(&self) -> &RingBuffer {
        &self.bytes_in
    }

    #[inline]
    pub fn inbound_mut(&mut self) -> &mut RingBuffer {
        &mut self.bytes_in
    }

    #[inline]
    pub fn inbound_fds_mut(&mut self) -> &mut DescriptorQueue {
        &mut self.fds_in
    }

    #[inline]
    pub fn outbound(&self) -> &RingBuffer {
        &self.bytes_out
    }

    #[inline]
    pub fn outbound_fds(&self) -> &DescriptorQueue {
        &self.fds_out
    }

    /// Whether queued output is waiting for a flush.
    #[inline]
    pub fn wants_flush(&self) -> bool {
        self.want_flush
    }

    /// Append `data` to the outbound window.
    ///
    /// Forces a flush first when it does not fit. Fails with
    /// [`ConnectionError::BufferFull`] if that still does not make room.
    pub fn queue_bytes(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if data.len() > self.bytes_out.free_space() {
            self.want_flush = true;
            self.flush()?;
        }

        if data.len() > self.bytes_out.free_space() {
            return Err(ConnectionError::BufferFull {
                requested: data.len(),
                free: self.bytes_out.free_space(),
            });
        }

        self.bytes_out.put(data)?;
        self.want_flush = true;
        Ok(())
    }

    /// Append one descriptor to the outbound queue.
    ///
    /// A full ancillary block's worth of queued descriptors forces a flush
    /// first. On failure the descriptor is closed.
    pub fn queue_descriptor(&mut self, fd: OwnedFd) -> Result<(), ConnectionError> {
        if self.fds_out.len() >= MAX_FDS_OUT {
            self.want_flush = true;
            self.flush()?;
        }

        self.fds_out
            .push(fd)
            .map_err(|_| ConnectionError::Overflow)?;
        self.want_flush = true;
        Ok(())
    }

    /// Write as much queued output as the socket accepts.
    ///
    /// Returns the number of bytes flushed. A socket that would block stops
    /// the flush early and leaves it pending for the next readiness event.
    pub fn flush(&mut self) -> Result<usize, ConnectionError> {
        if !self.want_flush {
            return Ok(0);
        }

        let mut total = 0;
        while !self.bytes_out.is_empty() {
            let sent = send_with_fds(&self.socket, self.bytes_out.as_read_spans(), &self.fds_out)?;
            let Some((len, fd_count)) = sent else {
                log::trace!("[SEND] Would block with {} bytes pending", self.bytes_out.occupied_size());
                return Ok(total);
            };

            // Our copies of the descriptors are no longer needed once sent
            self.fds_out.close_all(Some(fd_count));
            self.bytes_out.consume(len)?;
            total += len;

            if len == 0 {
                break;
            }
        }

        self.want_flush = false;
        Ok(total)
    }

    /// Perform one non-blocking receive into the inbound window.
    ///
    /// If received descriptors do not fit in the inbound queue, they (and
    /// any later block of the same call) are closed and the call fails with
    /// [`ConnectionError::Overflow`]. Received bytes are kept either way.
    pub fn receive(&mut self) -> Result<Received, ConnectionError> {
        if self.bytes_in.free_space() == 0 {
            return Err(ConnectionError::Overflow);
        }

        let mut batches = Vec::new();
        let received = recv_with_fds(&self.socket, self.bytes_in.as_write_spans(), &mut batches)?;

        let mut overflow = false;
        for batch in batches {
            if overflow || batch.len() > self.fds_in.free_space() {
                log::warn!(
                    "[FD] Inbound descriptor queue overflow, closing {} fds",
                    batch.len()
                );
                overflow = true;
                drop(batch);
                continue;
            }
            for fd in batch {
                self.fds_in.push(fd)?;
            }
        }

        let len = match received {
            None => {
                return if overflow {
                    Err(ConnectionError::Overflow)
                } else {
                    Ok(Received::WouldBlock)
                };
            }
            Some(0) if !overflow => return Ok(Received::Closed),
            Some(len) => len,
        };

        self.bytes_in.commit(len)?;
        log::trace!(
            "[RECV] {} bytes, {} buffered, {} fds pending",
            len,
            self.bytes_in.occupied_size(),
            self.fds_in.len()
        );

        if overflow {
            return Err(ConnectionError::Overflow);
        }
        Ok(Received::Data(self.bytes_in.occupied_size()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.fds_in.is_empty() || !self.fds_out.is_empty() {
            log::trace!(
                "[CONN] Closing fd={} with {} queued fds",
                self.socket.as_raw_fd(),
                self.fds_in.len() + self.fds_out.len()
            );
        }
    }
}


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::testing::{drain_socket, fill_socket};
    use super::*;
    use std::io::{Read, Write};

    fn pair(limits: Limits) -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        (Connection::with_limits(ours, limits).unwrap(), theirs)
    }

    /// Send bytes plus descriptors from a plain socket.
    fn send_raw(socket: &UnixStream, data: &[u8], fds: &[OwnedFd]) {
        let borrowed: Vec<_> = fds.iter().map(|fd| fd.as_fd()).collect();
        let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_OUT))];
        let mut cmsg = SendAncillaryBuffer::new(&mut space);
        if !borrowed.is_empty() {
            assert!(cmsg.push(SendAncillaryMessage::ScmRights(&borrowed)));
        }
        let sent = sendmsg(socket.as_fd(), &[IoSlice::new(data)], &mut cmsg, SendFlags::empty()).unwrap();
        assert_eq!(sent, data.len());
    }

    /// Receive bytes plus descriptors on a plain blocking socket.
    fn recv_raw(socket: &UnixStream, buf: &mut [u8]) -> (usize, Vec<OwnedFd>) {
        let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(MAX_FDS_OUT))];
        let mut cmsg = RecvAncillaryBuffer::new(&mut space);
        let msg = recvmsg(socket.as_fd(), &mut [IoSliceMut::new(buf)], &mut cmsg, RecvFlags::empty()).unwrap();
        let mut fds = Vec::new();
        for message in cmsg.drain() {
            if let RecvAncillaryMessage::ScmRights(received) = message {
                fds.extend(received);
            }
        }
        (msg.bytes, fds)
    }

    fn tracked_fd() -> (OwnedFd, UnixStream) {
        let (queued, observer) = UnixStream::pair().unwrap();
        (OwnedFd::from(queued), observer)
    }

    fn is_closed(observer: &mut UnixStream) -> bool {
        observer.set_nonblocking(true).unwrap();
        matches!(observer.read(&mut [0u8; 1]), Ok(0))
    }

    #[test]
    fn test_flush_without_pending_output_is_noop() {
        let (mut conn, _peer) = pair(Limits::default());
        assert!(!conn.wants_flush());
        assert_eq!(conn.flush().unwrap(), 0);
    }

    #[test]
    fn test_queue_and_flush_bytes() {
        let (mut conn, mut peer) = pair(Limits::default());
        conn.queue_bytes(b"hello ").unwrap();
        conn.queue_bytes(b"world").unwrap();
        assert!(conn.wants_flush());

        assert_eq!(conn.flush().unwrap(), 11);
        assert!(!conn.wants_flush());
        assert!(conn.outbound().is_empty());

        let mut buf = [0u8; 11];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_queue_bytes_flushes_when_window_full() {
        let (mut conn, mut peer) = pair(Limits { bytes: 16, fds: 4 });
        conn.queue_bytes(&[1u8; 12]).unwrap();
        conn.queue_bytes(&[2u8; 8]).unwrap();
        assert_eq!(conn.outbound().occupied_size(), 8);

        conn.flush().unwrap();
        let mut buf = [0u8; 20];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..12], &[1u8; 12]);
        assert_eq!(&buf[12..], &[2u8; 8]);
    }

    #[test]
    fn test_queue_bytes_larger_than_window_is_buffer_full() {
        let (mut conn, _peer) = pair(Limits { bytes: 16, fds: 4 });
        let err = conn.queue_bytes(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, ConnectionError::BufferFull { requested: 17, .. }));
    }

    #[test]
    fn test_full_peer_socket_keeps_flush_pending_then_buffer_full() {
        let (mut conn, mut peer) = pair(Limits { bytes: 256, fds: 4 });
        let filled = fill_socket(conn.socket());
        assert!(filled > 0);

        conn.queue_bytes(&[1u8; 200]).unwrap();
        let flushed = conn.flush().unwrap();
        assert!(flushed < 200);
        assert!(conn.wants_flush());
        assert_eq!(conn.outbound().occupied_size(), 200 - flushed);

        // The forced flush cannot make room either
        let err = conn.queue_bytes(&[2u8; 100]).unwrap_err();
        assert!(matches!(err, ConnectionError::BufferFull { requested: 100, .. }));
        assert!(conn.wants_flush());

        // Once the peer reads, the pending output goes out intact
        let pending = conn.outbound().occupied_size();
        let drained = drain_socket(&peer);
        assert_eq!(drained + pending, filled + 200);
        assert_eq!(conn.flush().unwrap(), pending);
        assert!(!conn.wants_flush());

        peer.set_nonblocking(false).unwrap();
        let mut buf = vec![0u8; pending];
        peer.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
    }

    #[test]
    fn test_flush_passes_descriptors_and_closes_local_copies() {
        let (mut conn, peer) = pair(Limits::default());
        let (fd, mut observer) = tracked_fd();

        conn.queue_descriptor(fd).unwrap();
        conn.queue_bytes(&[7u8; 8]).unwrap();
        conn.flush().unwrap();
        assert!(conn.outbound_fds().is_empty());

        let mut buf = [0u8; 8];
        let (len, fds) = recv_raw(&peer, &mut buf);
        assert_eq!(len, 8);
        assert_eq!(fds.len(), 1);

        // Only the receiver's copy keeps the descriptor alive now
        assert!(!is_closed(&mut observer));
        drop(fds);
        assert!(is_closed(&mut observer));
    }

    #[test]
    fn test_descriptors_beyond_cap_go_in_later_send() {
        let (mut conn, peer) = pair(Limits::default());
        let mut observers = Vec::new();
        for _ in 0..MAX_FDS_OUT + 2 {
            let (fd, observer) = tracked_fd();
            conn.queue_bytes(&[0u8; 4]).unwrap();
            conn.queue_descriptor(fd).unwrap();
            observers.push(observer);
        }
        conn.queue_bytes(&[0u8; 4]).unwrap();
        conn.flush().unwrap();
        assert!(conn.outbound_fds().is_empty());

        let mut total_fds = 0;
        let mut total_bytes = 0;
        let mut buf = [0u8; 256];
        while total_bytes < (MAX_FDS_OUT + 3) * 4 {
            let (len, fds) = recv_raw(&peer, &mut buf);
            assert!(fds.len() <= MAX_FDS_OUT);
            total_bytes += len;
            total_fds += fds.len();
        }
        assert_eq!(total_fds, MAX_FDS_OUT + 2);
    }

    #[test]
    fn test_receive_bytes_and_descriptors() {
        let (mut conn, peer) = pair(Limits::default());
        let (fd, _observer) = tracked_fd();
        send_raw(&peer, b"abcd", &[fd]);

        assert_eq!(conn.receive().unwrap(), Received::Data(4));
        let mut buf = [0u8; 4];
        conn.inbound().copy_out(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(conn.inbound_fds_mut().len(), 1);
    }

    #[test]
    fn test_receive_would_block_then_closed() {
        let (mut conn, peer) = pair(Limits::default());
        assert_eq!(conn.receive().unwrap(), Received::WouldBlock);
        drop(peer);
        assert_eq!(conn.receive().unwrap(), Received::Closed);
    }

    #[test]
    fn test_receive_on_full_window_overflows() {
        let (mut conn, mut peer) = pair(Limits { bytes: 8, fds: 4 });
        peer.write_all(&[0u8; 8]).unwrap();
        assert_eq!(conn.receive().unwrap(), Received::Data(8));

        peer.write_all(&[0u8; 1]).unwrap();
        assert!(matches!(conn.receive(), Err(ConnectionError::Overflow)));
    }

    #[test]
    fn test_receive_descriptor_overflow_closes_and_keeps_bytes() {
        let (mut conn, peer) = pair(Limits { bytes: 64, fds: 2 });
        let (a, mut oa) = tracked_fd();
        let (b, mut ob) = tracked_fd();
        let (c, mut oc) = tracked_fd();
        send_raw(&peer, b"payload!", &[a, b, c]);

        assert!(matches!(conn.receive(), Err(ConnectionError::Overflow)));

        // No descriptor leaked: the sender's copies were dropped by send_raw
        assert!(is_closed(&mut oa));
        assert!(is_closed(&mut ob));
        assert!(is_closed(&mut oc));
        assert_eq!(conn.inbound_fds_mut().len(), 0);

        let mut buf = [0u8; 8];
        conn.inbound().copy_out(&mut buf).unwrap();
        assert_eq!(&buf, b"payload!");
    }

    #[test]
    fn test_drop_closes_queued_descriptors() {
        let (mut conn, peer) = pair(Limits::default());
        let (out_fd, mut out_observer) = tracked_fd();
        let (in_fd, mut in_observer) = tracked_fd();
        send_raw(&peer, b"x", &[in_fd]);
        conn.receive().unwrap();
        conn.queue_descriptor(out_fd).unwrap();

        drop(conn);
        assert!(is_closed(&mut out_observer));
        assert!(is_closed(&mut in_observer));
    }
}
