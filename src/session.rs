//! One proxied client/server pair.
//!
//! A [`Session`] owns the connection to the client, the connection to the
//! upstream compositor and the object table for the ids live between them.
//! Whatever arrives on one side is traced and queued on the other.
//!
//! # Message Flow
//!
//! ```text
//! client --receive--> [decode + trace] --queue--> server   (requests)
//! server --receive--> [decode + trace] --queue--> client   (events)
//! ```
//!
//! Decoding is best effort. A message that cannot be decoded is still
//! forwarded byte for byte; only a header that makes the stream impossible
//! to re-frame ends the session.

use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use thiserror::Error;

use crate::connection::{Connection, ConnectionError, Limits, Received};
use crate::objects::{ObjectError, ObjectTable};
use crate::ring::RingError;
use crate::schema::{ArgKind, Direction, Message, Schema, ROOT_OBJECT_ID};
use crate::trace::{ArgValue, Call, RawDump, TraceSink};
use crate::wire::{MessageHeader, WireCursor, WireError, HEADER_SIZE};

// =============================================================================
// Types
// =============================================================================

/// Which end of the session a socket belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// Direction of the messages this side sends.
    pub fn direction(self) -> Direction {
        match self {
            Side::Client => Direction::Request,
            Side::Server => Direction::Event,
        }
    }
}

/// How inbound traffic is turned into trace records.
#[derive(Debug, Clone)]
pub enum Forwarder {
    /// Hex dump whatever arrived and pass it on unframed
    Raw,
    /// Frame and decode messages against a schema
    Decode(Rc<Schema>),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("malformed header: object {object_id} opcode {opcode} size {size}")]
    MalformedHeader { object_id: u32, opcode: u16, size: usize },

    #[error("message of {size} bytes does not fit the {capacity} byte buffer")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error(transparent)]
    Object(#[from] ObjectError),

    /// Only seen inside the argument walk, which reports it and carries on.
    #[error(transparent)]
    Truncated(#[from] WireError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    /// The side that was read hung up
    Closed,
}

// =============================================================================
// Session
// =============================================================================

pub struct Session {
    id: u32,
    client: Connection,
    server: Connection,
    objects: ObjectTable,
    forwarder: Forwarder,
}

impl Session {
    /// Pair an accepted client with its upstream connection.
    pub fn new(id: u32, client: UnixStream, server: UnixStream, schema: Option<Rc<Schema>>) -> io::Result<Self> {
        Self::with_limits(id, client, server, schema, Limits::default())
    }

    pub fn with_limits(
        id: u32,
        client: UnixStream,
        server: UnixStream,
        schema: Option<Rc<Schema>>,
        limits: Limits,
    ) -> io::Result<Self> {
        let mut objects = ObjectTable::new();
        let forwarder = match schema {
            Some(schema) => {
                objects.insert(ROOT_OBJECT_ID, Some(schema.root()));
                Forwarder::Decode(schema)
            }
            None => Forwarder::Raw,
        };

        Ok(Self {
            id,
            client: Connection::with_limits(client, limits)?,
            server: Connection::with_limits(server, limits)?,
            objects,
            forwarder,
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self, side: Side) -> &Connection {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Service a readable socket: receive once, forward every complete
    /// message, then flush both directions.
    pub fn handle_readable(&mut self, side: Side, sink: &mut TraceSink) -> Result<SessionStatus, SessionError> {
        let source = match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        };

        match source.receive()? {
            Received::Closed => {
                log::debug!("[SESSION {}] {:?} hung up", self.id, side);
                return Ok(SessionStatus::Closed);
            }
            Received::WouldBlock => {}
            Received::Data(_) => self.process_inbound(side, sink)?,
        }

        let id = self.id;
        let (source, peer) = self.split(side);
        peer.flush()?;
        source.flush()?;
        if peer.wants_flush() {
            log::trace!(
                "[SESSION {}] {} bytes and {} fds waiting for the {:?} side",
                id,
                peer.outbound().occupied_size(),
                peer.outbound_fds().len(),
                match side {
                    Side::Client => Side::Server,
                    Side::Server => Side::Client,
                }
            );
        }
        Ok(SessionStatus::Open)
    }

    /// Service a writable socket: flush the output queued for `side`.
    /// Returns whether output is still pending.
    pub fn handle_writable(&mut self, side: Side) -> Result<bool, SessionError> {
        let id = self.id;
        let (connection, _) = self.split(side);
        let flushed = connection.flush()?;
        log::trace!("[SESSION {}] Flushed {} bytes to the {:?} side", id, flushed, side);
        Ok(connection.wants_flush())
    }

    /// Forward everything buffered on `side` that can be framed.
    pub fn process_inbound(&mut self, side: Side, sink: &mut TraceSink) -> Result<(), SessionError> {
        match &self.forwarder {
            Forwarder::Raw => self.relay_raw(side, sink),
            Forwarder::Decode(schema) => {
                let schema = Rc::clone(schema);
                while self.forward_message(side, &schema, sink)? {}
                Ok(())
            }
        }
    }

    fn split(&mut self, side: Side) -> (&mut Connection, &mut Connection) {
        match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        }
    }

    fn relay_raw(&mut self, side: Side, sink: &mut TraceSink) -> Result<(), SessionError> {
        let id = self.id;
        let (source, peer) = self.split(side);

        let mut bytes = vec![0u8; source.inbound().occupied_size()];
        source.inbound().copy_out(&mut bytes)?;
        let fd_count = source.inbound_fds_mut().len();
        let fds = source.inbound_fds_mut().peek_raw(fd_count);
        if bytes.is_empty() && fds.is_empty() {
            return Ok(());
        }

        sink.record(
            id,
            format_args!(
                "{}",
                RawDump {
                    direction: side.direction(),
                    bytes: &bytes,
                    fds: &fds,
                }
            ),
        );

        // Descriptors go out no later than the bytes they arrived with
        while let Some(fd) = source.inbound_fds_mut().pop() {
            peer.queue_descriptor(fd)?;
        }
        peer.queue_bytes(&bytes)?;
        source.inbound_mut().consume(bytes.len())?;
        Ok(())
    }

    /// Frame, trace and forward the next message. Returns `false` once no
    /// complete message is buffered.
    fn forward_message(&mut self, side: Side, schema: &Schema, sink: &mut TraceSink) -> Result<bool, SessionError> {
        let session_id = self.id;
        let direction = side.direction();
        let Session {
            client,
            server,
            objects,
            ..
        } = self;
        let (source, peer) = match side {
            Side::Client => (client, server),
            Side::Server => (server, client),
        };

        let inbound = source.inbound();
        let mut head = [0u8; HEADER_SIZE];
        if inbound.occupied_size() < HEADER_SIZE {
            return Ok(false);
        }
        inbound.copy_out(&mut head)?;
        let Some(header) = MessageHeader::parse(&head) else {
            return Ok(false);
        };

        if !header.is_well_formed() {
            return Err(SessionError::MalformedHeader {
                object_id: header.object_id,
                opcode: header.opcode,
                size: header.size,
            });
        }
        if header.size > inbound.capacity() {
            return Err(SessionError::MessageTooLarge {
                size: header.size,
                capacity: inbound.capacity(),
            });
        }
        if inbound.occupied_size() < header.size {
            return Ok(false);
        }

        let mut message = vec![0u8; header.size];
        inbound.copy_out(&mut message)?;

        let resolved = match objects.lookup(header.object_id) {
            None => {
                sink.record(
                    session_id,
                    format_args!(
                        "Unknown object {} opcode {}, size {}",
                        header.object_id, header.opcode, header.size
                    ),
                );
                log::warn!(
                    "[DECODE] Unknown object {}, later messages may not decode correctly",
                    header.object_id
                );
                None
            }
            Some(interface) => match schema.message(interface, direction, header.opcode) {
                None => {
                    let name = &schema.interface(interface).name;
                    sink.record(
                        session_id,
                        format_args!(
                            "Unknown opcode {} for {}@{}, size {}",
                            header.opcode, name, header.object_id, header.size
                        ),
                    );
                    log::warn!("[DECODE] {}@{} has no opcode {}", name, header.object_id, header.opcode);
                    None
                }
                Some(descriptor) => Some((interface, descriptor)),
            },
        };

        match resolved {
            Some((interface, descriptor)) => {
                let mut walk = ArgumentWalk {
                    schema,
                    objects: &mut *objects,
                    source: &mut *source,
                    peer: &mut *peer,
                };
                let (args, truncated) = walk.decode(descriptor, &message[HEADER_SIZE..])?;

                sink.record(
                    session_id,
                    format_args!(
                        "{}",
                        Call {
                            direction,
                            interface: &schema.interface(interface).name,
                            object_id: header.object_id,
                            message: &descriptor.name,
                            args: &args,
                        }
                    ),
                );
                if let Some(e) = truncated {
                    sink.record(session_id, format_args!("Truncated {}: {}", descriptor.name, e));
                    log::warn!("[DECODE] {}@{}: {}", descriptor.name, header.object_id, e);
                }

                if descriptor.destructor {
                    objects.remove(header.object_id);
                }
            }
            None => {
                while let Some(fd) = source.inbound_fds_mut().pop() {
                    peer.queue_descriptor(fd)?;
                }
            }
        }

        peer.queue_bytes(&message)?;
        source.inbound_mut().consume(header.size)?;
        Ok(true)
    }
}

// =============================================================================
// Argument Decoding
// =============================================================================

/// State an argument walk touches besides the payload itself.
struct ArgumentWalk<'s> {
    schema: &'s Schema,
    objects: &'s mut ObjectTable,
    source: &'s mut Connection,
    peer: &'s mut Connection,
}

impl ArgumentWalk<'_> {
    /// Decode `payload` against `message`. A short payload stops the walk
    /// and is returned alongside whatever was decoded before it.
    fn decode(
        &mut self,
        message: &Message,
        payload: &[u8],
    ) -> Result<(Vec<ArgValue>, Option<WireError>), SessionError> {
        let mut cursor = WireCursor::new(payload);
        let mut values = Vec::with_capacity(message.args.len());

        for arg in &message.args {
            match self.decode_arg(arg.kind, &mut cursor) {
                Ok(value) => values.push(value),
                Err(SessionError::Truncated(e)) => return Ok((values, Some(e))),
                Err(e) => return Err(e),
            }
        }
        Ok((values, None))
    }

    fn decode_arg(&mut self, kind: ArgKind, cursor: &mut WireCursor<'_>) -> Result<ArgValue, SessionError> {
        Ok(match kind {
            ArgKind::Int => ArgValue::Int(cursor.read_i32()?),
            ArgKind::Uint => ArgValue::Uint(cursor.read_u32()?),
            ArgKind::Fixed => ArgValue::Fixed(cursor.read_fixed()?),
            ArgKind::String => ArgValue::String(cursor.read_string()?),
            ArgKind::Object => ArgValue::Object(cursor.read_u32()?),
            ArgKind::Array => ArgValue::Array(cursor.read_array()?.len()),
            ArgKind::NewId(interface) => {
                let id = cursor.read_u32()?;
                if id != 0 {
                    self.objects.bind(id, Some(interface))?;
                }
                ArgValue::NewId(id)
            }
            ArgKind::NewIdDynamic => {
                let interface = cursor.read_string()?;
                let version = cursor.read_u32()?;
                let id = cursor.read_u32()?;
                if id != 0 {
                    let resolved = interface.as_deref().and_then(|name| self.schema.lookup(name));
                    if resolved.is_none() {
                        log::debug!("[DECODE] Interface {:?} for id {} is not loaded", interface, id);
                    }
                    self.objects.bind(id, resolved)?;
                }
                ArgValue::NewIdDynamic {
                    id,
                    interface,
                    version,
                }
            }
            ArgKind::Fd => match self.source.inbound_fds_mut().pop() {
                Some(fd) => {
                    let raw = fd.as_raw_fd();
                    self.peer.queue_descriptor(fd)?;
                    ArgValue::Fd(Some(raw))
                }
                None => {
                    log::warn!("[DECODE] Message expects a descriptor but none was received");
                    ArgValue::Fd(None)
                }
            },
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
