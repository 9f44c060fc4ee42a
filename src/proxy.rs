//! Event loop glue.
//!
//! [`Proxy`] is the state every `calloop` callback receives. It owns the
//! sessions, the trace sink and the way to reach the compositor. Each
//! session registers a readable source per socket, plus a writable source
//! for a socket while output to it is blocked. Whichever source sees the
//! session end removes itself and all the others.

use std::collections::HashMap;
use std::io;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use thiserror::Error;

use crate::schema::Schema;
use crate::session::{Session, SessionStatus, Side};
use crate::socket::ListenSocket;
use crate::trace::TraceSink;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to create event loop: {0}")]
    EventLoop(#[source] calloop::Error),

    #[error("failed to register event source: {0}")]
    Register(#[source] calloop::Error),

    #[error("event loop failed: {0}")]
    Dispatch(#[source] calloop::Error),

    #[error("unable to connect to the compositor: {0}")]
    Upstream(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// How a new session reaches the compositor.
#[derive(Debug)]
pub enum Upstream {
    /// Connect to this socket once per session
    Path(PathBuf),
    /// A connected socket that can serve one session
    Inherited(Option<UnixStream>),
}

impl Upstream {
    fn connect(&mut self) -> io::Result<UnixStream> {
        match self {
            Upstream::Path(path) => UnixStream::connect(path),
            Upstream::Inherited(socket) => socket.take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, "inherited upstream socket already in use")
            }),
        }
    }
}

/// What a registered source waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Watch {
    Readable(Side),
    Writable(Side),
}

impl Watch {
    fn interest(self) -> Interest {
        match self {
            Watch::Readable(_) => Interest::READ,
            Watch::Writable(_) => Interest::WRITE,
        }
    }
}

struct SessionEntry {
    session: Session,
    sources: HashMap<Watch, RegistrationToken>,
}

// =============================================================================
// Proxy State
// =============================================================================

pub struct Proxy {
    handle: LoopHandle<'static, Proxy>,
    sessions: HashMap<u32, SessionEntry>,
    next_session_id: u32,
    upstream: Upstream,
    schema: Option<Rc<Schema>>,
    sink: TraceSink,
    single_peer: bool,
    finished: bool,
}

impl Proxy {
    /// In single-peer mode the end of the first session ends the run.
    pub fn new(
        handle: LoopHandle<'static, Proxy>,
        upstream: Upstream,
        schema: Option<Rc<Schema>>,
        sink: TraceSink,
        single_peer: bool,
    ) -> Self {
        Self {
            handle,
            sessions: HashMap::new(),
            next_session_id: 0,
            upstream,
            schema,
            sink,
            single_peer,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept clients on `socket` for as long as the loop runs.
    pub fn listen(&mut self, socket: ListenSocket) -> Result<(), ProxyError> {
        log::info!("Listening: {}", socket.path().display());
        self.handle
            .insert_source(
                Generic::new(socket, Interest::READ, Mode::Level),
                |_, socket, proxy: &mut Proxy| {
                    proxy.handle_new_connection(socket);
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|e| ProxyError::Register(e.error))?;
        Ok(())
    }

    /// Pair `client` with a fresh upstream connection and start serving it.
    pub fn add_session(&mut self, client: UnixStream) -> Result<u32, ProxyError> {
        let server = self.upstream.connect().map_err(ProxyError::Upstream)?;
        let id = self.next_session_id;
        let session = Session::new(id, client, server, self.schema.clone())?;

        let mut sources = HashMap::new();
        for side in [Side::Client, Side::Server] {
            let watch = Watch::Readable(side);
            match self.register(id, watch, session.connection(side).socket()) {
                Ok(token) => {
                    sources.insert(watch, token);
                }
                Err(e) => {
                    for (_, token) in sources {
                        self.handle.remove(token);
                    }
                    return Err(e);
                }
            }
        }

        self.next_session_id += 1;
        self.sessions.insert(id, SessionEntry { session, sources });
        log::info!("[SESSION {}] Started", id);
        Ok(id)
    }

    fn register(&self, id: u32, watch: Watch, socket: &UnixStream) -> Result<RegistrationToken, ProxyError> {
        // The source gets its own descriptor; the session keeps the original
        let socket = socket.try_clone()?;
        self.handle
            .insert_source(
                Generic::new(socket, watch.interest(), Mode::Level),
                move |_, _, proxy: &mut Proxy| {
                    Ok(match watch {
                        Watch::Readable(side) => proxy.handle_readable(id, side),
                        Watch::Writable(side) => proxy.handle_writable(id, side),
                    })
                },
            )
            .map_err(|e| ProxyError::Register(e.error))
    }

    /// Watch for writability on every socket of session `id` with blocked
    /// output that is not watched yet.
    fn watch_blocked_output(&mut self, id: u32) -> Result<(), ProxyError> {
        let Some(entry) = self.sessions.get(&id) else {
            return Ok(());
        };

        let blocked: Vec<Side> = [Side::Client, Side::Server]
            .into_iter()
            .filter(|&side| {
                entry.session.connection(side).wants_flush()
                    && !entry.sources.contains_key(&Watch::Writable(side))
            })
            .collect();

        for side in blocked {
            let Some(entry) = self.sessions.get(&id) else {
                break;
            };
            let token = self.register(id, Watch::Writable(side), entry.session.connection(side).socket())?;
            log::debug!("[SESSION {}] Output to {:?} blocked, waiting for writable", id, side);
            if let Some(entry) = self.sessions.get_mut(&id) {
                entry.sources.insert(Watch::Writable(side), token);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Event Handlers
    // =========================================================================

    fn handle_new_connection(&mut self, socket: &ListenSocket) {
        match socket.accept() {
            Ok(Some(stream)) => {
                log::info!("New client connection");
                if let Err(e) = self.add_session(stream) {
                    log::error!("Failed to start session: {}", e);
                }
            }
            Ok(None) => {
                // No pending connections
            }
            Err(e) => {
                log::warn!("Accept failed: {}", e);
            }
        }
    }

    fn handle_readable(&mut self, id: u32, side: Side) -> PostAction {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return PostAction::Remove;
        };

        match entry.session.handle_readable(side, &mut self.sink) {
            Ok(SessionStatus::Open) => match self.watch_blocked_output(id) {
                Ok(()) => return PostAction::Continue,
                Err(e) => log::error!("[SESSION {}] Closing: {}", id, e),
            },
            Ok(SessionStatus::Closed) => {
                log::info!("[SESSION {}] {:?} disconnected", id, side);
            }
            Err(e) => {
                log::warn!("[SESSION {}] Closing: {}", id, e);
                self.sink.record(id, format_args!("Session closed: {}", e));
            }
        }

        self.close_session(id, Watch::Readable(side));
        PostAction::Remove
    }

    fn handle_writable(&mut self, id: u32, side: Side) -> PostAction {
        let Some(entry) = self.sessions.get_mut(&id) else {
            return PostAction::Remove;
        };

        match entry.session.handle_writable(side) {
            Ok(true) => return PostAction::Continue,
            Ok(false) => {
                entry.sources.remove(&Watch::Writable(side));
                log::debug!("[SESSION {}] Output to {:?} drained", id, side);
                return PostAction::Remove;
            }
            Err(e) => {
                log::warn!("[SESSION {}] Closing: {}", id, e);
                self.sink.record(id, format_args!("Session closed: {}", e));
            }
        }

        self.close_session(id, Watch::Writable(side));
        PostAction::Remove
    }

    /// Drop session `id`. The source waiting on `origin` removes itself.
    fn close_session(&mut self, id: u32, origin: Watch) {
        if let Some(entry) = self.sessions.remove(&id) {
            for (watch, token) in &entry.sources {
                if *watch != origin {
                    self.handle.remove(*token);
                }
            }
            log::debug!(
                "[SESSION {}] Closed with {} live objects",
                entry.session.id(),
                entry.session.objects().len()
            );
        }

        if self.single_peer {
            self.finished = true;
        } else {
            log::info!("{} sessions remaining", self.session_count());
        }
    }
}

/// Dispatch until the proxy is finished.
pub fn run(event_loop: &mut EventLoop<'static, Proxy>, proxy: &mut Proxy) -> Result<(), ProxyError> {
    log::info!("Starting event loop (Ctrl+C to exit)");
    while !proxy.is_finished() {
        event_loop.dispatch(None, proxy).map_err(ProxyError::Dispatch)?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
