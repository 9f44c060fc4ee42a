//! # wl-tracer
//!
//! A transparent Wayland proxy that prints the protocol traffic passing
//! through it.
//!
//! ## Overview
//!
//! The tracer sits between Wayland clients and the real compositor and
//! forwards every message unchanged. Given protocol XML files it decodes
//! each message into `interface@id.message(args)` form; without them it
//! dumps raw bytes.
//!
//! It either runs one program on a private socket pair (`-- PROGRAM`) and
//! exits with it, or serves any number of clients on a named socket (`-S`).
//! See [`config`] for flags and environment variables.

mod config;
mod connection;
mod objects;
mod proxy;
mod ring;
mod schema;
mod session;
mod socket;
mod trace;
mod wire;
mod xml;

use std::env;
use std::path::PathBuf;
use std::process::{Child, ExitCode};
use std::rc::Rc;

use calloop::EventLoop;
use clap::Parser;
use thiserror::Error;

use config::{Cli, ConfigError, Environment, Mode, Settings, UpstreamSource};
use proxy::{Proxy, ProxyError, Upstream};
use schema::{Direction, Schema, SchemaError};
use socket::{ListenSocket, SocketError};
use trace::TraceSink;

#[derive(Debug, Error)]
enum TracerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Socket(#[from] SocketError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("unable to open output file {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wl-tracer: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), TracerError> {
    let settings = Settings::resolve(cli, &Environment::from_env())?;

    let schema = if settings.protocols.is_empty() {
        log::info!("No protocol files given, dumping raw traffic");
        None
    } else {
        Some(Rc::new(load_schema(&settings.protocols)?))
    };

    let sink = match &settings.output {
        Some(path) => TraceSink::file(path).map_err(|source| TracerError::Output {
            path: path.clone(),
            source,
        })?,
        None => TraceSink::stdout(),
    }
    .tag_sessions(!settings.single_peer());

    let upstream = match &settings.upstream {
        UpstreamSource::Path(path) => {
            log::info!("Upstream compositor: {}", path.display());
            if !path.exists() {
                log::warn!("Upstream socket does not exist: {}", path.display());
            }
            Upstream::Path(path.clone())
        }
        UpstreamSource::Inherited(value) => {
            let socket = socket::inherited_socket(value)?;
            env::remove_var("WAYLAND_SOCKET");
            log::info!("Upstream compositor: inherited WAYLAND_SOCKET={}", value);
            Upstream::Inherited(Some(socket))
        }
    };

    let mut event_loop: EventLoop<'static, Proxy> = EventLoop::try_new().map_err(ProxyError::EventLoop)?;
    let mut proxy = Proxy::new(event_loop.handle(), upstream, schema, sink, settings.single_peer());

    let mut child = None;
    match settings.mode {
        Mode::Listen(path) => proxy.listen(ListenSocket::bind(&path)?)?,
        Mode::Spawn { program, args } => {
            let (ours, spawned) = socket::spawn_client(&program, args.as_slice())?;
            child = Some(spawned);
            if let Err(e) = proxy.add_session(ours) {
                if let Some(child) = child.as_mut() {
                    reap(child);
                }
                return Err(e.into());
            }
        }
    }

    let result = proxy::run(&mut event_loop, &mut proxy);
    if let Some(child) = child.as_mut() {
        reap(child);
    }
    result.map_err(TracerError::from)
}

fn load_schema(paths: &[PathBuf]) -> Result<Schema, SchemaError> {
    let schema = xml::load_files(paths)?;
    log::info!("Loaded {} interfaces from {} protocol files", schema.len(), paths.len());

    if log::log_enabled!(log::Level::Trace) {
        for id in schema.interface_ids() {
            let interface = schema.interface(id);
            for direction in [Direction::Request, Direction::Event] {
                for message in interface.messages(direction) {
                    let args: Vec<&str> = message.args.iter().map(|arg| arg.name.as_str()).collect();
                    log::trace!(
                        "[SCHEMA] {} v{} {:?} {}({}) '{}' since {}",
                        interface.name,
                        interface.version,
                        direction,
                        message.name,
                        args.join(", "),
                        message.signature(),
                        message.since
                    );
                }
            }
        }
    }
    Ok(schema)
}

/// Collect the spawned client's exit status if it has already exited.
fn reap(child: &mut Child) {
    match child.try_wait() {
        Ok(Some(status)) => log::info!("Client exited: {}", status),
        Ok(None) => log::info!("Client (pid {}) still running", child.id()),
        Err(e) => log::warn!("Failed to reap client: {}", e),
    }
}
