//! Command line and environment.
//!
//! ## Usage
//!
//! ```bash
//! # Trace one program, decoding with the core protocol
//! wl-tracer -d /usr/share/wayland/wayland.xml -- weston-terminal
//!
//! # Serve any number of clients on $XDG_RUNTIME_DIR/wl-trace
//! wl-tracer -S wl-trace -o trace.log
//! WAYLAND_DISPLAY=wl-trace foot
//! ```
//!
//! ## Environment Variables
//!
//! - `WAYLAND_DISPLAY`: Upstream compositor socket (default: `wayland-0`)
//! - `WAYLAND_SOCKET`: Already connected upstream descriptor, used instead of `WAYLAND_DISPLAY`
//! - `XDG_RUNTIME_DIR`: Directory for socket files
//! - `RUST_LOG`: Log level (`error`, `warn`, `info`, `debug`, `trace`)

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::Parser;
use thiserror::Error;

/// Default upstream compositor socket name
pub const DEFAULT_WAYLAND_DISPLAY: &str = "wayland-0";

#[derive(Debug, Parser)]
#[command(name = "wl-tracer", version, about = "A Wayland protocol dumper")]
pub struct Cli {
    /// Listen on socket NAME for any number of clients
    #[arg(short = 'S', long = "socket", value_name = "NAME")]
    pub socket: Option<String>,

    /// Write the trace to FILE instead of stdout
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Decode messages with protocol FILE (repeatable)
    #[arg(short = 'd', long = "protocol", value_name = "FILE")]
    pub protocols: Vec<PathBuf>,

    /// Program to run and trace, with its arguments
    #[arg(
        last = true,
        value_name = "PROGRAM",
        required_unless_present = "socket",
        conflicts_with = "socket"
    )]
    pub program: Vec<OsString>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("XDG_RUNTIME_DIR not set in the environment")]
    NoRuntimeDir,

    #[error("no program specified")]
    NoProgram,

    #[error("listen socket {0} is the upstream socket")]
    SameSocket(PathBuf),
}

/// The environment variables the tracer reads.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub runtime_dir: Option<PathBuf>,
    pub display: Option<String>,
    pub wayland_socket: Option<String>,
}

impl Environment {
    pub fn from_env() -> Self {
        Self {
            runtime_dir: env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
            display: env::var("WAYLAND_DISPLAY").ok(),
            wayland_socket: env::var("WAYLAND_SOCKET").ok(),
        }
    }

    /// Resolve the upstream compositor socket.
    ///
    /// An absolute `WAYLAND_DISPLAY` is used directly, anything else is
    /// joined with `XDG_RUNTIME_DIR`.
    pub fn upstream_path(&self) -> Result<PathBuf, ConfigError> {
        let display = self.display.as_deref().unwrap_or(DEFAULT_WAYLAND_DISPLAY);
        if display.starts_with('/') {
            Ok(PathBuf::from(display))
        } else {
            Ok(self.runtime_dir()?.join(display))
        }
    }

    fn runtime_dir(&self) -> Result<&Path, ConfigError> {
        self.runtime_dir.as_deref().ok_or(ConfigError::NoRuntimeDir)
    }
}

/// Resolve a socket path argument.
///
/// - Absolute paths (`/...`) are used as-is
/// - Relative paths (`./...`, `../...`) are used as-is
/// - Bare names are joined with `XDG_RUNTIME_DIR`
pub fn resolve_socket_path(arg: &str, runtime_dir: &Path) -> PathBuf {
    if arg.starts_with('/') || arg.starts_with("./") || arg.starts_with("../") {
        PathBuf::from(arg)
    } else {
        log::debug!("Socket '{}' resolved to XDG_RUNTIME_DIR/{}", arg, arg);
        runtime_dir.join(arg)
    }
}

// =============================================================================
// Resolved Settings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Serve clients connecting to a socket at this path
    Listen(PathBuf),
    /// Run one program on a private socket pair
    Spawn { program: OsString, args: Vec<OsString> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamSource {
    Path(PathBuf),
    /// The raw `WAYLAND_SOCKET` value
    Inherited(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mode: Mode,
    pub upstream: UpstreamSource,
    pub output: Option<PathBuf>,
    pub protocols: Vec<PathBuf>,
}

impl Settings {
    pub fn resolve(cli: Cli, env: &Environment) -> Result<Self, ConfigError> {
        let upstream = match &env.wayland_socket {
            Some(value) => UpstreamSource::Inherited(value.clone()),
            None => UpstreamSource::Path(env.upstream_path()?),
        };

        let mode = match cli.socket {
            Some(name) => {
                let path = resolve_socket_path(&name, env.runtime_dir()?);
                if upstream == UpstreamSource::Path(path.clone()) {
                    return Err(ConfigError::SameSocket(path));
                }
                Mode::Listen(path)
            }
            None => {
                let mut words = cli.program.into_iter();
                let program = words.next().ok_or(ConfigError::NoProgram)?;
                Mode::Spawn {
                    program,
                    args: words.collect(),
                }
            }
        };

        Ok(Self {
            mode,
            upstream,
            output: cli.output,
            protocols: cli.protocols,
        })
    }

    /// Whether the whole run is a single session.
    pub fn single_peer(&self) -> bool {
        matches!(self.mode, Mode::Spawn { .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
