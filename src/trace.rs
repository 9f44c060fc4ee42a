//! Trace output.
//!
//! Every forwarded message produces one record on a [`TraceSink`]:
//!
//! ```text
//! [ 1234.567] 0: <= wl_display@1.get_registry(new_id 2)
//! [ 1234.601] 0: => wl_registry@2.global(1, "wl_compositor", 6)
//! ```
//!
//! The session prefix only appears when the proxy serves several clients.
//! Failing to write a record is logged and otherwise ignored: tracing never
//! gets in the way of forwarding.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::schema::Direction;

// =============================================================================
// Sink
// =============================================================================

pub struct TraceSink {
    out: Box<dyn Write>,
    tag_sessions: bool,
    timestamps: bool,
}

impl TraceSink {
    pub fn new(out: Box<dyn Write>) -> Self {
        Self {
            out,
            tag_sessions: false,
            timestamps: true,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Create (or truncate) `path` and trace into it.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }

    /// Prefix each record with its session id.
    pub fn tag_sessions(mut self, enabled: bool) -> Self {
        self.tag_sessions = enabled;
        self
    }

    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Write one record for `session`.
    pub fn record(&mut self, session: u32, text: fmt::Arguments<'_>) {
        if let Err(e) = self.write_record(session, text) {
            log::warn!("[TRACE] Failed to write trace record: {}", e);
        }
    }

    fn write_record(&mut self, session: u32, text: fmt::Arguments<'_>) -> io::Result<()> {
        if self.timestamps {
            write!(self.out, "[{:10.3}] ", timestamp_ms())?;
        }
        if self.tag_sessions {
            write!(self.out, "{}: ", session)?;
        }
        self.out.write_fmt(text)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

/// Milliseconds on a wrapping 32-bit microsecond clock.
fn timestamp_ms() -> f64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    f64::from(micros as u32) / 1000.0
}

// =============================================================================
// Record Formatting
// =============================================================================

/// `<=` for requests from the client, `=>` for events from the compositor.
pub fn arrow(direction: Direction) -> &'static str {
    match direction {
        Direction::Request => "<=",
        Direction::Event => "=>",
    }
}

/// One decoded argument, rendered the way it appears in a trace record.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Int(i32),
    Uint(u32),
    Fixed(f64),
    String(Option<String>),
    Object(u32),
    NewId(u32),
    NewIdDynamic {
        id: u32,
        interface: Option<String>,
        version: u32,
    },
    Array(usize),
    /// The descriptor number on our side, if one was queued
    Fd(Option<RawFd>),
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Int(v) => write!(f, "{v}"),
            ArgValue::Uint(v) => write!(f, "{v}"),
            ArgValue::Fixed(v) => write!(f, "{v:.6}"),
            ArgValue::String(Some(s)) => write!(f, "\"{s}\""),
            ArgValue::String(None) => f.write_str("(null)"),
            ArgValue::Object(id) => write!(f, "obj {id}"),
            ArgValue::NewId(id) => write!(f, "new_id {id}"),
            ArgValue::NewIdDynamic {
                id,
                interface,
                version,
            } => write!(
                f,
                "new_id {}[{},{}]",
                id,
                interface.as_deref().unwrap_or("(null)"),
                version
            ),
            ArgValue::Array(len) => write!(f, "array: {len}"),
            ArgValue::Fd(Some(fd)) => write!(f, "fd {fd}"),
            ArgValue::Fd(None) => f.write_str("fd (missing)"),
        }
    }
}

/// A decoded message: `<= wl_display@1.get_registry(new_id 2)`.
pub struct Call<'a> {
    pub direction: Direction,
    pub interface: &'a str,
    pub object_id: u32,
    pub message: &'a str,
    pub args: &'a [ArgValue],
}

impl fmt::Display for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}@{}.{}(",
            arrow(self.direction),
            self.interface,
            self.object_id,
            self.message
        )?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        f.write_str(")")
    }
}

/// Undecoded traffic: byte count, hex bytes and descriptor numbers.
pub struct RawDump<'a> {
    pub direction: Direction,
    pub bytes: &'a [u8],
    pub fds: &'a [RawFd],
}

impl fmt::Display for RawDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} Data dumped: {} bytes:", arrow(self.direction), self.bytes.len())?;
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        if !self.fds.is_empty() {
            write!(f, "\n{} Fds in control data:", self.fds.len())?;
            for fd in self.fds {
                write!(f, " {fd}")?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Test Support
// =============================================================================


// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::testing::capture;
    use super::*;

    #[test]
    fn test_arrow_points_away_from_the_sender() {
        assert_eq!(arrow(Direction::Request), "<=");
        assert_eq!(arrow(Direction::Event), "=>");
    }

    #[test]
    fn test_call_formatting() {
        let args = [
            ArgValue::Int(-3),
            ArgValue::Uint(7),
            ArgValue::Fixed(1.5),
            ArgValue::String(Some("hi".into())),
            ArgValue::String(None),
            ArgValue::Object(4),
            ArgValue::NewId(5),
            ArgValue::Array(12),
            ArgValue::Fd(Some(9)),
        ];
        let call = Call {
            direction: Direction::Request,
            interface: "test_everything",
            object_id: 3,
            message: "all",
            args: &args,
        };
        assert_eq!(
            call.to_string(),
            "<= test_everything@3.all(-3, 7, 1.500000, \"hi\", (null), obj 4, new_id 5, array: 12, fd 9)"
        );
    }

    #[test]
    fn test_dynamic_new_id_formatting() {
        let bind = ArgValue::NewIdDynamic {
            id: 6,
            interface: Some("wl_compositor".into()),
            version: 4,
        };
        assert_eq!(bind.to_string(), "new_id 6[wl_compositor,4]");

        let call = Call {
            direction: Direction::Event,
            interface: "wl_callback",
            object_id: 3,
            message: "done",
            args: &[],
        };
        assert_eq!(call.to_string(), "=> wl_callback@3.done()");
    }

    #[test]
    fn test_raw_dump_formatting() {
        let dump = RawDump {
            direction: Direction::Event,
            bytes: &[0x01, 0x00, 0xab],
            fds: &[5, 6],
        };
        assert_eq!(
            dump.to_string(),
            "=> Data dumped: 3 bytes:\n01 00 ab\n2 Fds in control data: 5 6"
        );
    }

    #[test]
    fn test_record_prefixes() {
        let (sink, buffer) = capture();
        let mut sink = sink.tag_sessions(true);
        sink.record(2, format_args!("hello"));
        assert_eq!(buffer.contents(), "2: hello\n");

        let (mut sink, buffer) = capture();
        sink.record(2, format_args!("hello"));
        assert_eq!(buffer.contents(), "hello\n");
    }

    #[test]
    fn test_timestamped_record() {
        let (sink, buffer) = capture();
        let mut sink = sink.timestamps(true);
        sink.record(0, format_args!("x"));
        let line = buffer.contents();
        assert!(line.starts_with('['));
        assert!(line.ends_with("] x\n"));
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let mut sink = TraceSink::file(&path).unwrap().timestamps(false);
        sink.record(0, format_args!("<= wl_display@1.sync(new_id 3)"));
        drop(sink);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "<= wl_display@1.sync(new_id 3)\n"
        );
    }
}
