//! Protocol schema: interfaces, messages and typed arguments.
//!
//! A [`Schema`] is built once at startup from the definitions produced by
//! the XML loader and is read-only afterwards. Interfaces live in an arena
//! and refer to each other by [`InterfaceId`]; every interface name a
//! `new_id` argument mentions is resolved while building, so decoding never
//! looks anything up by position or by string except for dynamically typed
//! `new_id`s.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// The interface every session starts with
pub const ROOT_INTERFACE: &str = "wl_display";

/// Object id of the root interface
pub const ROOT_OBJECT_ID: u32 = 1;

// =============================================================================
// Errors
// =============================================================================

/// Where a definition came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: PathBuf,
    pub line: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.line)
    }
}

/// Errors raised while loading protocol files. All of them abort startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unable to open protocol file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: malformed XML: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },

    #[error("{location}: error: {message}")]
    Invalid { location: Location, message: String },

    #[error("no protocol defines the root interface {}", ROOT_INTERFACE)]
    MissingRoot,
}

impl SchemaError {
    pub(crate) fn invalid(location: &Location, message: impl Into<String>) -> Self {
        Self::Invalid {
            location: location.clone(),
            message: message.into(),
        }
    }
}

// =============================================================================
// Resolved Schema
// =============================================================================

/// Index of an interface within a [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceId(usize);

/// Which message list of an interface applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server
    Request,
    /// Server to client
    Event,
}

/// The wire encoding of one argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Uint,
    Fixed,
    String,
    Object,
    /// New object of a statically known interface
    NewId(InterfaceId),
    /// New object typed by an interface name carried in the message
    NewIdDynamic,
    Array,
    Fd,
}

impl ArgKind {
    /// The single-character signature code.
    pub fn code(self) -> char {
        match self {
            ArgKind::Int => 'i',
            ArgKind::Uint => 'u',
            ArgKind::Fixed => 'f',
            ArgKind::String => 's',
            ArgKind::Object => 'o',
            ArgKind::NewId(_) => 'n',
            ArgKind::NewIdDynamic => 'N',
            ArgKind::Array => 'a',
            ArgKind::Fd => 'h',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg {
    pub name: String,
    pub kind: ArgKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub name: String,
    pub args: Vec<Arg>,
    pub destructor: bool,
    pub since: u32,
}

impl Message {
    pub fn signature(&self) -> String {
        self.args.iter().map(|arg| arg.kind.code()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub version: u32,
    pub requests: Vec<Message>,
    pub events: Vec<Message>,
}

impl Interface {
    pub fn messages(&self, direction: Direction) -> &[Message] {
        match direction {
            Direction::Request => &self.requests,
            Direction::Event => &self.events,
        }
    }
}

/// The loaded protocol definitions.
#[derive(Debug)]
pub struct Schema {
    interfaces: Vec<Interface>,
    by_name: HashMap<String, InterfaceId>,
    root: InterfaceId,
}

impl Schema {
    /// Resolve parsed definitions into a schema.
    ///
    /// Fails on duplicate interface names, `new_id` arguments naming an
    /// interface no definition provides, and a missing root interface.
    pub fn from_definitions(defs: Vec<InterfaceDef>) -> Result<Self, SchemaError> {
        let mut by_name = HashMap::with_capacity(defs.len());
        for (index, def) in defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), InterfaceId(index)).is_some() {
                return Err(SchemaError::invalid(
                    &def.location,
                    format!("duplicate interface {}", def.name),
                ));
            }
        }

        let resolve_all = |messages: Vec<MessageDef>| -> Result<Vec<Message>, SchemaError> {
            messages
                .into_iter()
                .map(|message| message.resolve(&by_name))
                .collect()
        };

        let mut interfaces = Vec::with_capacity(defs.len());
        for def in defs {
            interfaces.push(Interface {
                name: def.name,
                version: def.version,
                requests: resolve_all(def.requests)?,
                events: resolve_all(def.events)?,
            });
        }

        let root = *by_name.get(ROOT_INTERFACE).ok_or(SchemaError::MissingRoot)?;

        log::debug!("Schema loaded: {} interfaces", interfaces.len());
        Ok(Self {
            interfaces,
            by_name,
            root,
        })
    }

    #[inline]
    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub fn interface_ids(&self) -> impl Iterator<Item = InterfaceId> {
        (0..self.interfaces.len()).map(InterfaceId)
    }

    pub fn lookup(&self, name: &str) -> Option<InterfaceId> {
        self.by_name.get(name).copied()
    }

    #[inline]
    pub fn root(&self) -> InterfaceId {
        self.root
    }

    /// The message `opcode` of `interface` in `direction`, if it exists.
    pub fn message(&self, interface: InterfaceId, direction: Direction, opcode: u16) -> Option<&Message> {
        self.interface(interface)
            .messages(direction)
            .get(usize::from(opcode))
    }

    pub fn len(&self) -> usize {
        self.interfaces.len()
    }
}

// =============================================================================
// Unresolved Definitions
// =============================================================================

/// Argument types as spelled in protocol files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Int,
    Uint,
    Fixed,
    String,
    Object,
    NewId,
    Array,
    Fd,
}

impl ArgType {
    /// Whether an `interface` attribute is meaningful for this type.
    pub fn takes_interface(self) -> bool {
        matches!(self, ArgType::Object | ArgType::NewId)
    }
}

impl FromStr for ArgType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "int" => ArgType::Int,
            "uint" => ArgType::Uint,
            "fixed" => ArgType::Fixed,
            "string" => ArgType::String,
            "object" => ArgType::Object,
            "new_id" => ArgType::NewId,
            "array" => ArgType::Array,
            "fd" => ArgType::Fd,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArgDef {
    pub name: String,
    pub ty: ArgType,
    pub interface: Option<String>,
    pub location: Location,
}

#[derive(Debug, Clone)]
pub struct MessageDef {
    pub name: String,
    pub destructor: bool,
    pub since: u32,
    pub args: Vec<ArgDef>,
}

impl MessageDef {
    fn resolve(self, by_name: &HashMap<String, InterfaceId>) -> Result<Message, SchemaError> {
        let args = self
            .args
            .into_iter()
            .map(|arg| {
                let kind = match (arg.ty, &arg.interface) {
                    (ArgType::Int, _) => ArgKind::Int,
                    (ArgType::Uint, _) => ArgKind::Uint,
                    (ArgType::Fixed, _) => ArgKind::Fixed,
                    (ArgType::String, _) => ArgKind::String,
                    // Object targets may live in protocol files that were not loaded
                    (ArgType::Object, _) => ArgKind::Object,
                    (ArgType::Array, _) => ArgKind::Array,
                    (ArgType::Fd, _) => ArgKind::Fd,
                    (ArgType::NewId, None) => ArgKind::NewIdDynamic,
                    (ArgType::NewId, Some(name)) => {
                        let target = by_name.get(name).ok_or_else(|| {
                            SchemaError::invalid(&arg.location, format!("interface {name} not found"))
                        })?;
                        ArgKind::NewId(*target)
                    }
                };
                Ok(Arg {
                    name: arg.name,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, SchemaError>>()?;

        Ok(Message {
            name: self.name,
            args,
            destructor: self.destructor,
            since: self.since,
        })
    }
}

#[derive(Debug, Clone)]
pub struct InterfaceDef {
    pub name: String,
    pub version: u32,
    pub requests: Vec<MessageDef>,
    pub events: Vec<MessageDef>,
    pub location: Location,
}

// =============================================================================
// Tests
// =============================================================================
