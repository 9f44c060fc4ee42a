//! Wayland protocol XML loader.
//!
//! Reads `<protocol>` documents and turns them into unresolved
//! [`InterfaceDef`]s, reporting problems with file and line. Descriptions,
//! copyright notices and enums carry nothing the tracer needs and are
//! skipped.

use std::path::Path;

use roxmltree::{Document, Node};

use crate::schema::{ArgDef, ArgType, InterfaceDef, Location, MessageDef, Schema, SchemaError};

/// Load and resolve every protocol file in `paths`.
pub fn load_files<P: AsRef<Path>>(paths: &[P]) -> Result<Schema, SchemaError> {
    let mut defs = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let parsed = parse_file(path)?;
        log::debug!("Loaded {} interfaces from {}", parsed.len(), path.display());
        defs.extend(parsed);
    }
    Schema::from_definitions(defs)
}

/// Parse one protocol file.
pub fn parse_file(path: &Path) -> Result<Vec<InterfaceDef>, SchemaError> {
    let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&text, path)
}

/// Parse protocol XML held in memory; `path` is only used in diagnostics.
pub fn parse_str(text: &str, path: &Path) -> Result<Vec<InterfaceDef>, SchemaError> {
    let doc = Document::parse(text).map_err(|source| SchemaError::Xml {
        path: path.to_path_buf(),
        source,
    })?;
    let parser = Parser { doc: &doc, path };

    let protocol = doc.root_element();
    if !protocol.has_tag_name("protocol") {
        return Err(SchemaError::invalid(
            &parser.location(protocol),
            format!("expected <protocol>, found <{}>", protocol.tag_name().name()),
        ));
    }
    parser.required(protocol, "name", "no protocol name given")?;

    protocol
        .children()
        .filter(|node| node.has_tag_name("interface"))
        .map(|node| parser.interface(node))
        .collect()
}

struct Parser<'a, 'input> {
    doc: &'a Document<'input>,
    path: &'a Path,
}

impl<'a, 'input> Parser<'a, 'input> {
    fn location(&self, node: Node<'_, '_>) -> Location {
        Location {
            file: self.path.to_path_buf(),
            line: self.doc.text_pos_at(node.range().start).row,
        }
    }

    fn required(&self, node: Node<'a, 'input>, attr: &str, missing: &str) -> Result<&'a str, SchemaError> {
        node.attribute(attr)
            .ok_or_else(|| SchemaError::invalid(&self.location(node), missing))
    }

    fn number(&self, node: Node<'a, 'input>, attr: &str) -> Result<u32, SchemaError> {
        match node.attribute(attr) {
            None => Ok(1),
            Some(value) => value.parse().map_err(|_| {
                SchemaError::invalid(&self.location(node), format!("invalid {attr} '{value}'"))
            }),
        }
    }

    fn interface(&self, node: Node<'a, 'input>) -> Result<InterfaceDef, SchemaError> {
        let name = self.required(node, "name", "no interface name given")?;
        let mut requests = Vec::new();
        let mut events = Vec::new();

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "request" => requests.push(self.message(child, "request")?),
                "event" => events.push(self.message(child, "event")?),
                _ => {}
            }
        }

        Ok(InterfaceDef {
            name: name.to_owned(),
            version: self.number(node, "version")?,
            requests,
            events,
            location: self.location(node),
        })
    }

    fn message(&self, node: Node<'a, 'input>, kind: &str) -> Result<MessageDef, SchemaError> {
        let name = self.required(node, "name", &format!("no {kind} name given"))?;
        let destructor = node.attribute("type") == Some("destructor");
        if name == "destroy" && !destructor {
            return Err(SchemaError::invalid(
                &self.location(node),
                format!("destroy {kind} should be destructor type"),
            ));
        }

        let mut args = Vec::new();
        let mut new_ids = 0;
        for child in node.children().filter(|n| n.has_tag_name("arg")) {
            let arg = self.arg(child)?;
            if arg.ty == ArgType::NewId {
                new_ids += 1;
                if new_ids > 1 {
                    return Err(SchemaError::invalid(
                        &arg.location,
                        "there can't be more than one new_id's in one message",
                    ));
                }
            }
            args.push(arg);
        }

        Ok(MessageDef {
            name: name.to_owned(),
            destructor,
            since: self.number(node, "since")?,
            args,
        })
    }

    fn arg(&self, node: Node<'a, 'input>) -> Result<ArgDef, SchemaError> {
        let location = self.location(node);
        let name = self.required(node, "name", "no argument name given")?;
        let type_name = self.required(node, "type", "no argument type given")?;
        let ty: ArgType = type_name
            .parse()
            .map_err(|_| SchemaError::invalid(&location, format!("unknown type ({type_name})")))?;

        let interface = node.attribute("interface");
        if interface.is_some() && !ty.takes_interface() {
            return Err(SchemaError::invalid(
                &location,
                format!("interface attribute not allowed for type {type_name}"),
            ));
        }

        Ok(ArgDef {
            name: name.to_owned(),
            ty,
            interface: interface.map(str::to_owned),
            location,
        })
    }
}

// =============================================================================
// Test Support
// =============================================================================

/// A trimmed core protocol plus one interface using every argument kind.
#[cfg(test)]
pub mod testing {
    use std::path::Path;

    use crate::schema::Schema;

    pub const TEST_PROTOCOL: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<protocol name="test_core">
  <copyright>Test fixture</copyright>
  <interface name="wl_display" version="1">
    <description summary="core global object">The root.</description>
    <request name="sync">
      <arg name="callback" type="new_id" interface="wl_callback"/>
    </request>
    <request name="get_registry">
      <arg name="registry" type="new_id" interface="wl_registry"/>
    </request>
    <event name="error">
      <arg name="object_id" type="object"/>
      <arg name="code" type="uint"/>
      <arg name="message" type="string"/>
    </event>
    <event name="delete_id">
      <arg name="id" type="uint"/>
    </event>
    <enum name="error">
      <entry name="invalid_object" value="0"/>
    </enum>
  </interface>
  <interface name="wl_registry" version="1">
    <request name="bind">
      <arg name="name" type="uint"/>
      <arg name="id" type="new_id"/>
    </request>
    <event name="global">
      <arg name="name" type="uint"/>
      <arg name="interface" type="string"/>
      <arg name="version" type="uint"/>
    </event>
  </interface>
  <interface name="wl_callback" version="1">
    <event name="done" type="destructor">
      <arg name="callback_data" type="uint"/>
    </event>
  </interface>
  <interface name="wl_shm" version="1">
    <request name="create_pool">
      <arg name="id" type="new_id" interface="wl_shm_pool"/>
      <arg name="fd" type="fd"/>
      <arg name="size" type="int"/>
    </request>
  </interface>
  <interface name="wl_shm_pool" version="1">
    <request name="destroy" type="destructor"/>
  </interface>
  <interface name="test_everything" version="1">
    <request name="all">
      <arg name="i" type="int"/>
      <arg name="u" type="uint"/>
      <arg name="f" type="fixed"/>
      <arg name="s" type="string" allow-null="true"/>
      <arg name="o" type="object" interface="wl_callback"/>
      <arg name="n" type="new_id" interface="wl_callback"/>
      <arg name="a" type="array"/>
      <arg name="h" type="fd"/>
    </request>
  </interface>
</protocol>
"#;

    pub fn test_schema() -> Schema {
        let defs = super::parse_str(TEST_PROTOCOL, Path::new("test-core.xml")).unwrap();
        Schema::from_definitions(defs).unwrap()
    }
}

// =============================================================================
// Tests
// =============================================================================
