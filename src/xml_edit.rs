//! Streaming XML patcher
//!
//! Reads a document with quick-xml and writes it straight back out. Events
//! the caller does not touch are re-emitted verbatim, so whitespace, comments
//! and attribute quoting of untouched elements survive. For each start tag
//! the caller decides to keep it, rewrite its attributes, or drop the whole
//! element subtree.

use crate::error::{Error, Result};
use crate::xml::{get_local_name, parse_attributes};
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesStart, Event};

/// Decision for one start tag
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Write the tag unchanged
    Keep,
    /// Write the tag with this attribute list (qualified names, raw values)
    Attributes(Vec<(String, String)>),
    /// Omit the element and everything inside it
    Drop,
}

/// Where the visited element sits in the document
#[derive(Debug)]
pub struct ElementContext<'a> {
    /// Local names of the open ancestors, outermost first
    pub ancestors: &'a [String],
    /// Local name of the element
    pub name: &'a str,
    /// Attributes as `(qualified name, unescaped value)`
    pub attributes: &'a [(String, String)],
}

impl ElementContext<'_> {
    /// Whether the direct parent has this local name
    pub fn parent_is(&self, name: &str) -> bool {
        self.ancestors.last().is_some_and(|p| p == name)
    }

    /// Whether any ancestor has this local name
    pub fn inside(&self, name: &str) -> bool {
        self.ancestors.iter().any(|p| p == name)
    }

    /// Attribute value by local name
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        crate::xml::attr(self.attributes, local_name)
    }

    /// The attribute list with `local_name` set to `value`
    ///
    /// An existing attribute keeps its position and prefix; a new one is
    /// appended.
    pub fn with_attr(&self, local_name: &str, value: &str) -> Vec<(String, String)> {
        let mut attrs = self.attributes.to_vec();
        match attrs
            .iter_mut()
            .find(|(k, _)| !k.starts_with("xmlns") && get_local_name(k) == local_name)
        {
            Some((_, v)) => *v = value.to_string(),
            None => attrs.push((local_name.to_string(), value.to_string())),
        }
        attrs
    }
}

/// Stream `xml` through `visit`, returning the patched document
///
/// `visit` runs for every start or empty tag; its decision applies to that
/// element only. Returns the input unchanged in content when every call
/// answers [`Edit::Keep`].
pub fn edit_xml<F>(xml: &str, mut visit: F) -> Result<String>
where
    F: FnMut(&ElementContext<'_>) -> Result<Edit>,
{
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut stack: Vec<String> = Vec::new();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::MalformedModel(e.to_string()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = local_name(e)?;
                let attributes = parse_attributes(e)?;
                let edit = visit(&ElementContext {
                    ancestors: &stack,
                    name: &name,
                    attributes: &attributes,
                })?;

                match edit {
                    Edit::Drop => {
                        if !is_empty {
                            skip_subtree(&mut reader)?;
                        }
                        continue;
                    }
                    Edit::Keep => write(&mut writer, event.borrow())?,
                    Edit::Attributes(attrs) => {
                        let tag = rebuild(e, &attrs)?;
                        if is_empty {
                            write(&mut writer, Event::Empty(tag))?;
                        } else {
                            write(&mut writer, Event::Start(tag))?;
                        }
                    }
                }
                if !is_empty {
                    stack.push(name);
                }
            }
            Event::End(_) => {
                stack.pop();
                write(&mut writer, event)?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|e| Error::xml_write(e.to_string()))
}

/// Apply `visit` to every element with the given local name
///
/// Convenience wrapper over [`edit_xml`] for the common single-tag rewrite.
pub fn edit_elements<F>(xml: &str, name: &str, mut visit: F) -> Result<String>
where
    F: FnMut(&ElementContext<'_>) -> Result<Edit>,
{
    edit_xml(xml, |ctx| {
        if ctx.name == name {
            visit(ctx)
        } else {
            Ok(Edit::Keep)
        }
    })
}

/// Append empty child elements to the first element named `parent`
///
/// Children take the parent's namespace prefix. Each child is a list of
/// `(attribute, value)` pairs for a tag named `child`. An empty parent tag
/// is expanded so it can hold them.
pub fn append_children(
    xml: &str,
    parent: &str,
    child: &str,
    children: &[Vec<(String, String)>],
) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut depth = 0usize;
    let mut open_at: Option<usize> = None;
    let mut done = children.is_empty();

    loop {
        let event = reader
            .read_event()
            .map_err(|e| Error::MalformedModel(e.to_string()))?;
        match event {
            Event::Start(ref e) => {
                if !done && open_at.is_none() && local_name(e)? == parent {
                    open_at = Some(depth);
                }
                depth += 1;
                write(&mut writer, event.borrow())?;
            }
            Event::Empty(ref e) => {
                if done || open_at.is_some() || local_name(e)? != parent {
                    write(&mut writer, event.borrow())?;
                    continue;
                }
                let end = e.to_end().into_owned();
                write(&mut writer, Event::Start(e.clone()))?;
                write_children(&mut writer, e, child, children)?;
                write(&mut writer, Event::End(end))?;
                done = true;
            }
            Event::End(ref e) => {
                depth = depth.saturating_sub(1);
                if open_at == Some(depth) {
                    let qualified = std::str::from_utf8(e.name().as_ref())
                        .map_err(|err| Error::MalformedModel(err.to_string()))?
                        .to_string();
                    write_children(&mut writer, &BytesStart::new(qualified), child, children)?;
                    open_at = None;
                    done = true;
                }
                write(&mut writer, event.borrow())?;
            }
            Event::Eof => break,
            other => write(&mut writer, other)?,
        }
    }

    String::from_utf8(writer.into_inner()).map_err(|e| Error::xml_write(e.to_string()))
}

fn write_children(
    writer: &mut Writer<Vec<u8>>,
    parent: &BytesStart<'_>,
    child: &str,
    children: &[Vec<(String, String)>],
) -> Result<()> {
    let parent_name = std::str::from_utf8(parent.name().as_ref())
        .map_err(|err| Error::MalformedModel(err.to_string()))?
        .to_string();
    let name = match parent_name.split_once(':') {
        Some((prefix, _)) => format!("{}:{}", prefix, child),
        None => child.to_string(),
    };
    for attrs in children {
        let mut tag = BytesStart::new(name.clone());
        for (key, value) in attrs {
            tag.push_attribute((key.as_str(), value.as_str()));
        }
        write(writer, Event::Empty(tag))?;
    }
    Ok(())
}

fn local_name(e: &BytesStart<'_>) -> Result<String> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| Error::MalformedModel(err.to_string()))?
        .to_string();
    Ok(get_local_name(&name).to_string())
}

fn rebuild(e: &BytesStart<'_>, attrs: &[(String, String)]) -> Result<BytesStart<'static>> {
    let qualified = std::str::from_utf8(e.name().as_ref())
        .map_err(|err| Error::MalformedModel(err.to_string()))?
        .to_string();
    let mut tag = BytesStart::new(qualified);
    for (key, value) in attrs {
        tag.push_attribute((key.as_str(), value.as_str()));
    }
    Ok(tag)
}

fn skip_subtree(reader: &mut Reader<&[u8]>) -> Result<()> {
    let mut depth = 1usize;
    while depth > 0 {
        match reader
            .read_event()
            .map_err(|e| Error::MalformedModel(e.to_string()))?
        {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Eof => {
                return Err(Error::MalformedModel(
                    "unexpected end of document inside element".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::xml_write(format!("Failed to write XML event: {}", e)))
}
