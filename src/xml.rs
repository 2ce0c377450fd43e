//! Shared quick-xml helpers
//!
//! 3MF and vendor metadata files mix namespace prefixes freely (`p:path`,
//! `slic3rpe:...`), so element and attribute lookups go by local name.

use crate::error::{Error, Result};
use quick_xml::events::BytesStart;

/// Default buffer capacity for XML parsing (4KB)
pub(crate) const XML_BUFFER_CAPACITY: usize = 4096;

/// Extract local name from a potentially prefixed XML name
///
/// - `"p:path"` returns `"path"`
/// - `"object"` returns `"object"`
pub(crate) fn get_local_name(name_str: &str) -> &str {
    match name_str.rfind(':') {
        Some(pos) => &name_str[pos + 1..],
        None => name_str,
    }
}

/// Local name of an element as UTF-8
pub(crate) fn element_name<'a>(e: &'a BytesStart<'_>) -> Result<&'a str> {
    std::str::from_utf8(e.local_name().into_inner())
        .map_err(|err| Error::MalformedModel(err.to_string()))
}

/// Attributes of an element as `(qualified name, unescaped value)` pairs
pub(crate) fn parse_attributes(e: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs = Vec::with_capacity(8);
    for attr in e.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| Error::MalformedModel(err.to_string()))?;
        let raw = std::str::from_utf8(&attr.value)
            .map_err(|err| Error::MalformedModel(err.to_string()))?;
        let value = quick_xml::escape::unescape(raw)
            .map_err(|err| Error::XmlAttr(err.to_string()))?;
        attrs.push((key.to_string(), value.into_owned()));
    }
    Ok(attrs)
}

/// Find an attribute by local name, regardless of prefix
pub(crate) fn attr<'a>(attrs: &'a [(String, String)], local_name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(key, _)| !key.starts_with("xmlns") && get_local_name(key) == local_name)
        .map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_local_name() {
        assert_eq!(get_local_name("p:path"), "path");
        assert_eq!(get_local_name("object"), "object");
    }

    #[test]
    fn test_attr_by_local_name() {
        let e = BytesStart::from_content(
            r#"component objectid="3" p:path="/3D/Objects/a.model" xmlns:p="urn:x""#,
            9,
        );
        let attrs = parse_attributes(&e).unwrap();
        assert_eq!(attr(&attrs, "objectid"), Some("3"));
        assert_eq!(attr(&attrs, "path"), Some("/3D/Objects/a.model"));
        assert_eq!(attr(&attrs, "p"), None);
    }

    #[test]
    fn test_attribute_unescape() {
        let e = BytesStart::from_content(r#"metadata key="name" value="A &amp; B""#, 8);
        let attrs = parse_attributes(&e).unwrap();
        assert_eq!(attr(&attrs, "value"), Some("A & B"));
    }
}
