//! Minimal owned XML tree used for WordprocessingML parts.
//!
//! Names are kept with their prefixes (`w:p`, `r:embed`) exactly as they
//! appear in the part; namespace declarations are ordinary attributes.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// An XML element with attributes in document order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    pub fn remove_attr(&mut self, key: &str) {
        self.attributes.retain(|(k, _)| k != key);
    }

    /// Child elements, skipping text nodes.
    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            XmlNode::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    /// Visit this element and every descendant element, depth first.
    pub fn walk(&self, visit: &mut dyn FnMut(&XmlElement)) {
        visit(self);
        for child in self.elements() {
            child.walk(visit);
        }
    }

    /// Mutable variant of [`XmlElement::walk`].
    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut XmlElement)) {
        visit(self);
        for node in &mut self.children {
            if let XmlNode::Element(e) = node {
                e.walk_mut(visit);
            }
        }
    }

    /// Concatenated text of every `w:t` descendant.
    pub fn run_text(&self) -> String {
        let mut out = String::new();
        self.walk(&mut |e| {
            if e.name == "w:t" {
                for node in &e.children {
                    if let XmlNode::Text(t) = node {
                        out.push_str(t);
                    }
                }
            }
        });
        out
    }

    /// Serialize into `out`.
    pub fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (k, v) in &self.attributes {
            out.push(' ');
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape(v.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                XmlNode::Element(e) => e.write_to(out),
                XmlNode::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }
}

/// Parse a complete XML document and return its root element.
///
/// The XML declaration, comments and processing instructions are dropped.
pub fn parse(xml: &str) -> Result<XmlElement, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(element_from(&e)?),
            Ok(Event::Empty(e)) => {
                let el = element_from(&e)?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::End(_)) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| "closing tag without opening tag".to_string())?;
                attach(&mut stack, &mut root, el)?;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                if let Some(parent) = stack.last_mut() {
                    if !text.is_empty() {
                        parent.children.push(XmlNode::Text(text.into_owned()));
                    }
                }
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(XmlNode::Text(text));
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                ))
            }
        }
    }

    if !stack.is_empty() {
        return Err(format!("unclosed element <{}>", stack[stack.len() - 1].name));
    }
    root.ok_or_else(|| "document has no root element".to_string())
}

fn element_from(start: &BytesStart<'_>) -> Result<XmlElement, String> {
    let name = String::from_utf8(start.name().as_ref().to_vec()).map_err(|e| e.to_string())?;
    let mut el = XmlElement::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| e.to_string())?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).map_err(|e| e.to_string())?;
        let value = attr.unescape_value().map_err(|e| e.to_string())?;
        el.attributes.push((key, value.into_owned()));
    }
    Ok(el)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    el: XmlElement,
) -> Result<(), String> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(XmlNode::Element(el));
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(el);
            Ok(())
        }
        None => Err("multiple root elements".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_elements_and_text() {
        let xml = r#"<?xml version="1.0"?><w:p a="1"><w:r><w:t xml:space="preserve"> hi &amp; bye</w:t></w:r><w:br/></w:p>"#;
        let root = parse(xml).unwrap();
        assert_eq!(root.name, "w:p");
        assert_eq!(root.attr("a"), Some("1"));
        assert_eq!(root.run_text(), " hi & bye");
        assert_eq!(root.elements().count(), 2);
    }

    #[test]
    fn serialization_escapes_text_and_attributes() {
        let el = XmlElement::new("w:t")
            .with_attr("v", "a\"b")
            .with_text("1 < 2 & 3");
        let xml = el.to_xml();
        assert!(xml.contains("1 &lt; 2 &amp; 3"));
        assert!(!xml.contains("a\"b"));
        assert_eq!(parse(&xml).unwrap(), el);
    }

    #[test]
    fn empty_elements_self_close() {
        assert_eq!(XmlElement::new("w:br").to_xml(), "<w:br/>");
    }

    #[test]
    fn unbalanced_markup_is_an_error() {
        assert!(parse("<a><b></a>").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn walk_mut_rewrites_descendants() {
        let mut root = parse(r#"<x><y id="1"/><z><y id="2"/></z></x>"#).unwrap();
        root.walk_mut(&mut |e| {
            if e.name == "y" {
                e.set_attr("id", "9");
            }
        });
        let mut ids = Vec::new();
        root.walk(&mut |e| {
            if let Some(id) = e.attr("id") {
                ids.push(id.to_string());
            }
        });
        assert_eq!(ids, vec!["9", "9"]);
    }
}
