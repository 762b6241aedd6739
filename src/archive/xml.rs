// ABOUTME: Lossless XML element tree for editing archive documents
// ABOUTME: Keeps comments, CDATA, processing instructions and unknown elements on round-trip

use anyhow::{Context, Result};
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq)]
pub enum XmlNode {
    Element(XmlElement),
    /// Escaped character data, exactly as read.
    Text(String),
    CData(String),
    Comment(String),
    ProcessingInstruction(String),
    DocType(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct XmlElement {
    pub name: String,
    /// Attribute values are kept escaped.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub self_closing: bool,
}

impl XmlElement {
    /// An empty element; it serializes as `<name/>` until it gets content.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            self_closing: true,
            ..Default::default()
        }
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| unescape(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.clone()))
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        let escaped = escape(value).into_owned();
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = escaped,
            None => self.attributes.push((name.to_string(), escaped)),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|n| match n {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.elements().find(|e| e.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut XmlElement> {
        self.children.iter_mut().find_map(|n| match n {
            XmlNode::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.elements().filter(move |e| e.name == name)
    }

    pub fn children_named_mut<'a>(
        &'a mut self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a mut XmlElement> {
        self.children.iter_mut().filter_map(move |n| match n {
            XmlNode::Element(e) if e.name == name => Some(e),
            _ => None,
        })
    }

    pub fn push(&mut self, element: XmlElement) {
        self.self_closing = false;
        self.children.push(XmlNode::Element(element));
    }

    /// Unescaped text and CDATA content directly under this element.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            match node {
                XmlNode::Text(t) => match unescape(t) {
                    Ok(s) => out.push_str(&s),
                    Err(_) => out.push_str(t),
                },
                XmlNode::CData(c) => out.push_str(c),
                _ => {}
            }
        }
        out
    }

    /// Replaces all character content, keeping child elements. CDATA
    /// children are rewritten as CDATA.
    pub fn set_text(&mut self, text: &str) {
        let as_cdata = self.children.iter().any(|n| matches!(n, XmlNode::CData(_)));
        self.children
            .retain(|n| !matches!(n, XmlNode::Text(_) | XmlNode::CData(_)));
        let node = if as_cdata {
            XmlNode::CData(text.to_string())
        } else {
            XmlNode::Text(escape(text).into_owned())
        };
        self.children.insert(0, node);
        self.self_closing = false;
    }

    fn write(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {}=\"{}\"", key, value.replace('"', "&quot;"));
        }
        if self.self_closing && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for child in &self.children {
            child.write(out);
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

impl XmlNode {
    fn write(&self, out: &mut String) {
        match self {
            XmlNode::Element(e) => e.write(out),
            XmlNode::Text(t) => out.push_str(t),
            XmlNode::CData(c) => {
                let _ = write!(out, "<![CDATA[{}]]>", c);
            }
            XmlNode::Comment(c) => {
                let _ = write!(out, "<!--{}-->", c);
            }
            XmlNode::ProcessingInstruction(p) => {
                let _ = write!(out, "<?{}?>", p);
            }
            XmlNode::DocType(d) => {
                let _ = write!(out, "<!DOCTYPE {}>", d);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct XmlDocument {
    pub declaration: Option<String>,
    pub prolog: Vec<XmlNode>,
    pub root: XmlElement,
    pub epilog: Vec<XmlNode>,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self {
            declaration: Some(r#"xml version="1.0" encoding="UTF-8""#.to_string()),
            prolog: vec![XmlNode::Text("\n".to_string())],
            root,
            epilog: vec![XmlNode::Text("\n".to_string())],
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut reader = Reader::from_str(text);
        reader.config_mut().trim_text(false);

        let mut declaration = None;
        let mut prolog = Vec::new();
        let mut epilog = Vec::new();
        let mut root: Option<XmlElement> = None;
        let mut stack: Vec<XmlElement> = Vec::new();

        loop {
            let event = reader.read_event().context("Malformed XML")?;
            let node = match event {
                Event::Eof => break,
                Event::Decl(d) => {
                    declaration = Some(String::from_utf8_lossy(&d).into_owned());
                    continue;
                }
                Event::Start(start) => {
                    stack.push(element_from(&start)?);
                    continue;
                }
                Event::Empty(start) => {
                    let mut element = element_from(&start)?;
                    element.self_closing = true;
                    XmlNode::Element(element)
                }
                Event::End(_) => {
                    let element = stack.pop().context("Unbalanced XML end tag")?;
                    XmlNode::Element(element)
                }
                Event::Text(t) => XmlNode::Text(String::from_utf8_lossy(&t).into_owned()),
                Event::CData(c) => XmlNode::CData(String::from_utf8_lossy(&c).into_owned()),
                Event::Comment(c) => XmlNode::Comment(String::from_utf8_lossy(&c).into_owned()),
                Event::PI(p) => {
                    XmlNode::ProcessingInstruction(String::from_utf8_lossy(&p).into_owned())
                }
                Event::DocType(d) => XmlNode::DocType(String::from_utf8_lossy(&d).into_owned()),
            };

            if let Some(parent) = stack.last_mut() {
                parent.children.push(node);
            } else {
                match node {
                    XmlNode::Element(e) if root.is_none() => root = Some(e),
                    XmlNode::Element(_) => anyhow::bail!("XML document has more than one root"),
                    other if root.is_none() => prolog.push(other),
                    other => epilog.push(other),
                }
            }
        }

        if !stack.is_empty() {
            anyhow::bail!("XML document ended inside <{}>", stack[stack.len() - 1].name);
        }
        let root = root.context("XML document has no root element")?;
        Ok(Self {
            declaration,
            prolog,
            root,
            epilog,
        })
    }

    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        if let Some(decl) = &self.declaration {
            let _ = write!(out, "<?{}?>", decl);
        }
        for node in &self.prolog {
            node.write(&mut out);
        }
        self.root.write(&mut out);
        for node in &self.epilog {
            node.write(&mut out);
        }
        out
    }
}

fn element_from(start: &quick_xml::events::BytesStart<'_>) -> Result<XmlElement> {
    let mut element = XmlElement::new(String::from_utf8_lossy(start.name().as_ref()));
    element.self_closing = false;
    for attr in start.attributes() {
        let attr = attr.context("Malformed XML attribute")?;
        element.attributes.push((
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            String::from_utf8_lossy(&attr.value).into_owned(),
        ));
    }
    Ok(element)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFERENCES: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- exported -->
<preferences xmlns="http://www.demandware.com/xml/impex/preferences/2007-03-31">
    <custom-preferences>
        <development>
            <preference preference-id="enableFoo">true</preference>
            <preference preference-id="banner"><![CDATA[<b>Sale</b>]]></preference>
            <unknown-thing a="1 &amp; 2"/>
        </development>
    </custom-preferences>
</preferences>
"#;

    #[test]
    fn test_round_trip_is_lossless() {
        let doc = XmlDocument::parse(PREFERENCES).unwrap();
        assert_eq!(doc.to_xml_string(), PREFERENCES);
    }

    #[test]
    fn test_navigate_and_edit() {
        let mut doc = XmlDocument::parse(PREFERENCES).unwrap();
        let dev = doc
            .root
            .child_mut("custom-preferences")
            .and_then(|c| c.child_mut("development"))
            .unwrap();

        let banner = dev
            .children_named("preference")
            .find(|p| p.attribute("preference-id").as_deref() == Some("banner"))
            .unwrap();
        assert_eq!(banner.text(), "<b>Sale</b>");
        assert_eq!(dev.child("unknown-thing").unwrap().attribute("a").unwrap(), "1 & 2");

        for pref in dev.children_named_mut("preference") {
            if pref.attribute("preference-id").as_deref() == Some("enableFoo") {
                pref.set_text("false & off");
            }
        }
        let out = doc.to_xml_string();
        assert!(out.contains(r#"<preference preference-id="enableFoo">false &amp; off</preference>"#));
        assert!(out.contains("<!-- exported -->"));
        assert!(out.contains(r#"<unknown-thing a="1 &amp; 2"/>"#));
    }

    #[test]
    fn test_rejects_unbalanced_document() {
        assert!(XmlDocument::parse("<a><b></a>").is_err());
        assert!(XmlDocument::parse("no root here").is_err());
    }

    #[test]
    fn test_build_new_document() {
        let mut root = XmlElement::new("metadata");
        root.push(XmlElement::new("type-extension").with_attribute("type-id", "SitePreferences"));
        let doc = XmlDocument::new(root);
        assert_eq!(
            doc.to_xml_string(),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<metadata><type-extension type-id=\"SitePreferences\"/></metadata>\n"
        );
    }
}
