use super::{non_empty, parse_count, NormalizedPage, SourceFormat};
use ingestor_core::{Error, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

/// Deepest element nesting accepted; tree building and conversion recurse per level.
const MAX_DEPTH: usize = 256;

/// An XML list document such as
/// `<documents total="1200" pages="3"><item>...</item></documents>`.
///
/// The whole body is read into an element tree before items are extracted.
#[derive(Debug, Clone, Copy)]
pub struct XmlFormat {
    pub item: &'static str,
    pub total_items: &'static str,
    pub total_pages: Option<&'static str>,
    pub next_page: Option<&'static str>,
}

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    /// Root attribute first, then a direct child element of the same name.
    fn lookup(&self, name: &str) -> Option<String> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .or_else(|| {
                self.children
                    .iter()
                    .find(|child| child.name == name && child.children.is_empty())
                    .map(|child| child.text.clone())
            })
    }

    fn into_value(self) -> Value {
        if self.children.is_empty() && self.attributes.is_empty() {
            return non_empty(&self.text).map_or(Value::Null, Value::String);
        }

        let mut object = Map::new();
        for (key, value) in self.attributes {
            object.insert(format!("@{key}"), Value::String(value));
        }
        if let Some(text) = non_empty(&self.text) {
            object.insert("#text".to_string(), Value::String(text));
        }
        for child in self.children {
            let name = child.name.clone();
            let value = child.into_value();
            match object.get_mut(&name) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    object.insert(name, value);
                }
            }
        }
        Value::Object(object)
    }
}

fn parse_error(details: impl std::fmt::Display) -> Error {
    Error::Parse {
        format: "xml",
        details: details.to_string(),
    }
}

fn open_element(start: &BytesStart<'_>) -> Result<Element> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(parse_error)?;
        let key = String::from_utf8_lossy(attribute.key.local_name().as_ref()).into_owned();
        let value = attribute.unescape_value().map_err(parse_error)?.into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Element::default()
    })
}

fn parse_tree(body: &[u8]) -> Result<Element> {
    let text = std::str::from_utf8(body).map_err(parse_error)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event().map_err(parse_error)? {
            Event::Start(start) => {
                if stack.len() >= MAX_DEPTH {
                    return Err(parse_error(format!("elements nested deeper than {MAX_DEPTH}")));
                }
                stack.push(open_element(&start)?);
            }
            Event::Empty(start) => {
                let element = open_element(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text.unescape().map_err(parse_error)?);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| parse_error("unbalanced closing tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(parse_error("document ended inside an open element"));
    }
    root.ok_or_else(|| parse_error("document has no root element"))
}

impl SourceFormat for XmlFormat {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn parse(&self, body: &[u8]) -> Result<NormalizedPage> {
        let mut root = parse_tree(body)?;

        let total_items = root
            .lookup(self.total_items)
            .and_then(|v| parse_count(&Value::String(v)));
        let total_pages = self
            .total_pages
            .and_then(|name| root.lookup(name))
            .and_then(|v| parse_count(&Value::String(v)));
        let next_cursor = self
            .next_page
            .and_then(|name| root.lookup(name))
            .and_then(|v| non_empty(&v));

        let mut items = Vec::new();
        take_items(&mut root, self.item, &mut items);

        Ok(NormalizedPage {
            items,
            total_items,
            total_pages,
            next_cursor,
        })
    }
}

/// Detaches every element named `name`, in document order, without
/// descending into the matches themselves.
fn take_items(element: &mut Element, name: &str, out: &mut Vec<Value>) {
    for mut child in std::mem::take(&mut element.children) {
        if child.name == name {
            out.push(child.into_value());
        } else {
            take_items(&mut child, name, out);
        }
    }
}
