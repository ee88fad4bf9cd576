//! Ordered mapping model shared by request rendering and response normalization.
//!
//! Requests are described as a [`Mapping`] and rendered with [`to_xml`]. Responses are
//! normalized into the same shape by [`crate::parser`].

use indexmap::IndexMap;
use quick_xml::escape::escape;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

/// Ordered string-keyed mapping.
pub type Mapping = IndexMap<String, Value>;

/// A node of a normalized SOAP document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Text(String),
    List(Vec<Value>),
    Map(Mapping),
}

impl Value {
    /// Look up a key when this value is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Mapping> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Interpret `"true"` / `"false"` text as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self.as_str()?.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<Mapping> for Value {
    fn from(map: Mapping) -> Self {
        Value::Map(map)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(text) => serializer.serialize_str(text),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(map) => {
                let mut out = serializer.serialize_map(Some(map.len()))?;
                for (key, value) in map {
                    out.serialize_entry(key, value)?;
                }
                out.end()
            }
        }
    }
}

/// Render a mapping as an XML fragment, preserving key order.
///
/// Keys starting with `@` are attributes of the enclosing element and are skipped at
/// this level.
pub fn to_xml(map: &Mapping) -> String {
    let mut out = String::new();
    write_mapping(&mut out, map);
    out
}

fn write_mapping(out: &mut String, map: &Mapping) {
    for (key, value) in map {
        if key.starts_with('@') {
            continue;
        }
        write_element(out, key, value);
    }
}

fn write_element(out: &mut String, name: &str, value: &Value) {
    match value {
        Value::Null => {
            out.push('<');
            out.push_str(name);
            out.push_str(" xsi:nil=\"true\"/>");
        }
        Value::Text(text) => {
            out.push('<');
            out.push_str(name);
            out.push('>');
            out.push_str(&escape(text.as_str()));
            close_tag(out, name);
        }
        Value::List(items) => {
            for item in items {
                write_element(out, name, item);
            }
        }
        Value::Map(map) => {
            out.push('<');
            out.push_str(name);
            for (key, value) in map {
                if let Some(attr) = key.strip_prefix('@') {
                    let attr_value = match value {
                        Value::Text(text) => text.as_str(),
                        _ => "",
                    };
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    out.push_str(&escape(attr_value));
                    out.push('"');
                }
            }
            out.push('>');
            write_mapping(out, map);
            close_tag(out, name);
        }
    }
}

fn close_tag(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Convert an element name to a snake_case mapping key.
///
/// `authenticateResponse` becomes `authenticate_response`, `MM7Version` becomes
/// `mm7_version`, `XMLHttp` becomes `xml_http`.
pub fn snakecase(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if prev.is_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_uppercase() && next_is_lower)
            {
                out.push('_');
            }
        }
        match c {
            '.' | '-' => out.push('_'),
            _ => out.extend(c.to_lowercase()),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: Vec<(&str, Value)>) -> Mapping {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_snakecase() {
        assert_eq!(snakecase("authenticateResponse"), "authenticate_response");
        assert_eq!(snakecase("multiRef"), "multi_ref");
        assert_eq!(snakecase("MM7Version"), "mm7_version");
        assert_eq!(snakecase("XMLHttp"), "xml_http");
        assert_eq!(snakecase("Fault"), "fault");
        assert_eq!(snakecase("faultcode"), "faultcode");
        assert_eq!(snakecase("session-number.v2"), "session_number_v2");
    }

    #[test]
    fn test_to_xml_preserves_order() {
        let body = map(vec![
            ("zebra", "1".into()),
            ("apple", "2".into()),
            ("mango", "3".into()),
        ]);
        assert_eq!(
            to_xml(&body),
            "<zebra>1</zebra><apple>2</apple><mango>3</mango>"
        );
    }

    #[test]
    fn test_to_xml_nested_list_and_nil() {
        let body = map(vec![
            (
                "user",
                Value::Map(map(vec![
                    ("@id", "42".into()),
                    ("name", "Jane & John".into()),
                    ("tag", Value::List(vec!["a".into(), "b".into()])),
                ])),
            ),
            ("note", Value::Null),
        ]);
        assert_eq!(
            to_xml(&body),
            "<user id=\"42\"><name>Jane &amp; John</name><tag>a</tag><tag>b</tag></user>\
             <note xsi:nil=\"true\"/>"
        );
    }

    #[test]
    fn test_to_xml_empty() {
        assert_eq!(to_xml(&Mapping::new()), "");
    }

    #[test]
    fn test_accessors() {
        let value = Value::Map(map(vec![("ok", "true".into()), ("n", Value::Null)]));
        assert_eq!(value.get("ok").and_then(Value::as_bool), Some(true));
        assert!(value.get("n").unwrap().is_null());
        assert!(value.get("missing").is_none());
        assert!(Value::from("x").get("x").is_none());
    }

    #[test]
    fn test_serialize_json() {
        let value = Value::Map(map(vec![
            ("a", "1".into()),
            ("b", Value::List(vec![Value::Null, "2".into()])),
        ]));
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"a":"1","b":[null,"2"]}"#);
    }
}
