//! SOAP XML parsing utilities.
//!
//! Builds a small element tree with quick-xml, answers structural path queries on it,
//! and normalizes the SOAP `Body`/`Header` into [`Mapping`] form.
//!
//! Uses quick-xml which is safe against XXE by default (doesn't expand entities).

use crate::error::InvalidResponseError;
use crate::value::{snakecase, Mapping, Value};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::{HashMap, HashSet};

/// Maximum element nesting accepted in a response document, and maximum nesting of
/// normalized values once multiRef references are followed.
pub const MAX_DEPTH: usize = 256;

/// Maximum number of values produced while normalizing one document section.
///
/// Shared multiRef targets are copied into every referencing element, so a small
/// document can otherwise expand exponentially.
pub const MAX_EXPANDED_VALUES: usize = 100_000;

/// A parsed XML element.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    /// Qualified element name (`ns2:authenticateResponse`)
    pub name: String,
    /// Attributes in document order, qualified names as keys
    pub attributes: Vec<(String, String)>,
    /// Child elements
    pub children: Vec<Node>,
    /// Direct text content (text and CDATA, whitespace trimmed)
    pub text: String,
}

impl Node {
    /// Element name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    /// Namespace prefix, if the name is qualified.
    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    /// Attribute value by qualified name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First child whose local name matches.
    pub fn child(&self, local_name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    /// Concatenated text of this element and all descendants.
    pub fn inner_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        out.push_str(&self.text);
        for child in &self.children {
            child.collect_text(out);
        }
    }
}

/// A parsed XML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    root: Node,
}

impl Document {
    /// Parse an XML string into a tree.
    ///
    /// Fails on malformed XML, on documents without a root element and on nesting
    /// deeper than [`MAX_DEPTH`].
    pub fn parse(xml: &str) -> Result<Self, InvalidResponseError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Node> = Vec::new();
        let mut root: Option<Node> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    if root.is_some() {
                        return Err(InvalidResponseError::new("content after root element"));
                    }
                    if stack.len() >= MAX_DEPTH {
                        return Err(InvalidResponseError::new(format!(
                            "element nesting exceeds {}",
                            MAX_DEPTH
                        )));
                    }
                    stack.push(start_node(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let node = start_node(e)?;
                    attach(&mut stack, &mut root, node)?;
                }
                Ok(Event::End(_)) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| InvalidResponseError::new("unexpected closing tag"))?;
                    attach(&mut stack, &mut root, node)?;
                }
                Ok(Event::Text(ref e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| InvalidResponseError::new(format!("XML parse error: {}", e)))?;
                    match stack.last_mut() {
                        Some(node) => node.text.push_str(&text),
                        None if text.trim().is_empty() => {}
                        None => {
                            return Err(InvalidResponseError::new("text outside of root element"))
                        }
                    }
                }
                Ok(Event::CData(e)) => {
                    if let Some(node) = stack.last_mut() {
                        node.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(InvalidResponseError::new(format!("XML parse error: {}", e)));
                }
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(InvalidResponseError::new("unexpected end of document"));
        }

        root.map(|root| Document { root })
            .ok_or_else(|| InvalidResponseError::new("document has no root element"))
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Structural path query.
    ///
    /// Supports `/` child steps, `//` descendant steps, `*`, prefixed names (matched on
    /// the qualified name), unprefixed names (matched on the local name) and 1-based
    /// `[n]` positional predicates: `//ns2:authenticateResponse/return/success`,
    /// `/Envelope/Body/*[1]`.
    pub fn query(&self, expression: &str) -> Vec<&Node> {
        let steps = parse_steps(expression);
        if steps.is_empty() {
            return Vec::new();
        }

        let mut contexts: Vec<&[Node]> = vec![std::slice::from_ref(&self.root)];
        let mut matched: Vec<&Node> = Vec::new();

        for step in &steps {
            matched.clear();
            let mut seen: HashSet<*const Node> = HashSet::new();

            for nodes in &contexts {
                let mut candidates: Vec<&Node> = Vec::new();
                if step.descendant {
                    collect_descendants(nodes, &mut candidates);
                } else {
                    candidates.extend(nodes.iter());
                }

                let hits = candidates.into_iter().filter(|n| step.matches(n));
                let hits: Vec<&Node> = match step.position {
                    Some(position) => hits.skip(position.saturating_sub(1)).take(1).collect(),
                    None => hits.collect(),
                };

                for node in hits {
                    if seen.insert(node as *const Node) {
                        matched.push(node);
                    }
                }
            }

            contexts = matched.iter().copied().map(|n| n.children.as_slice()).collect();
        }

        matched
    }

    /// The SOAP envelope root, if the document is one.
    fn envelope(&self) -> Result<&Node, InvalidResponseError> {
        if self.root.local_name() == "Envelope" {
            Ok(&self.root)
        } else {
            Err(InvalidResponseError::new(format!(
                "expected Envelope root element, found {}",
                self.root.name
            )))
        }
    }

    /// Normalized SOAP Body. A missing Body yields an empty mapping.
    pub fn body(&self) -> Result<Mapping, InvalidResponseError> {
        let envelope = self.envelope()?;
        match envelope.child("Body") {
            Some(section) => normalize_section(section),
            None => Ok(Mapping::new()),
        }
    }

    /// Normalized SOAP Header. A missing Header yields an empty mapping.
    pub fn header(&self) -> Result<Mapping, InvalidResponseError> {
        let envelope = self.envelope()?;
        match envelope.child("Header") {
            Some(section) => normalize_section(section),
            None => Ok(Mapping::new()),
        }
    }

    /// The whole document as a value, keyed by the snake_cased root name.
    pub fn to_value(&self) -> Result<Value, InvalidResponseError> {
        let value = Normalizer::new(&self.root).normalize(&self.root, 0)?;
        let mut map = Mapping::new();
        map.insert(snakecase(self.root.local_name()), value);
        Ok(Value::Map(map))
    }
}

fn start_node(e: &BytesStart) -> Result<Node, InvalidResponseError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr =
            attr.map_err(|e| InvalidResponseError::new(format!("invalid attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| InvalidResponseError::new(format!("invalid attribute value: {}", e)))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Node {
        name,
        attributes,
        ..Default::default()
    })
}

fn attach(
    stack: &mut [Node],
    root: &mut Option<Node>,
    node: Node,
) -> Result<(), InvalidResponseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None if root.is_none() => *root = Some(node),
        None => return Err(InvalidResponseError::new("multiple root elements")),
    }
    Ok(())
}

fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, local)| local).unwrap_or(name)
}

fn collect_descendants<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
    for node in nodes {
        out.push(node);
        collect_descendants(&node.children, out);
    }
}

struct Step {
    descendant: bool,
    name: String,
    position: Option<usize>,
}

impl Step {
    fn matches(&self, node: &Node) -> bool {
        if self.name == "*" {
            true
        } else if self.name.contains(':') {
            node.name == self.name
        } else {
            node.local_name() == self.name
        }
    }
}

fn parse_steps(expression: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut rest = expression.trim();
    let mut descendant = false;

    while !rest.is_empty() {
        if let Some(r) = rest.strip_prefix("//") {
            descendant = true;
            rest = r;
            continue;
        }
        if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            continue;
        }

        let end = rest.find('/').unwrap_or(rest.len());
        let (token, tail) = rest.split_at(end);
        rest = tail;

        let (name, position) = match token.split_once('[') {
            Some((name, predicate)) => (
                name,
                predicate.trim_end_matches(']').trim().parse::<usize>().ok(),
            ),
            None => (token, None),
        };

        steps.push(Step {
            descendant,
            name: name.trim().to_string(),
            position,
        });
        descendant = false;
    }

    steps
}

/// Elements referenced through `href="#id"`, keyed by id.
struct References<'a> {
    targets: HashMap<&'a str, &'a Node>,
}

impl<'a> References<'a> {
    fn collect(scope: &'a Node) -> Self {
        let mut all = Vec::new();
        collect_descendants(std::slice::from_ref(scope), &mut all);

        let wanted: HashSet<&str> = all
            .iter()
            .copied()
            .filter_map(|n| n.attribute("href"))
            .filter_map(|href| href.strip_prefix('#'))
            .collect();

        let targets = all
            .iter()
            .copied()
            .filter_map(|n| n.attribute("id").map(|id| (id, n)))
            .filter(|(id, _)| wanted.contains(id))
            .collect();

        Self { targets }
    }

    fn resolve(&self, node: &Node) -> Option<(&'a str, &'a Node)> {
        let id = node.attribute("href")?.strip_prefix('#')?;
        self.targets.get_key_value(id).map(|(k, v)| (*k, *v))
    }

    fn is_target(&self, node: &Node) -> bool {
        node.attribute("id")
            .is_some_and(|id| self.targets.contains_key(id))
    }
}

fn normalize_section(section: &Node) -> Result<Mapping, InvalidResponseError> {
    match Normalizer::new(section).normalize(section, 0)? {
        Value::Map(map) => Ok(map),
        _ => Ok(Mapping::new()),
    }
}

/// Converts an element tree into a [`Value`], following multiRef references.
///
/// Each referenced element is normalized once and copied into every element that
/// points at it. Copies count against [`MAX_EXPANDED_VALUES`].
struct Normalizer<'a> {
    refs: References<'a>,
    /// Normalized targets with the number of values they hold.
    resolved: HashMap<&'a str, (Value, usize)>,
    resolving: HashSet<&'a str>,
    cycles_cut: usize,
    produced: usize,
}

impl<'a> Normalizer<'a> {
    fn new(scope: &'a Node) -> Self {
        Self {
            refs: References::collect(scope),
            resolved: HashMap::new(),
            resolving: HashSet::new(),
            cycles_cut: 0,
            produced: 0,
        }
    }

    fn normalize(&mut self, node: &'a Node, depth: usize) -> Result<Value, InvalidResponseError> {
        if depth > MAX_DEPTH {
            return Err(InvalidResponseError::new(format!(
                "multiRef nesting exceeds {}",
                MAX_DEPTH
            )));
        }

        if is_nil(node) {
            self.charge(1)?;
            return Ok(Value::Null);
        }

        if let Some((id, target)) = self.refs.resolve(node) {
            return self.resolve(id, target, depth);
        }

        self.charge(1)?;
        if node.children.is_empty() && !node.text.is_empty() {
            return Ok(Value::Text(node.text.clone()));
        }

        let mut map = Mapping::new();
        for (key, value) in &node.attributes {
            if keep_attribute(node, key, &self.refs) {
                self.charge(1)?;
                insert_or_push(&mut map, snakecase(key), Value::Text(value.clone()));
            }
        }
        for child in &node.children {
            let value = self.normalize(child, depth + 1)?;
            insert_or_push(&mut map, snakecase(child.local_name()), value);
        }

        if map.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(Value::Map(map))
        }
    }

    fn resolve(
        &mut self,
        id: &'a str,
        target: &'a Node,
        depth: usize,
    ) -> Result<Value, InvalidResponseError> {
        if let Some((value, size)) = self.resolved.get(id) {
            self.produced += *size;
            if self.produced > MAX_EXPANDED_VALUES {
                return Err(expansion_error());
            }
            return Ok(value.clone());
        }

        if !self.resolving.insert(id) {
            self.cycles_cut += 1;
            self.charge(1)?;
            return Ok(Value::Null);
        }

        let (produced, cycles_cut) = (self.produced, self.cycles_cut);
        let value = self.normalize(target, depth + 1);
        self.resolving.remove(id);
        let value = value?;

        // Values cut short by a reference cycle depend on where resolution started.
        if self.cycles_cut == cycles_cut {
            self.resolved
                .insert(id, (value.clone(), self.produced - produced));
        }
        Ok(value)
    }

    fn charge(&mut self, values: usize) -> Result<(), InvalidResponseError> {
        self.produced += values;
        if self.produced > MAX_EXPANDED_VALUES {
            return Err(expansion_error());
        }
        Ok(())
    }
}

fn expansion_error() -> InvalidResponseError {
    InvalidResponseError::new(format!(
        "multiRef expansion exceeds {} values",
        MAX_EXPANDED_VALUES
    ))
}

fn is_nil(node: &Node) -> bool {
    node.attributes
        .iter()
        .any(|(key, value)| local_part(key) == "nil" && value == "true")
}

fn keep_attribute(node: &Node, key: &str, refs: &References<'_>) -> bool {
    if key == "xmlns" || key.contains(':') {
        return false;
    }
    match key {
        "id" => !refs.is_target(node),
        "href" => refs.resolve(node).is_none(),
        _ => true,
    }
}

/// Repeated sibling keys collect into an ordered list.
fn insert_or_push(map: &mut Mapping, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::List(items)) => items.push(value),
        Some(existing) => {
            let first = std::mem::take(existing);
            *existing = Value::List(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}
