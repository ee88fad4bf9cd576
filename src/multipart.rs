//! MIME multipart/related composition and demultiplexing.
//!
//! Outbound, the rendered envelope becomes the first part of a `multipart/related`
//! message followed by the caller's attachments. Inbound, multipart response bodies
//! are split back into parts.

use crate::error::MultipartError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use glob::Pattern;
use http::header::{HeaderMap, HeaderName, HeaderValue, IntoHeaderName, CONTENT_TYPE};
use std::borrow::Cow;
use uuid::Uuid;

/// Content-Type of the composed root part, before the boundary parameter.
pub const MULTIPART_RELATED: &str = r#"multipart/related; type="text/xml""#;
/// Content-Type of the SOAP envelope part.
pub const SOAP_PART_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// MIME part headers absent from [`http::header`].
pub const CONTENT_TRANSFER_ENCODING: HeaderName =
    HeaderName::from_static("content-transfer-encoding");
pub const MIME_VERSION: HeaderName = HeaderName::from_static("mime-version");

const BASE64_LINE: usize = 76;

/// A MIME part: an attachment, the SOAP envelope, or a multipart container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    headers: HeaderMap,
    body: Vec<u8>,
    parts: Vec<Part>,
    boundary: Option<String>,
}

impl Part {
    /// A leaf part with the given content type and raw body.
    pub fn new(content_type: HeaderValue, body: impl Into<Vec<u8>>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type);
        Self {
            headers,
            body: body.into(),
            parts: Vec::new(),
            boundary: None,
        }
    }

    /// A multipart container with a freshly generated boundary.
    pub fn multipart(content_type: &str) -> Result<Self, MultipartError> {
        Self::with_boundary(content_type, generate_boundary())
    }

    /// A multipart container with an explicit boundary.
    ///
    /// Fails when the content type or boundary cannot be carried in a header value.
    pub fn with_boundary(
        content_type: &str,
        boundary: impl Into<String>,
    ) -> Result<Self, MultipartError> {
        let boundary = boundary.into();
        let value = format!("{}; boundary=\"{}\"", content_type, boundary);
        let value = HeaderValue::from_str(&value)
            .map_err(|_| MultipartError::InvalidHeader(value.clone()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, value);
        Ok(Self {
            headers,
            body: Vec::new(),
            parts: Vec::new(),
            boundary: Some(boundary),
        })
    }

    /// Set a header, replacing any previous values of `name`.
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// First value of `name` when it is visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Lower-cased content type without parameters (`image/jpeg`).
    pub fn mime_type(&self) -> String {
        self.content_type()
            .map(essence)
            .unwrap_or_else(|| "text/plain".to_string())
    }

    /// Decoded body bytes. Empty for multipart containers.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn add_part(&mut self, part: Part) {
        self.parts.push(part);
    }

    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn boundary(&self) -> Option<&str> {
        self.boundary.as_deref()
    }

    /// Stable reorder of the child parts by content-type priority.
    ///
    /// Entries are case-insensitive glob patterns matched against each child's
    /// [`mime_type`](Part::mime_type). Children matching an earlier entry come first;
    /// unmatched children keep their relative order after all matched ones.
    pub fn sort_parts(&mut self, order: &[String]) {
        if order.is_empty() {
            return;
        }
        let matchers: Vec<TypeMatcher> = order.iter().map(|o| TypeMatcher::new(o)).collect();
        self.parts.sort_by_key(|part| {
            let mime_type = part.mime_type();
            matchers
                .iter()
                .position(|m| m.matches(&mime_type))
                .unwrap_or(matchers.len())
        });
    }

    /// Body as it goes on the wire: delimited children for multipart containers,
    /// transfer-encoded bytes otherwise.
    pub fn encoded_body(&self) -> Vec<u8> {
        match self.boundary {
            Some(ref boundary) => {
                let mut out = Vec::new();
                for part in &self.parts {
                    out.extend_from_slice(b"--");
                    out.extend_from_slice(boundary.as_bytes());
                    out.extend_from_slice(b"\r\n");
                    out.extend_from_slice(&part.encode());
                    out.extend_from_slice(b"\r\n");
                }
                out.extend_from_slice(b"--");
                out.extend_from_slice(boundary.as_bytes());
                out.extend_from_slice(b"--\r\n");
                out
            }
            None if self.is_base64() => encode_base64(&self.body),
            None => self.body.clone(),
        }
    }

    /// Header lines, a blank line, then the encoded body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.encoded_body());
        out
    }

    /// Split a multipart body into parts.
    ///
    /// The returned container carries `content_type` as its header and one child per
    /// body part. Base64 parts are decoded and nested multipart parts are parsed
    /// recursively.
    pub fn parse(content_type: &str, body: &[u8]) -> Result<Part, MultipartError> {
        let boundary = boundary_param(content_type).ok_or(MultipartError::MissingBoundary)?;
        let value = HeaderValue::from_str(content_type)
            .map_err(|_| MultipartError::InvalidHeader(content_type.to_string()))?;

        let mut container = Part {
            headers: HeaderMap::new(),
            body: Vec::new(),
            parts: Vec::new(),
            boundary: Some(boundary.clone()),
        };
        container.headers.insert(CONTENT_TYPE, value);

        for raw in split_parts(body, &boundary)? {
            container.parts.push(parse_part(raw)?);
        }

        Ok(container)
    }

    fn is_base64(&self) -> bool {
        self.headers
            .get(CONTENT_TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("base64"))
    }
}

/// Build the multipart/related message for an envelope and its attachments.
///
/// The envelope is the first child unless `sort_order` moves it.
pub fn compose(
    envelope_xml: String,
    attachments: &[Part],
    sort_order: Option<&[String]>,
) -> Result<Part, MultipartError> {
    let mut root = Part::multipart(MULTIPART_RELATED)?
        .with_header(MIME_VERSION, HeaderValue::from_static("1.0"));

    let transfer_encoding = if envelope_xml.is_ascii() { "7bit" } else { "8bit" };
    let soap_part = Part::new(HeaderValue::from_static(SOAP_PART_CONTENT_TYPE), envelope_xml)
        .with_header(
            CONTENT_TRANSFER_ENCODING,
            HeaderValue::from_static(transfer_encoding),
        );

    root.add_part(soap_part);
    for part in attachments {
        root.add_part(part.clone());
    }

    if let Some(order) = sort_order {
        root.sort_parts(order);
    }

    Ok(root)
}

/// A boundary unique to one message.
pub fn generate_boundary() -> String {
    format!("--==_mimepart_{}", Uuid::new_v4().simple())
}

/// Whether a Content-Type header denotes a multipart body.
pub fn is_multipart(content_type: &str) -> bool {
    match content_type.parse::<mime::Mime>() {
        Ok(m) => m.type_() == mime::MULTIPART,
        Err(_) => essence(content_type).starts_with("multipart/"),
    }
}

fn essence(content_type: &str) -> String {
    match content_type.parse::<mime::Mime>() {
        Ok(m) => m.essence_str().to_string(),
        Err(_) => content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase(),
    }
}

fn boundary_param(content_type: &str) -> Option<String> {
    if let Ok(m) = content_type.parse::<mime::Mime>() {
        if m.type_() != mime::MULTIPART {
            return None;
        }
        if let Some(boundary) = m.get_param(mime::BOUNDARY) {
            return Some(boundary.as_str().trim_matches('"').to_string());
        }
    }

    // Lenient scan for boundaries mime rejects, such as unquoted `=`.
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("boundary") {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

enum TypeMatcher {
    Glob(Pattern),
    Exact(String),
}

impl TypeMatcher {
    fn new(entry: &str) -> Self {
        let entry = entry.trim().to_ascii_lowercase();
        match Pattern::new(&entry) {
            Ok(pattern) => Self::Glob(pattern),
            Err(_) => Self::Exact(entry),
        }
    }

    fn matches(&self, mime_type: &str) -> bool {
        match self {
            Self::Glob(pattern) => pattern.matches(mime_type),
            Self::Exact(entry) => entry == mime_type,
        }
    }
}

fn encode_base64(body: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(body);
    let mut out = Vec::with_capacity(encoded.len() + encoded.len() / BASE64_LINE * 2);
    for (i, line) in encoded.as_bytes().chunks(BASE64_LINE).enumerate() {
        if i > 0 {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(line);
    }
    out
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Next delimiter line: the delimiter at the start of a line, followed by an
/// optional closing `--`, optional blanks, and a line break or the end of input.
fn find_delimiter(body: &[u8], delimiter: &[u8], from: usize) -> Option<usize> {
    let mut from = from;
    while let Some(i) = find(body, delimiter, from) {
        let at_line_start = i == 0 || body[i - 1] == b'\n';
        if at_line_start && ends_delimiter_line(&body[i + delimiter.len()..]) {
            return Some(i);
        }
        from = i + 1;
    }
    None
}

fn ends_delimiter_line(rest: &[u8]) -> bool {
    let rest = rest.strip_prefix(b"--").unwrap_or(rest);
    let blanks = rest.iter().take_while(|b| matches!(b, b' ' | b'\t')).count();
    let rest = &rest[blanks..];
    rest.is_empty() || rest.starts_with(b"\r\n") || rest.starts_with(b"\n")
}

fn split_parts<'a>(body: &'a [u8], boundary: &str) -> Result<Vec<&'a [u8]>, MultipartError> {
    let delimiter = format!("--{}", boundary);
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut cursor = find_delimiter(body, delimiter, 0)
        .ok_or_else(|| MultipartError::MissingDelimiter(boundary.to_string()))?;

    loop {
        let after = cursor + delimiter.len();
        if body[after..].starts_with(b"--") {
            return Ok(parts);
        }

        let content_start = find(body, b"\n", after)
            .map(|i| i + 1)
            .ok_or_else(|| MultipartError::Truncated(boundary.to_string()))?;
        let next = find_delimiter(body, delimiter, content_start)
            .ok_or_else(|| MultipartError::Truncated(boundary.to_string()))?;

        let mut content_end = next;
        if content_end > content_start && body[content_end - 1] == b'\n' {
            content_end -= 1;
            if content_end > content_start && body[content_end - 1] == b'\r' {
                content_end -= 1;
            }
        }

        parts.push(&body[content_start..content_end]);
        cursor = next;
    }
}

fn parse_part(raw: &[u8]) -> Result<Part, MultipartError> {
    let (head, body) = if raw.starts_with(b"\r\n") {
        (&raw[..0], &raw[2..])
    } else if raw.starts_with(b"\n") {
        (&raw[..0], &raw[1..])
    } else if let Some(i) = find(raw, b"\r\n\r\n", 0) {
        (&raw[..i], &raw[i + 4..])
    } else if let Some(i) = find(raw, b"\n\n", 0) {
        (&raw[..i], &raw[i + 2..])
    } else {
        (raw, &raw[raw.len()..])
    };

    let headers = parse_headers(&String::from_utf8_lossy(head))?;

    let mut part = Part {
        headers,
        body: body.to_vec(),
        parts: Vec::new(),
        boundary: None,
    };

    if part.is_base64() {
        let compact: Vec<u8> = body
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        part.body = STANDARD
            .decode(compact)
            .map_err(|e| MultipartError::InvalidPart(format!("invalid base64 body: {}", e)))?;
    }

    if let Some(content_type) = part.content_type().map(str::to_string) {
        if is_multipart(&content_type) {
            let nested = Part::parse(&content_type, &part.body)?;
            part.parts = nested.parts;
            part.boundary = nested.boundary;
            part.body.clear();
        }
    }

    Ok(part)
}

fn parse_headers(head: &str) -> Result<HeaderMap, MultipartError> {
    let mut fields: Vec<(&str, String)> = Vec::new();
    for line in head.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous field.
            let (_, value) = fields
                .last_mut()
                .ok_or_else(|| MultipartError::InvalidPart("continuation without header".into()))?;
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(line.trim());
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MultipartError::InvalidPart(format!("malformed header line {:?}", line)))?;
        fields.push((name.trim(), value.trim().to_string()));
    }

    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| MultipartError::InvalidPart(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| MultipartError::InvalidPart(format!("invalid value for {}", name)))?;
        // Repeated fields are kept in order.
        headers.append(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    fn types(part: &Part) -> Vec<String> {
        part.parts().iter().map(Part::mime_type).collect()
    }

    fn leaf(content_type: &'static str, body: impl Into<Vec<u8>>) -> Part {
        Part::new(HeaderValue::from_static(content_type), body)
    }

    #[test]
    fn test_compose_structure() {
        let attachment = leaf("image/jpeg", vec![0xffu8, 0xd8, 0xff])
            .with_header("content-id", HeaderValue::from_static("<photo>"));
        let root = compose("<env/>".to_string(), &[attachment], None).unwrap();

        assert!(root.is_multipart());
        let content_type = root.content_type().unwrap();
        assert!(content_type.starts_with(MULTIPART_RELATED));
        assert!(content_type.contains(&format!("boundary=\"{}\"", root.boundary().unwrap())));
        assert_eq!(root.header("MIME-Version"), Some("1.0"));

        assert_eq!(root.parts().len(), 2);
        let soap = &root.parts()[0];
        assert_eq!(soap.content_type(), Some(SOAP_PART_CONTENT_TYPE));
        assert_eq!(soap.header("Content-Transfer-Encoding"), Some("7bit"));
        assert_eq!(soap.body(), b"<env/>");
        assert_eq!(root.parts()[1].header("Content-ID"), Some("<photo>"));
    }

    #[test]
    fn test_non_ascii_envelope_is_8bit() {
        let root = compose("<a>héllo</a>".to_string(), &[leaf("text/plain", "x")], None).unwrap();
        assert_eq!(root.parts()[0].header("Content-Transfer-Encoding"), Some("8bit"));
    }

    #[test]
    fn test_boundaries_are_unique() {
        assert_ne!(generate_boundary(), generate_boundary());
    }

    #[test]
    fn test_invalid_boundary_rejected() {
        assert!(matches!(
            Part::with_boundary(MULTIPART_RELATED, "bad\r\nboundary"),
            Err(MultipartError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_sort_by_priority() {
        let attachments = vec![
            leaf("application/pdf", "pdf"),
            leaf("image/png", "png"),
            leaf("application/octet-stream", "bin"),
            leaf("image/jpeg", "jpg"),
        ];
        let root = compose(
            "<env/>".to_string(),
            &attachments,
            Some(&order(&["image/jpeg", "text/xml", "image/*"])),
        )
        .unwrap();
        assert_eq!(
            types(&root),
            vec![
                "image/jpeg",
                "text/xml",
                "image/png",
                "application/pdf",
                "application/octet-stream"
            ]
        );
    }

    #[test]
    fn test_empty_sort_order_keeps_order() {
        let attachments = vec![leaf("image/png", "png"), leaf("text/plain", "t")];
        let root = compose("<env/>".to_string(), &attachments, Some(&[])).unwrap();
        assert_eq!(types(&root), vec!["text/xml", "image/png", "text/plain"]);
    }

    #[test]
    fn test_encode_layout_and_idempotence() {
        let mut root = Part::with_boundary(MULTIPART_RELATED, "b1").unwrap();
        root.add_part(leaf("text/xml; charset=utf-8", "<env/>"));
        root.add_part(leaf("text/plain", "hello"));

        let expected = "--b1\r\ncontent-type: text/xml; charset=utf-8\r\n\r\n<env/>\r\n\
                        --b1\r\ncontent-type: text/plain\r\n\r\nhello\r\n--b1--\r\n";
        assert_eq!(String::from_utf8(root.encoded_body()).unwrap(), expected);
        assert_eq!(root.encoded_body(), root.encoded_body());
    }

    #[test]
    fn test_base64_transfer_encoding() {
        let body = vec![7u8; 100];
        let part = leaf("application/octet-stream", body.clone())
            .with_header(CONTENT_TRANSFER_ENCODING, HeaderValue::from_static("base64"));
        let encoded = String::from_utf8(part.encoded_body()).unwrap();
        let lines: Vec<&str> = encoded.split("\r\n").collect();
        assert_eq!(lines[0].len(), 76);
        assert_eq!(STANDARD.decode(lines.concat()).unwrap(), body);
    }

    #[test]
    fn test_parse_roundtrip_with_nested_part() {
        let mut nested = Part::with_boundary("multipart/mixed", "inner").unwrap();
        nested.add_part(leaf("text/plain", "first"));
        nested.add_part(
            leaf("application/octet-stream", vec![1u8, 2, 3])
                .with_header(CONTENT_TRANSFER_ENCODING, HeaderValue::from_static("base64")),
        );

        let mut root = Part::with_boundary(MULTIPART_RELATED, "outer").unwrap();
        root.add_part(leaf("text/xml", "<Envelope/>"));
        root.add_part(nested);

        let content_type = root.content_type().unwrap().to_string();
        let parsed = Part::parse(&content_type, &root.encoded_body()).unwrap();

        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(parsed.parts()[0].body_str(), "<Envelope/>");
        let inner = &parsed.parts()[1];
        assert!(inner.is_multipart());
        assert_eq!(inner.parts().len(), 2);
        assert_eq!(inner.parts()[0].body_str(), "first");
        assert_eq!(inner.parts()[1].body(), &[1u8, 2, 3]);
    }

    #[test]
    fn test_parse_lf_line_endings_and_preamble() {
        let body = "preamble\n--xyz\nContent-Type: text/xml\n\n<a/>\n--xyz\nContent-Type: text/plain\nContent-ID:\n <att1>\n\nhi\n--xyz--\n";
        let parsed = Part::parse("multipart/related; boundary=xyz", body.as_bytes()).unwrap();
        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(parsed.parts()[0].body_str(), "<a/>");
        assert_eq!(parsed.parts()[1].header("Content-ID"), Some("<att1>"));
        assert_eq!(parsed.parts()[1].body_str(), "hi");
    }

    #[test]
    fn test_parse_keeps_repeated_headers() {
        let body = "--r\r\nContent-Type: text/plain\r\nX-Tag: one\r\nX-Tag: two\r\n\r\nhi\r\n--r--\r\n";
        let parsed = Part::parse("multipart/mixed; boundary=r", body.as_bytes()).unwrap();
        let tags: Vec<&str> = parsed.parts()[0]
            .headers()
            .get_all("x-tag")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        assert_eq!(tags, vec!["one", "two"]);
    }

    #[test]
    fn test_boundary_prefix_inside_body_is_content() {
        let body = "--b1\r\nContent-Type: text/plain\r\n\r\nline one\r\n--b1x is not a delimiter\r\n\
                    --b1 \r\nContent-Type: text/plain\r\n\r\nsecond\r\n--b1--\r\n";
        let parsed = Part::parse("multipart/mixed; boundary=b1", body.as_bytes()).unwrap();
        assert_eq!(parsed.parts().len(), 2);
        assert_eq!(
            parsed.parts()[0].body_str(),
            "line one\r\n--b1x is not a delimiter"
        );
        assert_eq!(parsed.parts()[1].body_str(), "second");
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(
            Part::parse("text/xml", b"<a/>"),
            Err(MultipartError::MissingBoundary)
        );
        assert!(matches!(
            Part::parse("multipart/related; boundary=q", b"no delimiter here"),
            Err(MultipartError::MissingDelimiter(_))
        ));
        assert!(matches!(
            Part::parse("multipart/related; boundary=q", b"--q\r\nContent-Type: text/xml\r\n\r\n<a/>"),
            Err(MultipartError::Truncated(_))
        ));
        assert!(matches!(
            Part::parse("multipart/related; boundary=q", b"--q\r\nBad Name: x\r\n\r\n<a/>\r\n--q--"),
            Err(MultipartError::InvalidPart(_))
        ));
    }

    #[test]
    fn test_boundary_param_lenient() {
        assert_eq!(
            boundary_param(r#"multipart/related; boundary="--==_mimepart_4d41"; type="text/xml""#),
            Some("--==_mimepart_4d41".to_string())
        );
        assert_eq!(
            boundary_param("multipart/related; boundary=--==_mimepart_x"),
            Some("--==_mimepart_x".to_string())
        );
        assert_eq!(boundary_param("text/xml; charset=utf-8"), None);
        assert!(is_multipart("Multipart/Related; boundary=a"));
        assert!(!is_multipart("text/xml;charset=UTF-8"));
    }
}
