//! SOAP response interpretation.
//!
//! A [`Response`] owns the raw HTTP response and lazily derives the envelope XML,
//! attachments, parsed document and normalized body/header from it. Every derived
//! value is computed at most once, also under concurrent first access.

use crate::config;
use crate::error::{Error, InvalidResponseError, Result};
use crate::multipart::{self, Part};
use crate::parser::{Document, Node};
use crate::request::RawResponse;
use crate::value::{Mapping, Value};
use http::header::CONTENT_TYPE;
use once_cell::sync::{Lazy, OnceCell};
use std::fmt;
use tracing::{debug, warn};

/// Outcome of a SOAP call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    SoapFault,
    HttpError,
}

/// Envelope XML and MIME parts extracted from the raw body.
#[derive(Debug)]
struct Decoded {
    xml: String,
    parts: Vec<Part>,
}

/// A SOAP response.
pub struct Response {
    http: RawResponse,
    decoded: OnceCell<Decoded>,
    document: OnceCell<std::result::Result<Document, InvalidResponseError>>,
    body: OnceCell<std::result::Result<Mapping, InvalidResponseError>>,
    header: OnceCell<std::result::Result<Mapping, InvalidResponseError>>,
}

impl Response {
    /// Wrap a raw response, applying the process-wide raise policy.
    pub fn new(http: RawResponse) -> Result<Self> {
        Self::with_raise_policy(http, None)
    }

    /// Wrap a raw response. `raise` overrides the process-wide policy when set.
    ///
    /// With raising enabled a SOAP fault fails with [`Error::SoapFault`] and any other
    /// non-2xx status with [`Error::Http`]. Both carry the response.
    pub fn with_raise_policy(http: RawResponse, raise: Option<bool>) -> Result<Self> {
        let response = Self {
            http,
            decoded: OnceCell::new(),
            document: OnceCell::new(),
            body: OnceCell::new(),
            header: OnceCell::new(),
        };

        if !raise.unwrap_or_else(config::raise_errors) {
            return Ok(response);
        }

        match response.classify() {
            Classification::Success => Ok(response),
            Classification::SoapFault => Err(Error::SoapFault(Box::new(response))),
            Classification::HttpError => Err(Error::Http(Box::new(response))),
        }
    }

    /// The raw HTTP response.
    pub fn http(&self) -> &RawResponse {
        &self.http
    }

    pub fn status(&self) -> u16 {
        self.http.status
    }

    /// Envelope XML as received. For multipart bodies this is the first part.
    pub fn to_xml(&self) -> &str {
        &self.decoded().xml
    }

    /// All top-level MIME parts of a multipart body, envelope included.
    pub fn parts(&self) -> &[Part] {
        &self.decoded().parts
    }

    /// MIME parts after the envelope.
    pub fn attachments(&self) -> &[Part] {
        self.parts().get(1..).unwrap_or_default()
    }

    /// The parsed document. Parse failures are cached and reported identically.
    pub fn doc(&self) -> std::result::Result<&Document, InvalidResponseError> {
        self.document
            .get_or_init(|| Document::parse(self.to_xml()))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Normalized SOAP Body.
    pub fn body(&self) -> std::result::Result<&Mapping, InvalidResponseError> {
        self.body
            .get_or_init(|| self.doc().and_then(Document::body))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// Normalized SOAP Header.
    pub fn header(&self) -> std::result::Result<&Mapping, InvalidResponseError> {
        self.header
            .get_or_init(|| self.doc().and_then(Document::header))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// The whole document as a value (`{envelope: {header, body}}`).
    pub fn to_value(&self) -> std::result::Result<Value, InvalidResponseError> {
        self.doc().and_then(Document::to_value)
    }

    /// Top-level body entry. Missing or unreadable bodies yield `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.recovered_body().get(key)
    }

    /// Values at `path` in the normalized body.
    ///
    /// A missing link or a Null terminal yields nothing, a List yields its items and
    /// any other value yields itself.
    pub fn to_array(&self, path: &[&str]) -> Vec<&Value> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };

        let mut current = match self.recovered_body().get(*first) {
            Some(value) => value,
            None => return Vec::new(),
        };
        for key in rest {
            match current.get(key) {
                Some(value) => current = value,
                None => return Vec::new(),
            }
        }

        match current {
            Value::Null => Vec::new(),
            Value::List(items) => items.iter().collect(),
            other => vec![other],
        }
    }

    /// Structural query over the parsed document, bypassing normalization.
    ///
    /// Unparseable documents match nothing.
    pub fn query(&self, expression: &str) -> Vec<&Node> {
        match self.doc() {
            Ok(doc) => doc.query(expression),
            Err(_) => Vec::new(),
        }
    }

    pub fn classify(&self) -> Classification {
        if self.recovered_body().contains_key("fault") {
            Classification::SoapFault
        } else if !self.http.is_success() {
            Classification::HttpError
        } else {
            Classification::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.classify() == Classification::Success
    }

    pub fn is_soap_fault(&self) -> bool {
        self.classify() == Classification::SoapFault
    }

    pub fn is_http_error(&self) -> bool {
        self.classify() == Classification::HttpError
    }

    /// Fault view. Reports no fault when the body carries none.
    pub fn soap_fault(&self) -> Fault<'_> {
        Fault { response: self }
    }

    /// HTTP error view. Reports no error for 2xx responses.
    pub fn http_error(&self) -> HttpError<'_> {
        HttpError { response: self }
    }

    fn decoded(&self) -> &Decoded {
        self.decoded.get_or_init(|| decode(&self.http))
    }

    /// Body for classification and path access: malformed documents read as empty.
    fn recovered_body(&self) -> &Mapping {
        static EMPTY: Lazy<Mapping> = Lazy::new(Mapping::new);
        self.body().unwrap_or(&*EMPTY)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.http.status)
            .field("headers", &self.http.headers)
            .field("body_len", &self.http.body.len())
            .finish()
    }
}

fn decode(http: &RawResponse) -> Decoded {
    let content_type = http.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    if let Some(content_type) = content_type {
        if multipart::is_multipart(content_type) {
            match Part::parse(content_type, &http.body) {
                Ok(container) if !container.parts().is_empty() => {
                    let parts = container.parts().to_vec();
                    debug!(parts = parts.len(), "Decoded multipart SOAP response");
                    return Decoded {
                        xml: parts[0].body_str().into_owned(),
                        parts,
                    };
                }
                Ok(_) => warn!("Multipart SOAP response without parts, reading body as XML"),
                Err(e) => warn!(error = %e, "Invalid multipart SOAP response, reading body as XML"),
            }
        }
    }

    Decoded {
        xml: String::from_utf8_lossy(&http.body).into_owned(),
        parts: Vec::new(),
    }
}

/// SOAP fault view over a [`Response`].
#[derive(Clone, Copy)]
pub struct Fault<'a> {
    response: &'a Response,
}

impl<'a> Fault<'a> {
    pub fn is_present(&self) -> bool {
        self.fault().is_some()
    }

    /// `faultcode` (SOAP 1.1) or `Code/Value` (SOAP 1.2).
    pub fn code(&self) -> Option<&'a str> {
        let fault = self.fault()?;
        fault
            .get("faultcode")
            .or_else(|| fault.get("code").and_then(|code| code.get("value")))
            .and_then(Value::as_str)
    }

    /// `faultstring` (SOAP 1.1) or `Reason/Text` (SOAP 1.2).
    pub fn message(&self) -> Option<&'a str> {
        let fault = self.fault()?;
        fault
            .get("faultstring")
            .or_else(|| fault.get("reason").and_then(|reason| reason.get("text")))
            .and_then(Value::as_str)
    }

    /// The normalized `fault` entry of the body.
    pub fn details(&self) -> Option<&'a Value> {
        self.fault()
    }

    fn fault(&self) -> Option<&'a Value> {
        self.response.recovered_body().get("fault")
    }
}

impl fmt::Display for Fault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return f.write_str("no SOAP fault");
        }
        write!(
            f,
            "({}) {}",
            self.code().unwrap_or_default(),
            self.message().unwrap_or_default()
        )
    }
}

impl fmt::Debug for Fault<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("code", &self.code())
            .field("message", &self.message())
            .finish()
    }
}

/// HTTP error view over a [`Response`].
#[derive(Clone, Copy)]
pub struct HttpError<'a> {
    response: &'a Response,
}

impl<'a> HttpError<'a> {
    pub fn is_present(&self) -> bool {
        !self.response.http.is_success()
    }

    pub fn status(&self) -> u16 {
        self.response.http.status
    }

    pub fn body(&self) -> &'a [u8] {
        &self.response.http.body
    }
}

impl fmt::Display for HttpError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return f.write_str("no HTTP error");
        }
        write!(f, "HTTP error ({})", self.status())?;
        let body = String::from_utf8_lossy(self.body());
        if !body.trim().is_empty() {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

impl fmt::Debug for HttpError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpError")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use std::sync::Arc;

    const AUTHENTICATE: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
        r#"<soap:Body><ns2:authenticateResponse xmlns:ns2="http://v1_0.ws.auth.order.example.com/">"#,
        r#"<return>ok</return></ns2:authenticateResponse></soap:Body></soap:Envelope>"#
    );

    const SOAP11_FAULT: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#,
        r#"<soap:Fault><faultcode>soap:Server</faultcode>"#,
        r#"<faultstring>Fault occurred while processing.</faultstring></soap:Fault>"#,
        r#"</soap:Body></soap:Envelope>"#
    );

    const SOAP12_FAULT: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body>"#,
        r#"<soap:Fault><soap:Code><soap:Value>soap:Sender</soap:Value></soap:Code>"#,
        r#"<soap:Reason><soap:Text xml:lang="en">Invalid order</soap:Text></soap:Reason>"#,
        r#"</soap:Fault></soap:Body></soap:Envelope>"#
    );

    const MULTI_ORDER: &str = concat!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">"#,
        r#"<soap:Header><ns1:session xmlns:ns1="urn:s">42</ns1:session></soap:Header>"#,
        r#"<soap:Body><ns2:listResponse xmlns:ns2="urn:orders"><orders>"#,
        r#"<order><id>1</id><item>a</item><item>b</item></order>"#,
        r#"<order><id>2</id><item>c</item></order>"#,
        r#"</orders><empty/></ns2:listResponse></soap:Body></soap:Envelope>"#
    );

    fn lenient(status: u16, body: &str) -> Response {
        Response::with_raise_policy(RawResponse::new(status, body), Some(false)).unwrap()
    }

    fn text(value: &str) -> Value {
        Value::Text(value.to_string())
    }

    #[test]
    fn test_authenticate_response_is_success() {
        let response = lenient(200, AUTHENTICATE);
        assert_eq!(response.classify(), Classification::Success);

        let mut inner = Mapping::new();
        inner.insert("return".to_string(), text("ok"));
        let mut expected = Mapping::new();
        expected.insert("authenticate_response".to_string(), Value::Map(inner));
        assert_eq!(response.body().unwrap(), &expected);
        assert_eq!(response.to_xml(), AUTHENTICATE);
        assert!(!response.soap_fault().is_present());
        assert!(!response.http_error().is_present());
    }

    #[test]
    fn test_fault_with_success_status() {
        let response = lenient(200, SOAP11_FAULT);
        assert!(response.is_soap_fault());
        assert_eq!(response.soap_fault().code(), Some("soap:Server"));
        assert_eq!(
            response.soap_fault().to_string(),
            "(soap:Server) Fault occurred while processing."
        );
    }

    #[test]
    fn test_fault_with_error_status() {
        let response = lenient(500, SOAP11_FAULT);
        assert!(response.is_soap_fault());
        assert!(!response.is_http_error());
        assert!(response.http_error().is_present());
    }

    #[test]
    fn test_soap12_fault() {
        let fault_response = lenient(500, SOAP12_FAULT);
        let fault = fault_response.soap_fault();
        assert_eq!(fault.code(), Some("soap:Sender"));
        assert_eq!(fault.message(), Some("Invalid order"));
        assert_eq!(fault.to_string(), "(soap:Sender) Invalid order");
    }

    #[test]
    fn test_http_error() {
        let response = lenient(404, "Not found");
        assert!(response.is_http_error());
        assert_eq!(response.http_error().status(), 404);
        assert_eq!(response.http_error().to_string(), "HTTP error (404): Not found");
        assert_eq!(response.soap_fault().to_string(), "no SOAP fault");

        let err = response.body().unwrap_err();
        assert!(err.message().contains("XML") || err.message().contains("root"));
        assert_eq!(lenient(502, "").http_error().to_string(), "HTTP error (502)");
    }

    #[test]
    fn test_raise_policy() {
        let err = Response::with_raise_policy(RawResponse::new(500, SOAP11_FAULT), Some(true))
            .unwrap_err();
        assert!(matches!(err, Error::SoapFault(_)));
        assert_eq!(err.to_string(), "(soap:Server) Fault occurred while processing.");
        let response = err.into_response().unwrap();
        assert_eq!(response.status(), 500);

        let err = Response::with_raise_policy(RawResponse::new(404, "Not found"), Some(true))
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        assert_eq!(err.response().map(Response::status), Some(404));

        assert!(Response::with_raise_policy(RawResponse::new(200, AUTHENTICATE), Some(true)).is_ok());
    }

    #[test]
    fn test_raise_policy_reads_global_default() {
        let _guard = config::globals_lock();
        config::set_raise_errors(false);
        assert!(Response::new(RawResponse::new(404, "Not found")).is_ok());
        config::set_raise_errors(true);
        assert!(Response::new(RawResponse::new(404, "Not found")).is_err());
    }

    #[test]
    fn test_to_array() {
        let response = lenient(200, MULTI_ORDER);

        let orders = response.to_array(&["list_response", "orders", "order"]);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].get("id"), Some(&text("1")));

        let items = orders[0].get("item").and_then(Value::as_list).unwrap();
        assert_eq!(items, &[text("a"), text("b")]);
        assert_eq!(orders[1].get("item"), Some(&text("c")));

        assert_eq!(response.to_array(&["list_response", "orders"]).len(), 1);
        assert!(response.to_array(&["list_response", "missing", "order"]).is_empty());
        assert!(response.to_array(&["list_response", "empty"]).is_empty());
        assert!(response.to_array(&[]).is_empty());
        assert!(lenient(200, "not xml").to_array(&["anything"]).is_empty());
    }

    #[test]
    fn test_header_and_get() {
        let response = lenient(200, MULTI_ORDER);
        assert_eq!(response.header().unwrap().get("session"), Some(&text("42")));
        assert!(response.get("list_response").is_some());
        assert!(lenient(200, AUTHENTICATE).header().unwrap().is_empty());
    }

    #[test]
    fn test_query() {
        let response = lenient(200, MULTI_ORDER);
        let ids = response.query("//order/id");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[1].text, "2");
        assert_eq!(response.query("//ns2:listResponse/orders/order[2]/item")[0].text, "c");
        assert!(lenient(200, "<broken").query("//x").is_empty());
    }

    #[test]
    fn test_invalid_response_is_cached() {
        let response = lenient(200, "<soap:Envelope><soap:Body>");
        let first = response.body().unwrap_err();
        let second = response.body().unwrap_err();
        assert_eq!(first, second);
        assert_eq!(response.header().unwrap_err(), first);
        assert_eq!(response.doc().unwrap_err(), first);
        assert!(response.is_success());
    }

    #[test]
    fn test_non_envelope_root_is_invalid() {
        let response = lenient(200, "<html><body>hi</body></html>");
        assert!(response.doc().is_ok());
        assert!(response.body().is_err());
        assert!(response.header().is_err());
    }

    #[test]
    fn test_body_is_memoized() {
        let response = lenient(200, AUTHENTICATE);
        let first = response.body().unwrap() as *const Mapping;
        let second = response.body().unwrap() as *const Mapping;
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_first_access() {
        let response = Arc::new(lenient(200, MULTI_ORDER));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let response = Arc::clone(&response);
                std::thread::spawn(move || response.body().unwrap() as *const Mapping as usize)
            })
            .collect();
        let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(addresses.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_multipart_response() {
        let boundary = "MIME_boundary";
        let body = format!(
            "--{b}\r\nContent-Type: text/xml; charset=utf-8\r\n\r\n{xml}\r\n\
             --{b}\r\nContent-Type: text/plain\r\nContent-ID: <note>\r\n\r\nhello\r\n\
             --{b}--\r\n",
            b = boundary,
            xml = AUTHENTICATE
        );
        let content_type =
            format!(r#"multipart/related; type="text/xml"; boundary="{}""#, boundary);
        let raw = RawResponse::new(200, body)
            .with_header(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
        let response = Response::with_raise_policy(raw, Some(false)).unwrap();

        assert_eq!(response.to_xml(), AUTHENTICATE);
        assert_eq!(response.parts().len(), 2);
        assert_eq!(response.attachments().len(), 1);
        assert_eq!(response.attachments()[0].body(), b"hello");
        assert_eq!(response.attachments()[0].header("Content-ID"), Some("<note>"));
        assert!(response.is_success());
    }

    #[test]
    fn test_broken_multipart_falls_back_to_raw_body() {
        let raw = RawResponse::new(200, AUTHENTICATE)
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static(r#"multipart/related; boundary="nope""#),
            );
        let response = Response::with_raise_policy(raw, Some(false)).unwrap();
        assert_eq!(response.to_xml(), AUTHENTICATE);
        assert!(response.attachments().is_empty());
        assert!(response.get("authenticate_response").is_some());
    }

    #[test]
    fn test_to_value() {
        let value = lenient(200, AUTHENTICATE).to_value().unwrap();
        let body = value.get("envelope").and_then(|e| e.get("body")).unwrap();
        assert!(body.get("authenticate_response").is_some());
    }

    #[test]
    fn test_response_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Response>();
    }
}
