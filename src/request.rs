//! SOAP request orchestration.
//!
//! [`SoapRequest`] turns an [`Envelope`] into an HTTP request (single XML body or
//! multipart/related), logs it, and hands it to a [`Transport`] unless an
//! [`Interceptor`] answers first.

use crate::envelope::Envelope;
use crate::error::{Error, Result, TransportError};
use crate::response::Response;
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, IntoHeaderName, CONTENT_TYPE};
use http::Method;
use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use std::borrow::Cow;
use tracing::debug;

/// Replacement for the text of filtered elements in logged request bodies.
pub const FILTERED: &str = "***FILTERED***";

/// An outbound HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set a header, replacing any previous values of `name`.
    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// A response as received from the transport. Never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawResponse {
    pub status: u16,
    /// Every received field, repeated ones included.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header<K: IntoHeaderName>(mut self, name: K, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn body_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Sends one HTTP request and returns the raw response.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> std::result::Result<RawResponse, TransportError>;
}

/// Answers a request in place of the transport.
///
/// Returning `Some` short-circuits the network call entirely.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, request: &HttpRequest) -> Option<RawResponse>;
}

impl<F> Interceptor for F
where
    F: Fn(&HttpRequest) -> Option<RawResponse> + Send + Sync,
{
    fn intercept(&self, request: &HttpRequest) -> Option<RawResponse> {
        self(request)
    }
}

/// Drives one SOAP call: request preparation, logging, transport, response.
pub struct SoapRequest {
    http: HttpRequest,
    interceptor: Option<Box<dyn Interceptor>>,
    log_filter: Vec<String>,
    raise_errors: Option<bool>,
}

impl SoapRequest {
    /// Wrap a request descriptor. Headers already set on it take precedence.
    pub fn new(http: HttpRequest) -> Self {
        Self {
            http,
            interceptor: None,
            log_filter: Vec::new(),
            raise_errors: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptor = Some(Box::new(interceptor));
        self
    }

    /// Element names whose text is masked in the logged request body.
    pub fn with_log_filter(mut self, filter: Vec<String>) -> Self {
        self.log_filter = filter;
        self
    }

    /// Override the process-wide raise policy for responses of this request.
    pub fn raise_errors(mut self, raise: Option<bool>) -> Self {
        self.raise_errors = raise;
        self
    }

    pub fn http(&self) -> &HttpRequest {
        &self.http
    }

    /// Fill in URL, headers and body for `envelope`.
    ///
    /// A caller-set Content-Type is never replaced.
    pub fn prepare(&mut self, envelope: &Envelope) -> Result<()> {
        self.http.url = envelope.endpoint().to_string();

        if envelope.has_parts() {
            let root = envelope.compose_multipart(envelope.parts_sort_order())?;
            for (name, value) in root.headers() {
                if name == CONTENT_TYPE {
                    self.http.headers.entry(name).or_insert_with(|| value.clone());
                } else {
                    self.http.headers.insert(name, value.clone());
                }
            }
            self.http.body = root.encoded_body();
        } else {
            self.http
                .headers
                .entry(CONTENT_TYPE)
                .or_insert_with(|| HeaderValue::from_static(envelope.version().content_type()));
            self.http.body = envelope.render().into_bytes();
        }

        Ok(())
    }

    /// Send `envelope` and interpret the answer.
    ///
    /// Transport failures surface as [`Error::Transport`]. SOAP faults and HTTP
    /// errors surface according to the raise policy.
    pub async fn execute<T>(&mut self, transport: &T, envelope: &Envelope) -> Result<Response>
    where
        T: Transport + ?Sized,
    {
        self.prepare(envelope)?;

        debug!(
            method = %self.http.method,
            url = %self.http.url,
            headers = ?self.http.headers,
            body = %redact(&self.http.body_str(), &self.log_filter),
            "Sending SOAP request"
        );

        let intercepted = self
            .interceptor
            .as_ref()
            .and_then(|interceptor| interceptor.intercept(&self.http));

        let raw = match intercepted {
            Some(raw) => {
                debug!(url = %self.http.url, "SOAP request intercepted");
                raw
            }
            None => transport.send(&self.http).await.map_err(Error::Transport)?,
        };

        debug!(
            status = raw.status,
            body = %raw.body_str(),
            "Received SOAP response"
        );

        Response::with_raise_policy(raw, self.raise_errors)
    }
}

/// Mask the text of every element whose local name is in `filter`.
///
/// Bodies that are not well-formed XML are returned unchanged.
pub fn redact(body: &str, filter: &[String]) -> String {
    if filter.is_empty() {
        return body.to_string();
    }
    match mask_elements(body, filter) {
        Ok(redacted) => redacted,
        Err(e) => {
            debug!(error = %e, "Request body not redacted");
            body.to_string()
        }
    }
}

fn mask_elements(
    body: &str,
    filter: &[String],
) -> std::result::Result<String, Box<dyn std::error::Error>> {
    let mut reader = Reader::from_str(body);
    let mut writer = Writer::new(Vec::new());

    let mut depth = 0usize;
    // Depth of the filtered element currently being masked
    let mut masking: Option<usize> = None;

    loop {
        match reader.read_event()? {
            Event::Eof => break,
            Event::Start(e) => {
                depth += 1;
                if masking.is_some() {
                    continue;
                }
                let filtered = is_filtered(e.local_name().as_ref(), filter);
                writer.write_event(Event::Start(e))?;
                if filtered {
                    writer.write_event(Event::Text(BytesText::new(FILTERED)))?;
                    masking = Some(depth);
                }
            }
            Event::End(e) => {
                if masking == Some(depth) {
                    masking = None;
                }
                if masking.is_none() {
                    writer.write_event(Event::End(e))?;
                }
                depth = depth.saturating_sub(1);
            }
            event => {
                if masking.is_none() {
                    writer.write_event(event)?;
                }
            }
        }
    }

    Ok(String::from_utf8(writer.into_inner())?)
}

fn is_filtered(local_name: &[u8], filter: &[String]) -> bool {
    filter
        .iter()
        .any(|name| name.as_bytes().eq_ignore_ascii_case(local_name))
}
