//! SOAP client message layer for Zentinel
//!
//! Builds SOAP request envelopes (optionally with MIME attachments and a WS-Security
//! header), sends them through a pluggable transport, and interprets the responses.
//!
//! # Features
//!
//! - Envelope rendering for SOAP 1.1 and 1.2 (namespaces, header, body, raw override)
//! - multipart/related requests with content-type ordered attachments
//! - Response normalization (namespace-insensitive keys, repeated siblings, multiRef)
//! - Success / SOAP fault / HTTP error classification with a raise policy
//! - Request interception and redacted request logging
//!
//! # Example
//!
//! ```ignore
//! use zentinel_soap_client::{Envelope, HttpRequest, ReqwestTransport, SoapRequest};
//!
//! let mut envelope = Envelope::new("http://example.com/auth", "wsdl:authenticate");
//! envelope.set_namespace("http://v1_0.ws.auth.order.example.com/");
//! envelope.set_body("<username>luke</username>");
//!
//! let response = SoapRequest::new(HttpRequest::default())
//!     .execute(&ReqwestTransport::new(), &envelope)
//!     .await?;
//! println!("{:?}", response.body()?);
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod multipart;
pub mod parser;
pub mod request;
pub mod response;
pub mod transport;
pub mod value;
pub mod wsse;

pub use config::{SoapClientConfig, SoapVersion};
pub use envelope::{Body, Envelope, HeaderRenderer, InputTag};
pub use error::{Error, InvalidResponseError, MultipartError, Result};
pub use multipart::Part;
pub use request::{HttpRequest, Interceptor, RawResponse, SoapRequest, Transport};
pub use response::{Classification, Response};
pub use transport::ReqwestTransport;
pub use value::{Mapping, Value};
pub use wsse::UsernameToken;
