//! WS-Security UsernameToken header.

use crate::envelope::HeaderRenderer;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::escape::escape;
use sha1::{Digest, Sha1};
use std::fmt;

/// WS-Security extension namespace.
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
/// WS-Security utility namespace.
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";

const PASSWORD_TEXT: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordText";
const PASSWORD_DIGEST: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_BINARY: &str = "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// Username/password credentials rendered into a `wsse:Security` header.
///
/// Nonce and creation time are fixed when the token is built, so rendering the same
/// token twice produces the same XML.
#[derive(Clone)]
pub struct UsernameToken {
    username: String,
    password: String,
    digest: bool,
    nonce: Vec<u8>,
    created: DateTime<Utc>,
}

impl UsernameToken {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            digest: false,
            nonce: rand::random::<[u8; 16]>().to_vec(),
            created: Utc::now(),
        }
    }

    /// Send a PasswordDigest instead of the plain password.
    pub fn digest(mut self, digest: bool) -> Self {
        self.digest = digest;
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<Vec<u8>>) -> Self {
        self.nonce = nonce.into();
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = created;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn is_digest(&self) -> bool {
        self.digest
    }

    fn created(&self) -> String {
        self.created.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Base64(SHA-1(nonce + created + password)).
    fn password_digest(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(&self.nonce);
        hasher.update(self.created().as_bytes());
        hasher.update(self.password.as_bytes());
        STANDARD.encode(hasher.finalize())
    }
}

impl HeaderRenderer for UsernameToken {
    fn render_to_xml(&self) -> String {
        let mut xml = format!(
            r#"<wsse:Security xmlns:wsse="{}"><wsse:UsernameToken xmlns:wsu="{}"><wsse:Username>{}</wsse:Username>"#,
            WSSE_NS,
            WSU_NS,
            escape(&self.username)
        );

        if self.digest {
            xml.push_str(&format!(
                r#"<wsse:Password Type="{}">{}</wsse:Password><wsse:Nonce EncodingType="{}">{}</wsse:Nonce><wsu:Created>{}</wsu:Created>"#,
                PASSWORD_DIGEST,
                self.password_digest(),
                BASE64_BINARY,
                STANDARD.encode(&self.nonce),
                self.created()
            ));
        } else {
            xml.push_str(&format!(
                r#"<wsse:Password Type="{}">{}</wsse:Password>"#,
                PASSWORD_TEXT,
                escape(&self.password)
            ));
        }

        xml.push_str("</wsse:UsernameToken></wsse:Security>");
        xml
    }
}

impl fmt::Debug for UsernameToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsernameToken")
            .field("username", &self.username)
            .field("password", &"***")
            .field("digest", &self.digest)
            .finish()
    }
}
