//! Configuration types and process-wide defaults for the SOAP client.

use crate::envelope::{Envelope, InputTag};
use crate::error::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// SOAP 1.1 envelope namespace.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[default]
    #[serde(rename = "1.1", alias = "1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope)
    #[serde(rename = "1.2", alias = "2")]
    Soap12,
}

impl SoapVersion {
    /// Envelope namespace URI for this version.
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    /// Request Content-Type used when the caller did not set one.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml;charset=UTF-8",
            Self::Soap12 => "application/soap+xml;charset=UTF-8",
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Soap11 => 1,
            Self::Soap12 => 2,
        }
    }
}

impl TryFrom<u8> for SoapVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Soap11),
            2 => Ok(Self::Soap12),
            other => Err(Error::InvalidVersion(other.to_string())),
        }
    }
}

impl FromStr for SoapVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "1.1" => Ok(Self::Soap11),
            "2" | "1.2" => Ok(Self::Soap12),
            other => Err(Error::InvalidVersion(other.to_string())),
        }
    }
}

impl TryFrom<&str> for SoapVersion {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// Process-wide defaults. Read at use, never snapshotted.
static DEFAULT_SOAP_VERSION: AtomicU8 = AtomicU8::new(1);
static RAISE_ERRORS: AtomicBool = AtomicBool::new(true);

/// Default SOAP version for envelopes that do not set one.
pub fn soap_version() -> SoapVersion {
    match DEFAULT_SOAP_VERSION.load(Ordering::Relaxed) {
        2 => SoapVersion::Soap12,
        _ => SoapVersion::Soap11,
    }
}

pub fn set_soap_version(version: SoapVersion) {
    DEFAULT_SOAP_VERSION.store(version.as_u8(), Ordering::Relaxed);
}

/// Whether faults and HTTP errors fail response construction by default.
pub fn raise_errors() -> bool {
    RAISE_ERRORS.load(Ordering::Relaxed)
}

pub fn set_raise_errors(raise: bool) {
    RAISE_ERRORS.store(raise, Ordering::Relaxed);
}

/// Main configuration for the SOAP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoapClientConfig {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Envelope defaults
    pub envelope: EnvelopeConfig,

    /// Multipart attachment settings
    pub attachments: AttachmentsConfig,
}

impl Default for SoapClientConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            envelope: EnvelopeConfig::default(),
            attachments: AttachmentsConfig::default(),
        }
    }
}

impl SoapClientConfig {
    /// Parse a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Push the settings into the process-wide defaults.
    pub fn apply_globals(&self) {
        set_soap_version(self.settings.soap_version);
        set_raise_errors(self.settings.raise_errors);
    }

    /// Build an envelope carrying the configured namespaces and sort order.
    pub fn envelope(&self, endpoint: impl Into<String>, input: impl Into<InputTag>) -> Envelope {
        let mut envelope = Envelope::new(endpoint, input);
        envelope.set_env_namespace(self.envelope.env_namespace.clone());
        envelope.set_namespace_identifier(self.envelope.namespace_identifier.clone());
        if let Some(ref namespace) = self.envelope.namespace {
            envelope.set_namespace(namespace.clone());
        }
        if !self.envelope.namespaces.is_empty() {
            envelope.set_namespaces(self.envelope.namespaces.clone());
        }
        if !self.attachments.sort_order.is_empty() {
            envelope.set_parts_sort_order(self.attachments.sort_order.clone());
        }
        envelope
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// SOAP version used when an envelope does not set one
    pub soap_version: SoapVersion,

    /// Fail response construction on SOAP faults and HTTP errors
    pub raise_errors: bool,

    /// Element names whose content is masked in request logs
    pub log_filter: Vec<String>,

    /// Transport timeout in seconds (0 disables it)
    pub timeout_secs: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            soap_version: SoapVersion::Soap11,
            raise_errors: true,
            log_filter: vec!["password".to_string()],
            timeout_secs: 30,
        }
    }
}

/// Envelope defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvelopeConfig {
    /// Envelope namespace prefix, empty for a default namespace
    pub env_namespace: String,

    /// Prefix bound to `namespace`
    pub namespace_identifier: String,

    /// Target namespace URI of the service
    pub namespace: Option<String>,

    /// Extra namespace declarations (`xmlns:foo` -> URI)
    pub namespaces: IndexMap<String, String>,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            env_namespace: "env".to_string(),
            namespace_identifier: "wsdl".to_string(),
            namespace: None,
            namespaces: IndexMap::new(),
        }
    }
}

/// Multipart attachment settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AttachmentsConfig {
    /// Content-type priority for multipart parts (glob patterns allowed)
    pub sort_order: Vec<String>,
}

/// Serializes tests that read or write the process-wide defaults.
#[cfg(test)]
pub(crate) fn globals_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SoapClientConfig::default();
        assert_eq!(config.settings.soap_version, SoapVersion::Soap11);
        assert!(config.settings.raise_errors);
        assert_eq!(config.envelope.env_namespace, "env");
        assert_eq!(config.envelope.namespace_identifier, "wsdl");
        assert!(config.attachments.sort_order.is_empty());
    }

    #[test]
    fn test_config_serialization() {
        let config = SoapClientConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = SoapClientConfig::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.settings.timeout_secs, config.settings.timeout_secs);
        assert_eq!(parsed.settings.soap_version, config.settings.soap_version);
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
version: "1"
settings:
  soap_version: "1.2"
  raise_errors: false
  log_filter:
    - Password
    - Token
envelope:
  env_namespace: soapenv
  namespace: http://example.com/users
  namespaces:
    "xmlns:ns2": http://example.com/types
attachments:
  sort_order:
    - text/xml
    - image/*
"#;
        let config = SoapClientConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.settings.soap_version, SoapVersion::Soap12);
        assert!(!config.settings.raise_errors);
        assert_eq!(config.settings.log_filter, vec!["Password", "Token"]);
        assert_eq!(config.settings.timeout_secs, 30);
        assert_eq!(config.envelope.env_namespace, "soapenv");
        assert_eq!(config.envelope.namespace_identifier, "wsdl");
        assert_eq!(
            config.envelope.namespaces.get("xmlns:ns2").map(String::as_str),
            Some("http://example.com/types")
        );
        assert_eq!(config.attachments.sort_order.len(), 2);
    }

    #[test]
    fn test_version_aliases_in_yaml() {
        let config = SoapClientConfig::from_yaml("settings:\n  soap_version: \"2\"\n").unwrap();
        assert_eq!(config.settings.soap_version, SoapVersion::Soap12);
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = SoapClientConfig::from_yaml("settings: [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_version_conversions() {
        assert_eq!(SoapVersion::try_from(1u8).unwrap(), SoapVersion::Soap11);
        assert_eq!(SoapVersion::try_from(2u8).unwrap(), SoapVersion::Soap12);
        assert!(matches!(
            SoapVersion::try_from(3u8),
            Err(Error::InvalidVersion(v)) if v == "3"
        ));
        assert_eq!("1.2".parse::<SoapVersion>().unwrap(), SoapVersion::Soap12);
        assert!("1.3".parse::<SoapVersion>().is_err());
    }

    #[test]
    fn test_version_content_types() {
        assert_eq!(SoapVersion::Soap11.content_type(), "text/xml;charset=UTF-8");
        assert_eq!(
            SoapVersion::Soap12.content_type(),
            "application/soap+xml;charset=UTF-8"
        );
    }

    #[test]
    fn test_globals_are_read_at_use() {
        let _guard = globals_lock();
        set_soap_version(SoapVersion::Soap12);
        assert_eq!(soap_version(), SoapVersion::Soap12);
        set_soap_version(SoapVersion::Soap11);
        assert_eq!(soap_version(), SoapVersion::Soap11);

        set_raise_errors(false);
        assert!(!raise_errors());
        set_raise_errors(true);
        assert!(raise_errors());
    }

    #[test]
    fn test_apply_globals() {
        let _guard = globals_lock();
        let mut config = SoapClientConfig::default();
        config.settings.soap_version = SoapVersion::Soap12;
        config.settings.raise_errors = false;
        config.apply_globals();
        assert_eq!(soap_version(), SoapVersion::Soap12);
        assert!(!raise_errors());

        SoapClientConfig::default().apply_globals();
        assert_eq!(soap_version(), SoapVersion::Soap11);
        assert!(raise_errors());
    }
}
