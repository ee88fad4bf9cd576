//! Zentinel SOAP client binary.
//!
//! Run with: `zentinel-soap-client --endpoint URL --operation wsdl:authenticate --body body.xml`
//!
//! Sends one SOAP request and prints the normalized response body as JSON.

use anyhow::{bail, Context, Result};
use clap::Parser;
use http::HeaderValue;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_soap_client::multipart::CONTENT_TRANSFER_ENCODING;
use zentinel_soap_client::{
    Classification, Envelope, HttpRequest, Part, ReqwestTransport, SoapClientConfig,
    SoapRequest, SoapVersion, UsernameToken,
};

/// SOAP client for Zentinel.
///
/// Renders a SOAP envelope around the given body fragment, posts it to the endpoint
/// and prints the response body. Exits non-zero on SOAP faults and HTTP errors.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service endpoint URL
    #[arg(short, long)]
    endpoint: String,

    /// Operation element wrapping the body (e.g. "wsdl:authenticate")
    #[arg(short, long)]
    operation: String,

    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File holding the XML body fragment
    #[arg(short, long)]
    body: Option<PathBuf>,

    /// Target namespace URI bound to the namespace identifier
    #[arg(short, long)]
    namespace: Option<String>,

    /// SOAP version (1.1 or 1.2)
    #[arg(long)]
    soap_version: Option<SoapVersion>,

    /// Attachment as PATH=CONTENT_TYPE (repeatable)
    #[arg(short, long = "attach")]
    attachments: Vec<String>,

    /// WS-Security username
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// WS-Security password
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Send a WS-Security password digest instead of the plain password
    #[arg(long)]
    digest: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let config = match args.config {
        Some(ref path) if path.exists() => {
            info!("Config file: {}", path.display());
            SoapClientConfig::load(path).context("Failed to load config file")?
        }
        Some(ref path) => {
            info!("Config file {} not found, using defaults", path.display());
            SoapClientConfig::default()
        }
        None => SoapClientConfig::default(),
    };
    config.apply_globals();

    let envelope = build_envelope(&args, &config).await?;

    info!(
        endpoint = %envelope.endpoint(),
        operation = %args.operation,
        version = ?envelope.version(),
        attachments = envelope.parts().len(),
        "Sending SOAP request"
    );

    let transport = ReqwestTransport::from_settings(&config.settings);
    let mut request = SoapRequest::new(HttpRequest::default())
        .with_log_filter(config.settings.log_filter.clone())
        .raise_errors(Some(false));
    let response = request
        .execute(&transport, &envelope)
        .await
        .context("SOAP request failed")?;

    match response.classify() {
        Classification::Success => {
            let body = response.body().context("Invalid SOAP response")?;
            println!("{}", serde_json::to_string_pretty(body)?);
            Ok(())
        }
        Classification::SoapFault => bail!("SOAP fault: {}", response.soap_fault()),
        Classification::HttpError => bail!("{}", response.http_error()),
    }
}

async fn build_envelope(args: &Args, config: &SoapClientConfig) -> Result<Envelope> {
    let mut envelope = config.envelope(args.endpoint.as_str(), args.operation.as_str());

    if let Some(version) = args.soap_version {
        envelope.set_version(version)?;
    }
    if let Some(ref namespace) = args.namespace {
        envelope.set_namespace(namespace.as_str());
    }
    if let Some(ref path) = args.body {
        let body = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read body file {}", path.display()))?;
        envelope.set_body(body);
    }
    for attachment in &args.attachments {
        envelope.add_part(read_attachment(attachment).await?);
    }
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        envelope.set_security(
            UsernameToken::new(username.as_str(), password.as_str()).digest(args.digest),
        );
    }

    Ok(envelope)
}

/// Load a `PATH=CONTENT_TYPE` attachment as a base64 part named after the file.
async fn read_attachment(attachment: &str) -> Result<Part> {
    let Some((path, content_type)) = attachment.rsplit_once('=') else {
        bail!("Invalid attachment {:?}, expected PATH=CONTENT_TYPE", attachment);
    };
    let content_type = content_type
        .parse::<mime::Mime>()
        .with_context(|| format!("Invalid attachment content type {:?}", content_type))?;
    let content_type = HeaderValue::from_str(content_type.as_ref())
        .with_context(|| format!("Invalid attachment content type {:?}", content_type))?;
    let path = Path::new(path);
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let content_id = HeaderValue::from_str(&format!("<{}>", name))
        .with_context(|| format!("Attachment file name {:?} is not a valid Content-ID", name))?;

    Ok(Part::new(content_type, data)
        .with_header(CONTENT_TRANSFER_ENCODING, HeaderValue::from_static("base64"))
        .with_header("content-id", content_id))
}
