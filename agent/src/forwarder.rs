//! Forwards `Request`/`RequestBodyChunk` tunnel messages to the internal
//! service a mapping points at, and streams the reply back as
//! `Response`/`ResponseBodyChunk`.
//!
//! Two `reqwest::Client`s are kept around: `strict` uses the platform
//! trust store, `insecure` trusts only certificates that are literally
//! self-signed (subject equals issuer) via a custom `rustls`
//! certificate verifier. Which one is used is decided per mapping by
//! `allow_self_signed`, never globally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::StreamExt;
use reqwest::Client;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tunnel_protocol::{is_hop_by_hop, Message, PortMapping};

use crate::config::ForwarderSettings;
use crate::connection::TunnelConnection;

/// Responses with a declared `Content-Length` at or below this are sent
/// as a single `Response` rather than streamed.
const SMALL_RESPONSE_THRESHOLD_BYTES: usize = 256 * 1024;

#[derive(Debug)]
struct SelfSignedOnlyVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SelfSignedOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let (_, cert) = x509_parser::parse_x509_certificate(end_entity.as_ref())
            .map_err(|e| TlsError::General(format!("invalid internal service certificate: {e}")))?;

        if cert.subject() == cert.issuer() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(
                "refusing certificate that is not self-signed".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

pub struct Forwarder {
    strict: Client,
    insecure: Client,
    settings: ForwarderSettings,
}

impl Forwarder {
    pub fn new(settings: ForwarderSettings) -> Result<Self> {
        let strict = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut tls_config = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(rustls::ALL_VERSIONS)
            .expect("rustls protocol version list is valid")
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SelfSignedOnlyVerifier { provider }))
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let insecure = Client::builder()
            .use_preconfigured_tls(tls_config)
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .build()?;

        Ok(Self { strict, insecure, settings })
    }

    fn client_for(&self, mapping: &PortMapping) -> &Client {
        if mapping.allow_self_signed {
            &self.insecure
        } else {
            &self.strict
        }
    }

    fn base_url(&self, mapping: &PortMapping) -> String {
        let scheme = if mapping.internal_use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, mapping.internal_host, mapping.internal_port)
    }

    /// Handle one forwarded HTTP call end to end: issue the request to
    /// the internal service (collecting any additional body chunks that
    /// arrive on `body_chunks` first), then stream the reply back onto
    /// `conn` as a `Response` followed by zero or more `ResponseBodyChunk`s.
    pub async fn forward(
        &self,
        conn: &TunnelConnection,
        mapping: &PortMapping,
        request: Message,
        mut body_chunks: mpsc::Receiver<Message>,
    ) {
        let Message::Request {
            request_id,
            method,
            path_and_query,
            headers,
            initial_body,
            has_more_body,
            ..
        } = request
        else {
            warn!("forward() called with a non-Request message");
            return;
        };

        let mut body = initial_body.unwrap_or_default();
        if has_more_body {
            while let Some(chunk) = body_chunks.recv().await {
                match chunk {
                    Message::RequestBodyChunk { bytes, is_final, .. } => {
                        body.extend_from_slice(&bytes);
                        if is_final {
                            break;
                        }
                    }
                    other => {
                        debug!(kind = other.kind(), "unexpected message while collecting request body");
                    }
                }
            }
        }
        conn.unregister_streaming(&request_id);

        let url = format!("{}{}", self.base_url(mapping), path_and_query);
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => {
                send_error_response(conn, &request_id, 400, "invalid method").await;
                return;
            }
        };

        let client = self.client_for(mapping);
        let mut builder = client
            .request(method, &url)
            .timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .body(body);
        for (name, values) in &headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            for value in values {
                builder = builder.header(name, value);
            }
        }
        builder = builder
            .header("X-Octoporty-Request-Id", &request_id)
            .header("X-Forwarded-Proto", "https");

        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(host = %mapping.internal_host, port = mapping.internal_port, "upstream request timed out");
                send_error_response(conn, &request_id, 504, "Gateway Timeout").await;
                return;
            }
            Err(e) => {
                warn!(
                    host = %mapping.internal_host,
                    port = mapping.internal_port,
                    error = %e,
                    "failed to reach internal service"
                );
                send_error_response(conn, &request_id, 502, "Bad Gateway: upstream service unavailable").await;
                return;
            }
        };

        let status = response.status().as_u16();
        let content_length = response.content_length();
        let response_headers: Vec<(String, Vec<String>)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    vec![value.to_str().unwrap_or_default().to_string()],
                )
            })
            .collect();

        // A declared Content-Length at or below 256 KiB is
        // sent whole in one `Response`; anything larger (or undeclared)
        // streams as `ResponseBodyChunk`s of `stream_chunk_bytes` each.
        if let Some(len) = content_length {
            if len as usize <= SMALL_RESPONSE_THRESHOLD_BYTES {
                let body = match response.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, request_id = %request_id, "error reading upstream body");
                        send_error_response(conn, &request_id, 502, "Bad Gateway: upstream service unavailable").await;
                        return;
                    }
                };
                conn.enqueue(Message::Response {
                    request_id,
                    status,
                    headers: response_headers,
                    initial_body: Some(body.to_vec()),
                    has_more_body: false,
                })
                .await;
                return;
            }
        }

        conn.enqueue(Message::Response {
            request_id: request_id.clone(),
            status,
            headers: response_headers,
            initial_body: None,
            has_more_body: true,
        })
        .await;

        let chunk_size = self.settings.stream_chunk_bytes;
        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::with_capacity(chunk_size);

        loop {
            match stream.next().await {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    while pending.len() >= chunk_size {
                        let rest = pending.split_off(chunk_size);
                        conn.enqueue(Message::ResponseBodyChunk {
                            request_id: request_id.clone(),
                            bytes: std::mem::replace(&mut pending, rest),
                            is_final: false,
                        })
                        .await;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, request_id = %request_id, "error streaming upstream body");
                    break;
                }
                None => break,
            }
        }

        if !pending.is_empty() {
            conn.enqueue(Message::ResponseBodyChunk {
                request_id: request_id.clone(),
                bytes: pending,
                is_final: false,
            })
            .await;
        }

        // A terminal empty chunk always closes the stream unambiguously,
        // even if the last data chunk landed exactly on a
        // `stream_chunk_bytes` boundary.
        conn.enqueue(Message::ResponseBodyChunk {
            request_id,
            bytes: Vec::new(),
            is_final: true,
        })
        .await;
    }
}

async fn send_error_response(conn: &TunnelConnection, request_id: &str, status: u16, message: &str) {
    conn.enqueue(Message::Response {
        request_id: request_id.to_string(),
        status,
        headers: Vec::new(),
        initial_body: Some(message.as_bytes().to_vec()),
        has_more_body: false,
    })
    .await;
}
