use crate::error::{ProxyError, ProxyErrorKind};
use crate::proxy::context::{empty_body, BoxBody};
use crate::upstream::transport::{build_tls_config, dial_address};
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Whether the request asks for a protocol switch: HTTP/1.1+, a
/// `Connection` header naming `upgrade`, and a non-empty `Upgrade` header.
pub fn is_upgrade_request(version: Version, headers: &HeaderMap) -> bool {
    // Hop-by-hop upgrade is an HTTP/1.1 mechanism; HTTP/2+ multiplexing
    // has no equivalent here and 1.0 predates it.
    if version != Version::HTTP_11 {
        return false;
    }

    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    wants_upgrade
        && headers
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| !v.is_empty())
            .unwrap_or(false)
}

/// Inputs for one upgrade exchange, extracted from the request context.
pub struct UpgradeRequest {
    pub method: http::Method,
    /// Origin-form target (path and query).
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: BoxBody,
    /// The downstream half, resolved by the server once we answer 101.
    pub on_upgrade: OnUpgrade,
}

/// Dial the backend, replay the request, and either proxy a non-101
/// response back untouched or bridge the two upgraded connections until
/// one side finishes.
pub async fn serve_upgrade(
    scheme: &str,
    host: &str,
    req: UpgradeRequest,
    insecure: bool,
    audit: bool,
) -> Result<hyper::Response<BoxBody>, ProxyError> {
    if audit {
        // Clients strip fragments before sending, so `fragment` stays null
        // for wire traffic; a filter-rewritten target may still carry one.
        let target = req.path_and_query.as_str();
        let (without_fragment, fragment) = match target.split_once('#') {
            Some((t, f)) => (t, Some(f)),
            None => (target, None),
        };
        let (path, query) = match without_fragment.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (without_fragment, None),
        };
        let record = serde_json::json!({
            "method": req.method.as_str(),
            "path": path,
            "query": query,
            "fragment": fragment,
        });
        tracing::info!(target: "upgrade_audit", "{}", record);
    }

    let addr = dial_address(scheme, host);
    let stream = TcpStream::connect(&addr).await.map_err(|e| {
        ProxyError::new(
            ProxyErrorKind::DialingFailed,
            format!("dial {}: {}", addr, e),
        )
    })?;

    if scheme == "https" {
        let connector = TlsConnector::from(Arc::new(build_tls_config(insecure)));
        let server_name = host.split(':').next().unwrap_or(host).to_string();
        let server_name = ServerName::try_from(server_name).map_err(|e| {
            ProxyError::new(ProxyErrorKind::BackendTransport, format!("tls name: {}", e))
        })?;
        let tls = connector.connect(server_name, stream).await.map_err(|e| {
            ProxyError::new(
                ProxyErrorKind::BackendTransport,
                format!("tls handshake: {}", e),
            )
        })?;
        exchange(tls, req, audit).await
    } else {
        exchange(stream, req, audit).await
    }
}

async fn exchange<S>(
    stream: S,
    req: UpgradeRequest,
    audit: bool,
) -> Result<hyper::Response<BoxBody>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(transport_err)?;

    // The connection task owns the socket; `with_upgrades` keeps it alive
    // through the protocol switch.
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            tracing::debug!("upgrade: backend connection ended: {}", e);
        }
    });

    let mut builder = hyper::Request::builder()
        .method(req.method.clone())
        .uri(req.path_and_query.as_str());
    for (name, value) in &req.headers {
        builder = builder.header(name, value);
    }
    let outgoing = builder.body(req.body).map_err(|e| {
        ProxyError::new(ProxyErrorKind::Internal, format!("build request: {}", e))
    })?;

    let response = sender.send_request(outgoing).await.map_err(transport_err)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        // 401, Connection: close, anything — proxy it back verbatim as an
        // ordinary response.
        return Ok(response.map(|b| b.map_err(|e| e.into()).boxed()));
    }

    let (parts, body) = response.into_parts();
    let backend_upgrade = hyper::upgrade::on(hyper::Response::from_parts(parts.clone(), body));
    let client_upgrade = req.on_upgrade;

    tokio::spawn(async move {
        let backend = match backend_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                tracing::error!("upgrade: backend upgrade failed: {}", e);
                return;
            }
        };
        let client = match client_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                tracing::error!("upgrade: client upgrade failed: {}", e);
                return;
            }
        };
        tunnel(client, backend, audit).await;
    });

    // The backend's 101 goes to the client verbatim; hyper performs the
    // protocol switch on the client connection when it sees the status.
    Ok(hyper::Response::from_parts(parts, empty_body()))
}

/// Copy both directions until the first one finishes, then drop both
/// halves, which closes both connections and unblocks the second copy.
async fn tunnel<C, B>(client: C, backend: B, audit: bool)
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let client_to_backend = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        let _ = backend_write.shutdown().await;
        copied
    };

    let backend_to_client = async {
        let mut buf = [0u8; 8 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = match backend_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = client_write.shutdown().await;
                    return Err(e);
                }
            };
            if audit {
                tracing::debug!(
                    target: "upgrade_audit",
                    "{}",
                    String::from_utf8_lossy(&buf[..n])
                );
            }
            if let Err(e) = client_write.write_all(&buf[..n]).await {
                return Err(e);
            }
            let _ = client_write.flush().await;
            total += n as u64;
        }
        let _ = client_write.shutdown().await;
        Ok(total)
    };

    tokio::select! {
        result = client_to_backend => {
            if let Err(e) = result {
                tracing::debug!("upgrade: client→backend copy ended: {}", e);
            }
        }
        result = backend_to_client => {
            if let Err(e) = result {
                tracing::debug!("upgrade: backend→client copy ended: {}", e);
            }
        }
    }
    // Both halves drop here, closing the tunnel in both directions.
}

fn transport_err(e: hyper::Error) -> ProxyError {
    ProxyError::new(ProxyErrorKind::BackendTransport, e.to_string())
}
