use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};

/// Extension key for storing extracted IP address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

/// Resolve the caller address.
///
/// Priority:
/// 1. X-Forwarded-For header, last hop (the one our own proxy appended)
/// 2. X-Real-IP header
/// 3. Socket address
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        return forwarded
            .to_str()
            .ok()
            .and_then(|s| s.rsplit(',').map(str::trim).find(|hop| !hop.is_empty()))
            .and_then(|s| s.parse::<IpAddr>().ok());
    }
    if let Some(real_ip) = headers.get("x-real-ip") {
        return real_ip.to_str().ok().and_then(|s| s.trim().parse().ok());
    }
    peer.map(|addr| addr.ip())
}

/// Middleware storing the caller address as [`ClientIp`].
pub async fn extract_client_ip(mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    if let Some(ip) = client_ip(request.headers(), peer) {
        request.extensions_mut().insert(ClientIp(ip));
    }

    next.run(request).await
}
