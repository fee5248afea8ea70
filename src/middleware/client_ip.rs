use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, Request},
    middleware::Next,
    response::Response,
};

/// Address the request is attributed to for rate limiting and audit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

impl ClientIp {
    /// First non-empty of `X-Forwarded-For[0]`, `X-Real-IP`, the peer address.
    pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());

        let ip = forwarded
            .or(real_ip)
            .map(str::to_string)
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        ClientIp(ip)
    }
}

pub async fn client_ip(mut req: Request<Body>, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let ip = ClientIp::resolve(req.headers(), peer);
    tracing::trace!(ip = %ip.0, "client ip resolved");
    req.extensions_mut().insert(ip);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwarded_for_wins() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 172.16.0.2"));
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.1"));
        let peer = Some("127.0.0.1:5000".parse().unwrap());
        assert_eq!(ClientIp::resolve(&headers, peer).0, "10.0.0.1");
    }

    #[test]
    fn falls_back_to_real_ip_then_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(" "));
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.1"));
        assert_eq!(ClientIp::resolve(&headers, None).0, "192.168.1.1");

        let peer = Some("127.0.0.1:5000".parse().unwrap());
        assert_eq!(ClientIp::resolve(&HeaderMap::new(), peer).0, "127.0.0.1");
        assert_eq!(ClientIp::resolve(&HeaderMap::new(), None).0, "unknown");
    }
}
