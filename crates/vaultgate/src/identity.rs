use crate::token::SubjectDecoder;
use std::net::IpAddr;
use std::sync::Arc;

/// Shared key for traffic that carries no usable identity signal.
pub const ANONYMOUS: &str = "anonymous";

/// The identity-bearing parts of an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Raw `X-Forwarded-For` header value.
    pub forwarded_for: Option<String>,
    /// Address of the directly connected peer.
    pub peer_addr: Option<IpAddr>,
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forwarded_for(mut self, value: impl Into<String>) -> Self {
        self.forwarded_for = Some(value.into());
        self
    }

    pub fn with_peer_addr(mut self, addr: IpAddr) -> Self {
        self.peer_addr = Some(addr);
        self
    }

    pub fn with_authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }
}

type Resolver = fn(&ClientIdentifier, &RequestInfo) -> Option<String>;

/// Resolves a request to the key of the bucket that governs it.
///
/// Signals are tried in order, the first non-blank one wins:
/// forwarded client address, peer address, bearer subject, then [`ANONYMOUS`].
///
/// `X-Forwarded-For` is caller-controlled unless a reverse proxy overwrites it.
/// Deployments without such a proxy should disable `trust_forwarded`.
#[derive(Clone)]
pub struct ClientIdentifier {
    trust_forwarded: bool,
    decoder: Option<Arc<dyn SubjectDecoder>>,
}

impl ClientIdentifier {
    const CHAIN: [Resolver; 3] = [
        Self::forwarded_client,
        Self::peer_address,
        Self::bearer_subject,
    ];

    pub fn new(trust_forwarded: bool, decoder: Option<Arc<dyn SubjectDecoder>>) -> Self {
        Self {
            trust_forwarded,
            decoder,
        }
    }

    /// Never fails and never returns an empty key.
    pub fn resolve(&self, req: &RequestInfo) -> String {
        Self::CHAIN
            .iter()
            .find_map(|step| step(self, req).filter(|key| !key.trim().is_empty()))
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Best-effort network address for audit records.
    pub fn client_address(&self, req: &RequestInfo) -> String {
        self.forwarded_client(req)
            .or_else(|| self.peer_address(req))
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn forwarded_client(&self, req: &RequestInfo) -> Option<String> {
        if !self.trust_forwarded {
            return None;
        }
        let first = req.forwarded_for.as_deref()?.split(',').next()?.trim();
        (!first.is_empty()).then(|| first.to_string())
    }

    fn peer_address(&self, req: &RequestInfo) -> Option<String> {
        req.peer_addr.map(|ip| ip.to_string())
    }

    fn bearer_subject(&self, req: &RequestInfo) -> Option<String> {
        let decoder = self.decoder.as_ref()?;
        let token = bearer_token(req.authorization.as_deref()?)?;
        match decoder.subject(token) {
            Ok(subject) => Some(subject),
            Err(e) => {
                tracing::debug!(error = %e, "ignoring unusable bearer credential");
                None
            }
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}
