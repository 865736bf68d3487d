//! Reverse-dial registration: an HTTP endpoint that physical workers which can't be provisioned
//! on demand dial into themselves, authenticate via a shared-secret HMAC handshake, and get
//! folded into a [`crate::pool::ReversePool`].

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use log::{info, warn};
use sha3::Sha3_256;
use tokio::net::TcpListener;

use crate::buildlet::HttpWorker;
use crate::pool::ReversePool;

const HEADER_BUILDER_TYPE: &str = "X-Go-Builder-Type";
const HEADER_KEY: &str = "X-Go-Builder-Key";
const HEADER_HOSTNAME: &str = "X-Go-Builder-Hostname";
const HEADER_VERSION: &str = "X-Go-Builder-Version";

#[derive(Clone)]
struct ReverseState {
    pool: Arc<ReversePool>,
    secret: Arc<Vec<u8>>,
}

/// The HMAC subject is the builder type, not the hostname: a worker registering for
/// `linux-amd64` presents the same key regardless of which physical machine it's running on, so
/// the coordinator's secret can be handed out per builder type rather than per machine.
fn check_hmac(secret: &[u8], builder_type: &str, key_hex: &str) -> bool {
    let Ok(given) = hex_decode(key_hex) else {
        return false;
    };
    let mut mac = match Hmac::<Sha3_256>::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(builder_type.as_bytes());
    mac.verify_slice(&given).is_ok()
}

fn hex_decode(s: &str) -> Result<Vec<u8>, ()> {
    if s.len() % 2 != 0 {
        return Err(());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| ()))
        .collect()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compute the registration key a worker should present for a given builder type, under
/// `secret`. Exposed so the fake-worker harness used in integration tests (and any real buildlet
/// client) can compute the same value.
pub fn registration_key(secret: &[u8], builder_type: &str) -> String {
    let mut mac = Hmac::<Sha3_256>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(builder_type.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// A worker registers for one or more builder types at once by repeating the type/key header
/// pair, e.g. two `X-Go-Builder-Type` headers each paired with the `X-Go-Builder-Key` header at
/// the same position. Every pair must authenticate under the configured secret; a single bad
/// pair fails the whole registration rather than silently registering a subset.
async fn handle_register(
    State(state): State<ReverseState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let hostname = match headers.get(HEADER_HOSTNAME).and_then(|v| v.to_str().ok()) {
        Some(h) => h.to_string(),
        None => return (StatusCode::BAD_REQUEST, "missing hostname header").into_response(),
    };
    let version = headers
        .get(HEADER_VERSION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let types: Vec<&str> = headers
        .get_all(HEADER_BUILDER_TYPE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let keys: Vec<&str> = headers
        .get_all(HEADER_KEY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    if types.is_empty() || types.len() != keys.len() {
        return (
            StatusCode::BAD_REQUEST,
            "builder-type and key headers must appear in equal, non-empty numbers",
        )
            .into_response();
    }

    for (builder_type, key) in types.iter().zip(keys.iter()) {
        if !check_hmac(&state.secret, builder_type, key) {
            warn!("reverse-dial handshake failed for {hostname} ({builder_type})");
            return (StatusCode::UNAUTHORIZED, "bad key").into_response();
        }
    }

    let host_types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    info!(
        "worker {hostname} registered as {} (version {version})",
        host_types.join(",")
    );
    // In production the connection would be upgraded (101 Switching Protocols) and kept open as
    // the transport for the wire protocol; here the worker is assumed to expose its own HTTP
    // endpoint that we can reach directly, which is what the coordinator actually needs in order
    // to drive it via `HttpWorker`.
    let client = HttpWorker::new(hostname.clone(), format!("http://{hostname}"));
    state.pool.register(client, host_types);

    (StatusCode::SWITCHING_PROTOCOLS, "registered").into_response()
}

/// Start the reverse-dial listener. Runs until `ct` is canceled.
pub async fn serve(
    addr: &str,
    secret: Vec<u8>,
    pool: Arc<ReversePool>,
    ct: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let state = ReverseState {
        pool,
        secret: Arc::new(secret),
    };
    let app = Router::new()
        .route("/register", post(handle_register))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!("reverse-dial listener on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_key_is_deterministic_and_keyed() {
        let secret = b"s3cr3t".to_vec();
        let k1 = registration_key(&secret, "linux-amd64");
        let k2 = registration_key(&secret, "linux-amd64");
        let k3 = registration_key(&secret, "linux-386");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn check_hmac_round_trips_with_registration_key() {
        let secret = b"s3cr3t".to_vec();
        let key = registration_key(&secret, "linux-amd64");
        assert!(check_hmac(&secret, "linux-amd64", &key));
        assert!(!check_hmac(&secret, "linux-amd64-evil", &key));
        assert!(!check_hmac(b"wrong-secret", "linux-amd64", &key));
    }

    #[tokio::test]
    async fn handle_register_accepts_multiple_builder_types() {
        let secret = b"s3cr3t".to_vec();
        let pool = ReversePool::new();
        let state = ReverseState {
            pool: pool.clone(),
            secret: Arc::new(secret.clone()),
        };

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_HOSTNAME, "worker-1".parse().unwrap());
        headers.insert(HEADER_VERSION, "go1".parse().unwrap());
        headers.append(
            HEADER_BUILDER_TYPE,
            "linux-amd64".parse().unwrap(),
        );
        headers.append(HEADER_BUILDER_TYPE, "linux-386".parse().unwrap());
        headers.append(
            HEADER_KEY,
            registration_key(&secret, "linux-amd64").parse().unwrap(),
        );
        headers.append(
            HEADER_KEY,
            registration_key(&secret, "linux-386").parse().unwrap(),
        );

        let response = handle_register(State(state), headers).await.into_response();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        let counts = pool.host_type_counts();
        assert_eq!(counts.get("linux-amd64"), Some(&1));
        assert_eq!(counts.get("linux-386"), Some(&1));
    }

    #[tokio::test]
    async fn handle_register_rejects_mismatched_key() {
        let secret = b"s3cr3t".to_vec();
        let pool = ReversePool::new();
        let state = ReverseState {
            pool,
            secret: Arc::new(secret.clone()),
        };

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_HOSTNAME, "worker-1".parse().unwrap());
        headers.insert(HEADER_BUILDER_TYPE, "linux-amd64".parse().unwrap());
        headers.insert(HEADER_KEY, registration_key(b"other-secret", "linux-amd64").parse().unwrap());

        let response = handle_register(State(state), headers).await.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
