//! Shared types for the worker execution kernel.
//!
//! Split out of `worker-kernel` so that both the host-side engine and the
//! per-instance JS runtime glue (`worker-js-runtime`) can agree on wire
//! framing without either depending on the other's internals.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Encode bytes as standard base64, for the chunked-base64 binary-transfer
/// fallback (§6.4) and WebSocket binary frames (§6.5).
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode standard base64, the inverse of [`encode_base64`].
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(input)
}

/// A monotonically increasing id identifying one in-flight invocation's
/// request-state record. Stored on the JS side as its decimal string form
/// under [`GLOBAL_REQUEST_ID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RequestId {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RequestId(s.parse()?))
    }
}

/// The outcome of one outbound fetch, as delivered to the event loop by the
/// goroutine-equivalent (a spawned task) performing the HTTP request.
///
/// The body is pre-encoded as base64 so the event loop can splice the result
/// into JS with a single `eval`, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub fetch_id: u64,
    pub outcome: FetchOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchOutcome {
    Success {
        status: u16,
        status_text: String,
        /// Headers, already lower-cased, as a JSON object string.
        headers_json: String,
        body_b64: String,
        redirected: bool,
        final_url: String,
    },
    Error {
        message: String,
    },
}

/// Whether the runtime's binary-transfer fast path (§6.4) allocates an
/// ordinary `Uint8Array`-backed buffer or a shared one. Either is accepted
/// by the host; the mode only tells JS which allocator to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryTransferMode {
    Ordinary,
    Shared,
}

impl BinaryTransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryTransferMode::Ordinary => "ordinary",
            BinaryTransferMode::Shared => "shared",
        }
    }
}

/// Well-known JS global names used across the host/runtime boundary.
/// Centralized here so a rename can't desync the two sides.
pub mod globals {
    /// String form of the current invocation's [`crate::RequestId`].
    pub const REQUEST_ID: &str = "__request_id";
    /// The handler's immediate return value, before promise resolution.
    pub const CALL_RESULT: &str = "__call_result";
    /// Set once the handler's returned promise settles.
    pub const AWAITED_RESULT: &str = "__awaited_result";
    /// One of `"fulfilled"` / `"rejected"`; unset while still pending.
    pub const AWAITED_STATE: &str = "__awaited_state";
    /// Set to `true` once every `ctx.waitUntil` promise has settled.
    pub const WAIT_UNTIL_DONE: &str = "__wait_until_done";
    /// The array `ctx.waitUntil` pushes its promises onto.
    pub const WAIT_UNTIL_PROMISES: &str = "__wait_until_promises";
    /// Prefix for per-invocation temporary globals scrubbed on pool release.
    pub const TEMP_PREFIX: &str = "__tmp_";
    /// Prefix for binary-transfer scratch globals scrubbed on pool release.
    pub const BINARY_PREFIX: &str = "__bin_";
    /// Raw response body bytes, resolved from an awaited `Response`'s
    /// `arrayBuffer()` once the handler's promise settles (§4.5 step 11).
    pub const RESPONSE_BODY_BYTES: &str = "__bin_response_body";
}

/// The four handler shapes the engine recognizes on a worker module (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Fetch,
    Scheduled,
    Tail,
    Named,
}

impl HandlerKind {
    pub fn export_name(self, custom: Option<&str>) -> &str {
        match self {
            HandlerKind::Fetch => "fetch",
            HandlerKind::Scheduled => "scheduled",
            HandlerKind::Tail => "tail",
            HandlerKind::Named => custom.unwrap_or(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_round_trips_through_string() {
        let id = RequestId(42);
        let s = id.to_string();
        assert_eq!(s, "42");
        assert_eq!(s.parse::<RequestId>().unwrap(), id);
    }

    #[test]
    fn base64_round_trips() {
        let bytes = b"hello worker";
        let encoded = encode_base64(bytes);
        assert_eq!(decode_base64(&encoded).unwrap(), bytes);
    }

    #[test]
    fn binary_transfer_mode_strings() {
        assert_eq!(BinaryTransferMode::Ordinary.as_str(), "ordinary");
        assert_eq!(BinaryTransferMode::Shared.as_str(), "shared");
    }
}
