//! External and internal correlation IDs.
//!
//! The external ID (`x-request-id`) is adopted from the caller when present
//! and minted otherwise. The internal ID (`x-int-request-id`) is minted for
//! every call unconditionally, so a single external ID fanning out over
//! several calls still yields distinct internal ones. Both are published to
//! the call context and the response metadata.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use once_cell::sync::Lazy;
use tonic::Status;

use super::{Call, Interceptor, Next};

pub const HEADER_REQUEST_ID: &str = "x-request-id";
pub const HEADER_INT_REQUEST_ID: &str = "x-int-request-id";

/// Mints a call identifier.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

pub struct RequestIdInterceptor {
    request_id_generator: IdGenerator,
    int_request_id_generator: IdGenerator,
}

impl RequestIdInterceptor {
    pub fn new() -> Self {
        Self {
            request_id_generator: Arc::new(new_call_id),
            int_request_id_generator: Arc::new(new_call_id),
        }
    }

    /// Replaces both generators; useful for deterministic IDs in tests or for
    /// aligning with an external ID scheme.
    pub fn with_generators(request_id: IdGenerator, int_request_id: IdGenerator) -> Self {
        Self {
            request_id_generator: request_id,
            int_request_id_generator: int_request_id,
        }
    }
}

impl Default for RequestIdInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Interceptor for RequestIdInterceptor {
    async fn intercept<'a>(&'a self, call: &'a mut Call, next: Next<'a>) -> Result<(), Status> {
        let request_id = match call.info.header(HEADER_REQUEST_ID) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => (self.request_id_generator)(),
        };
        call.context.set_request_id(request_id.clone());
        call.set_response_header(HEADER_REQUEST_ID, &request_id)?;

        let int_request_id = (self.int_request_id_generator)();
        call.context.set_int_request_id(int_request_id.clone());
        call.set_response_header(HEADER_INT_REQUEST_ID, &int_request_id)?;

        next.run(call).await
    }
}

static ID_COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random()));
static PROCESS_ENTROPY: Lazy<[u8; 5]> = Lazy::new(rand::random);

/// Mints a 20-character, lowercase, time-sortable call identifier: 4 bytes of
/// epoch seconds, 5 random per-process bytes and a 3-byte counter, base32-hex
/// encoded.
pub fn new_call_id() -> String {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut raw = [0u8; 12];
    raw[..4].copy_from_slice(&seconds.to_be_bytes());
    raw[4..9].copy_from_slice(&*PROCESS_ENTROPY);
    raw[9..].copy_from_slice(&count.to_be_bytes()[1..]);
    encode_base32_hex(&raw)
}

fn encode_base32_hex(raw: &[u8; 12]) -> String {
    const ALPHABET: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    let mut acc: u128 = 0;
    for &byte in raw {
        acc = (acc << 8) | u128::from(byte);
    }
    acc <<= 4; // 96 bits of payload padded to 20 five-bit groups
    let mut out = String::with_capacity(20);
    for group in (0..20).rev() {
        let index = ((acc >> (group * 5)) & 0x1f) as usize;
        out.push(ALPHABET[index] as char);
    }
    out
}
