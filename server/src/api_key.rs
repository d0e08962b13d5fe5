//! Per-model API keys handed to `llama-server` through `LLAMA_API_KEY`.

use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ServerError, ServerResult};

type HmacSha256 = Hmac<Sha256>;

/// `base64(HMAC-SHA256(key = api_secret, msg = model_id))`
pub fn generate_api_key(model_id: &str, api_secret: &str) -> ServerResult<String> {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .map_err(|e| ServerError::InvalidArgument(format!("Invalid API secret: {}", e)))?;
    mac.update(model_id.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}
