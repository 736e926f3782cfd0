use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Error type for early data decoding
#[derive(Debug, thiserror::Error)]
pub enum EarlyDataError {
    #[error("invalid base64 in early data header: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Decode the `Sec-WebSocket-Protocol` header into early data bytes.
///
/// The header carries URL-safe base64 without padding; standard-alphabet
/// input is normalized first. A missing or empty header yields an empty
/// buffer. The decoded bytes become the first chunk of the ingress stream,
/// ahead of any WebSocket-delivered data.
pub fn decode(header: Option<&str>) -> Result<Vec<u8>, EarlyDataError> {
    let Some(header) = header else {
        return Ok(Vec::new());
    };
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let normalized = header.replace('+', "-").replace('/', "_").replace('=', "");
    Ok(URL_SAFE_NO_PAD.decode(normalized.as_bytes())?)
}
