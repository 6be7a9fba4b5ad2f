//! Text crossing the native boundary uses the host's legacy byte encoding
//! (GBK on the servers this plugin targets); script space is UTF-8.

use encoding_rs::GBK;

/// Native bytes to UTF-8. Conversion failure yields an empty string rather
/// than replacement characters, so callers never see mojibake.
pub fn to_utf8(bytes: &[u8]) -> String {
    if bytes.is_ascii() {
        // Fast path, and the common case for player names.
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let (text, _, had_errors) = GBK.decode(bytes);
    if had_errors {
        return String::new();
    }
    text.into_owned()
}

/// UTF-8 to native bytes. Unmappable input yields an empty buffer.
pub fn to_native(text: &str) -> Vec<u8> {
    if text.is_ascii() {
        return text.as_bytes().to_vec();
    }
    let (bytes, _, had_errors) = GBK.encode(text);
    if had_errors {
        return Vec::new();
    }
    bytes.into_owned()
}
