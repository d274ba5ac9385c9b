//! Chunk framing for live log subscribers
//!
//! Each record becomes `<HEX-LEN>\r\n<json>\r\n\r\n`, where HEX-LEN is the
//! upper-case hex length of `<json>\r\n`. A stream of frames is therefore a
//! valid HTTP/1.1 chunked body.

use crate::models::LogRecord;

/// Encode one record as a chunk
pub fn encode_chunk(record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(record)?;
    let size = format!("{:X}\r\n", json.len() + 2);

    let mut frame = Vec::with_capacity(size.len() + json.len() + 4);
    frame.extend_from_slice(size.as_bytes());
    frame.extend_from_slice(&json);
    frame.extend_from_slice(b"\r\n\r\n");
    Ok(frame)
}
