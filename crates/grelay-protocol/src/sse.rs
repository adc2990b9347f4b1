//! Decoder for the CodeAssist streaming body: newline-framed `data: <json>`
//! lines rather than strict SSE. Bytes are buffered so a JSON frame split
//! across two network reads (including inside a multi-byte character)
//! reassembles correctly.

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct DataFrameDecoder {
    buffer: Vec<u8>,
}

impl DataFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk, returning every complete `data:` payload.
    pub fn push(&mut self, chunk: &Bytes) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = decode_line(&line[..line.len() - 1]) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(mut line: &[u8]) -> Option<String> {
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    let text = String::from_utf8_lossy(line);
    let payload = text.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    Some(payload.to_string())
}
