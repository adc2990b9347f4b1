use std::time::Instant;

use rand::RngCore;

/// Identity of one in-flight request; created at the HTTP boundary and
/// threaded through the pipeline so every log line can carry its id.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub id: String,
    pub model: String,
    pub stream: bool,
    pub started: Instant,
}

impl RequestEnvelope {
    pub fn new(model: impl Into<String>, stream: bool) -> Self {
        RequestEnvelope {
            id: short_id(),
            model: model.into(),
            stream,
            started: Instant::now(),
        }
    }

    pub fn latency_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }
}

/// Eight hex characters, enough to correlate log lines within one process.
pub fn short_id() -> String {
    let mut bytes = [0u8; 4];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_eight_hex_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
