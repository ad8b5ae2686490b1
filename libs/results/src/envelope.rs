use bytes::Bytes;

/// One queue delivery: an opaque id used for logging plus the raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeRecord {
    id: String,
    body: Bytes,
}

impl EnvelopeRecord {
    pub fn new(id: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when the body is empty or holds only whitespace.
    pub fn is_blank(&self) -> bool {
        match std::str::from_utf8(&self.body) {
            Ok(text) => text.trim().is_empty(),
            Err(_) => false,
        }
    }
}
