/// Labels attached to every metric a worker records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryLabels {
    pub stage: String,
    pub stream: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl TelemetryLabels {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            stream: None,
            extra: Vec::new(),
        }
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        let mut tags = Vec::with_capacity(2 + self.extra.len());
        tags.push(("stage".into(), self.stage.clone()));
        if let Some(stream) = &self.stream {
            tags.push(("stream".into(), stream.clone()));
        }
        for (key, value) in &self.extra {
            tags.push((key.clone(), value.clone()));
        }
        tags
    }
}
