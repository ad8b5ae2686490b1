use std::fmt;

/// Outcome of one outbound send attempt, as reported back by the egress side.
///
/// Values are only produced by [`crate::decode_result`] or [`OutboundResult::new`]
/// and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundResult {
    reference_id: i64,
    status: i32,
    response_content: Option<String>,
}

impl OutboundResult {
    pub fn new(reference_id: i64, status: i32, response_content: Option<String>) -> Self {
        Self {
            reference_id,
            status,
            response_content,
        }
    }

    /// Key of the send-queue entry this result belongs to.
    pub fn reference_id(&self) -> i64 {
        self.reference_id
    }

    /// Status code returned by the messaging API.
    pub fn status(&self) -> i32 {
        self.status
    }

    pub fn response_content(&self) -> Option<&str> {
        self.response_content.as_deref()
    }

    pub fn delivery_state(&self) -> DeliveryState {
        DeliveryState::from_status(self.status)
    }
}

/// Value written to `outbound_send_queue.delivery_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn from_status(status: i32) -> Self {
        if (200..300).contains(&status) {
            DeliveryState::Delivered
        } else {
            DeliveryState::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Delivered => "delivered",
            DeliveryState::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range_maps_to_delivered() {
        assert_eq!(DeliveryState::from_status(200), DeliveryState::Delivered);
        assert_eq!(DeliveryState::from_status(202), DeliveryState::Delivered);
        assert_eq!(DeliveryState::from_status(299), DeliveryState::Delivered);
    }

    #[test]
    fn everything_else_is_failed() {
        for status in [0, 199, 300, 400, 429, 500, -1] {
            assert_eq!(DeliveryState::from_status(status), DeliveryState::Failed);
        }
    }
}
