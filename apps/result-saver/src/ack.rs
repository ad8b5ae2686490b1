/// What to tell JetStream about one message once its batch has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Hand the message back for redelivery.
    Nak,
    /// Redeliveries are exhausted: copy to the DLQ, then terminate.
    DeadLetter,
}

/// Decides the fate of every message of a batch.
///
/// A successful batch is acked as a whole. A failed batch is nak'ed as a
/// whole, except for messages that already used their last delivery, which
/// are dead-lettered when a DLQ is available. `max_deliver == 0` means
/// unlimited deliveries.
pub fn plan_acks(
    succeeded: bool,
    deliveries: &[u64],
    max_deliver: u64,
    dead_letter: bool,
) -> Vec<AckDecision> {
    deliveries
        .iter()
        .map(|&delivered| {
            if succeeded {
                AckDecision::Ack
            } else if dead_letter && max_deliver > 0 && delivered >= max_deliver {
                AckDecision::DeadLetter
            } else {
                AckDecision::Nak
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use AckDecision::*;

    #[test]
    fn success_acks_everything() {
        assert_eq!(plan_acks(true, &[1, 5, 9], 5, true), vec![Ack, Ack, Ack]);
    }

    #[test]
    fn failure_naks_whole_batch() {
        assert_eq!(plan_acks(false, &[1, 2, 3], 5, true), vec![Nak, Nak, Nak]);
    }

    #[test]
    fn exhausted_messages_are_dead_lettered() {
        assert_eq!(
            plan_acks(false, &[1, 5, 6], 5, true),
            vec![Nak, DeadLetter, DeadLetter]
        );
    }

    #[test]
    fn without_dlq_exhausted_messages_are_still_nakked() {
        assert_eq!(plan_acks(false, &[5], 5, false), vec![Nak]);
    }

    #[test]
    fn unlimited_deliveries_never_dead_letter() {
        assert_eq!(plan_acks(false, &[1000], 0, true), vec![Nak]);
    }

    #[test]
    fn empty_batch_has_no_decisions() {
        assert!(plan_acks(false, &[], 5, true).is_empty());
    }
}
