use crate::types::{OrderStatus, PaymentStatus};

/// Result of evaluating a payment outcome against an order's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move the order to the given status.
    Apply(OrderStatus),
    /// Nothing to do; the order already reflects this outcome. Redeliveries
    /// and events against terminal orders land here.
    Noop,
    /// The requested transition contradicts the order's state. Retrying the
    /// delivery cannot fix this, so the caller acknowledges it and logs.
    Rejected,
}

impl Transition {
    /// Label used for logging and the `order_transitions_total` metric.
    pub fn metric_result(self) -> &'static str {
        match self {
            Self::Apply(_) => "applied",
            Self::Noop => "noop",
            Self::Rejected => "rejected",
        }
    }
}

/// Pure transition table for the order state machine.
///
/// The allowed graph is `pending -> paid -> preparing -> ready -> delivered`
/// with `cancelled` reachable from any non-terminal state. Payment events
/// drive only the edges below; preparing/ready/delivered are advanced by the
/// merchant dashboard, not by webhooks.
pub fn next_status(current: OrderStatus, payment: PaymentStatus) -> Transition {
    use OrderStatus::*;
    use PaymentStatus as P;

    match (current, payment) {
        // Terminal orders absorb every event.
        (Delivered | Cancelled, _) => Transition::Noop,
        // A payment that has not settled yet changes nothing.
        (_, P::Pending) => Transition::Noop,
        (Pending, P::Approved) => Transition::Apply(Paid),
        // Redelivered approval after the order moved on.
        (Paid | Preparing | Ready, P::Approved) => Transition::Noop,
        (Pending, P::Rejected) => Transition::Apply(Cancelled),
        // A rejection cannot "un-pay" an order that was already settled.
        (Paid | Preparing | Ready, P::Rejected) => Transition::Rejected,
        (Paid | Preparing | Ready, P::Refunded) => Transition::Apply(Cancelled),
        // Refunding a payment that never settled is inconsistent data.
        (Pending, P::Refunded) => Transition::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use OrderStatus::*;
    use PaymentStatus as P;

    #[test]
    fn approved_moves_pending_to_paid() {
        assert_eq!(next_status(Pending, P::Approved), Transition::Apply(Paid));
    }

    #[test]
    fn approved_is_noop_once_settled() {
        for current in [Paid, Preparing, Ready] {
            assert_eq!(next_status(current, P::Approved), Transition::Noop);
        }
    }

    #[test]
    fn rejected_cancels_only_pending_orders() {
        assert_eq!(
            next_status(Pending, P::Rejected),
            Transition::Apply(Cancelled)
        );
        for current in [Paid, Preparing, Ready] {
            assert_eq!(next_status(current, P::Rejected), Transition::Rejected);
        }
    }

    #[test]
    fn refunded_cancels_settled_orders() {
        for current in [Paid, Preparing, Ready] {
            assert_eq!(
                next_status(current, P::Refunded),
                Transition::Apply(Cancelled)
            );
        }
        assert_eq!(next_status(Pending, P::Refunded), Transition::Rejected);
    }

    #[test]
    fn terminal_states_absorb_every_outcome() {
        for current in [Delivered, Cancelled] {
            for payment in [P::Pending, P::Approved, P::Rejected, P::Refunded] {
                assert_eq!(next_status(current, payment), Transition::Noop);
            }
        }
    }

    #[test]
    fn pending_payment_never_moves_an_order() {
        for current in [Pending, Paid, Preparing, Ready, Delivered, Cancelled] {
            assert_eq!(next_status(current, P::Pending), Transition::Noop);
        }
    }

    #[test]
    fn applied_transitions_never_leave_terminal_states() {
        for current in [Pending, Paid, Preparing, Ready, Delivered, Cancelled] {
            for payment in [P::Pending, P::Approved, P::Rejected, P::Refunded] {
                if current.is_terminal() {
                    assert_eq!(next_status(current, payment), Transition::Noop);
                }
            }
        }
    }
}
