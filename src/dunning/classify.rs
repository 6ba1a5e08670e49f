/// How a charge outcome feeds back into retry and lifecycle decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeClass {
    Settled,
    /// Transient failure; the payment stays open and is retried daily.
    Retryable,
    /// Permanent failure; retrying the same instrument cannot succeed.
    Terminal,
}

/// Processor codes worth retrying with the same payment method.
const RETRYABLE_CODES: &[&str] = &[
    "insufficient_funds",
    "card_declined",
    "do_not_honor",
    "try_again_later",
    "issuer_unavailable",
    "processing_error",
    "processor_timeout",
    "processor_unreachable",
];

/// Processor codes where the payment method itself is gone.
const TERMINAL_CODES: &[&str] = &[
    "expired_card",
    "invalid_card",
    "stolen_card",
    "lost_card",
    "account_closed",
    "fraud_suspected",
    "payment_method_revoked",
];

/// key: dunning-classifier -> failure code triage
///
/// Unknown or missing codes on a failed charge are treated as terminal so a
/// processor speaking a newer dialect cannot put a payment into an endless
/// retry loop.
pub fn classify(success: bool, error_code: Option<&str>) -> ChargeClass {
    if success {
        return ChargeClass::Settled;
    }
    let Some(code) = error_code else {
        return ChargeClass::Terminal;
    };
    let normalized = code.trim().to_ascii_lowercase();
    if RETRYABLE_CODES.contains(&normalized.as_str()) {
        return ChargeClass::Retryable;
    }
    if TERMINAL_CODES.contains(&normalized.as_str()) {
        return ChargeClass::Terminal;
    }
    ChargeClass::Terminal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_wins_over_any_code() {
        assert_eq!(classify(true, None), ChargeClass::Settled);
        assert_eq!(classify(true, Some("card_declined")), ChargeClass::Settled);
    }

    #[test]
    fn known_codes_map_to_their_class() {
        assert_eq!(
            classify(false, Some("insufficient_funds")),
            ChargeClass::Retryable
        );
        assert_eq!(
            classify(false, Some("processor_timeout")),
            ChargeClass::Retryable
        );
        assert_eq!(classify(false, Some("expired_card")), ChargeClass::Terminal);
        assert_eq!(
            classify(false, Some("payment_method_revoked")),
            ChargeClass::Terminal
        );
    }

    #[test]
    fn codes_are_matched_case_insensitively() {
        assert_eq!(
            classify(false, Some("  Card_Declined ")),
            ChargeClass::Retryable
        );
        assert_eq!(classify(false, Some("EXPIRED_CARD")), ChargeClass::Terminal);
    }

    #[test]
    fn unknown_and_missing_codes_fail_closed() {
        assert_eq!(classify(false, None), ChargeClass::Terminal);
        assert_eq!(classify(false, Some("")), ChargeClass::Terminal);
        assert_eq!(
            classify(false, Some("some_new_code")),
            ChargeClass::Terminal
        );
    }
}
