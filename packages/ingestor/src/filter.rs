//! Transaction Message Filtering
//!
//! Classifies incoming SMS bodies as transaction-related using a fixed
//! keyword set. Matching is a case-insensitive substring search.

use std::sync::LazyLock;

/// The 7 keywords that mark a message as transaction-related
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKeyword {
    /// "debited"
    Debited,
    /// "credited"
    Credited,
    /// "spent"
    Spent,
    /// "upi"
    Upi,
    /// "txn"
    Txn,
    /// "transaction"
    Transaction,
    /// "rs." - rupee amount prefix
    Rupees,
}

impl TransactionKeyword {
    /// Returns the lower-case needle searched for in message bodies
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKeyword::Debited => "debited",
            TransactionKeyword::Credited => "credited",
            TransactionKeyword::Spent => "spent",
            TransactionKeyword::Upi => "upi",
            TransactionKeyword::Txn => "txn",
            TransactionKeyword::Transaction => "transaction",
            TransactionKeyword::Rupees => "rs.",
        }
    }
}

/// Keywords in match order
static KEYWORDS: LazyLock<Vec<TransactionKeyword>> = LazyLock::new(|| {
    vec![
        TransactionKeyword::Debited,
        TransactionKeyword::Credited,
        TransactionKeyword::Spent,
        TransactionKeyword::Upi,
        TransactionKeyword::Txn,
        TransactionKeyword::Transaction,
        TransactionKeyword::Rupees,
    ]
});

/// Check if a message body describes a financial transaction
///
/// # Arguments
/// * `text` - The raw SMS body
///
/// # Returns
/// `true` if any keyword occurs anywhere in the lower-cased text
pub fn is_transaction(text: &str) -> bool {
    matched_keyword(text).is_some()
}

/// Get the first keyword found in a message body
///
/// # Arguments
/// * `text` - The raw SMS body
///
/// # Returns
/// `Some(TransactionKeyword)` for the first keyword in match order, `None` otherwise
pub fn matched_keyword(text: &str) -> Option<TransactionKeyword> {
    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();
    KEYWORDS
        .iter()
        .copied()
        .find(|keyword| lowered.contains(keyword.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== is_transaction tests ====================

    #[test]
    fn test_debit_alert_is_transaction() {
        assert!(is_transaction("Rs.500 debited from A/c XX1234 on 12-Jan"));
    }

    #[test]
    fn test_credit_alert_is_transaction() {
        assert!(is_transaction("Your account has been CREDITED with INR 2,000"));
    }

    #[test]
    fn test_card_spend_is_transaction() {
        assert!(is_transaction("You spent 349.00 at SWIGGY using card ending 4321"));
    }

    #[test]
    fn test_upi_reference_is_transaction() {
        assert!(is_transaction("UPI/P2M/401234567890 to merchant@okaxis"));
    }

    #[test]
    fn test_txn_abbreviation_is_transaction() {
        assert!(is_transaction("Txn of INR 120 on HDFC card"));
    }

    #[test]
    fn test_plain_chat_is_not_transaction() {
        assert!(!is_transaction("Meeting at 5pm"));
    }

    #[test]
    fn test_empty_string_is_not_transaction() {
        assert!(!is_transaction(""));
    }

    #[test]
    fn test_rupee_without_dot_is_not_transaction() {
        // "rs" alone is too common ("hrs", "yours") - only "rs." counts
        assert!(!is_transaction("See you in 2 hrs, yours truly"));
    }

    #[test]
    fn test_keyword_inside_word_matches() {
        // substring semantics: "transactions" contains "transaction"
        assert!(is_transaction("Review your recent transactions"));
    }

    // ==================== matched_keyword tests ====================

    #[test]
    fn test_matched_keyword_returns_first_in_order() {
        // both "debited" and "rs." occur, "debited" comes first in match order
        assert_eq!(
            matched_keyword("Rs.500 debited"),
            Some(TransactionKeyword::Debited)
        );
    }

    #[test]
    fn test_matched_keyword_rupees() {
        assert_eq!(
            matched_keyword("Pay RS. 99 now"),
            Some(TransactionKeyword::Rupees)
        );
    }

    #[test]
    fn test_matched_keyword_none() {
        assert_eq!(matched_keyword("Happy birthday!"), None);
    }

    // ==================== TransactionKeyword tests ====================

    #[test]
    fn test_keyword_needles_are_lower_case() {
        for keyword in KEYWORDS.iter() {
            assert_eq!(keyword.as_str(), keyword.as_str().to_lowercase());
        }
    }

    #[test]
    fn test_every_keyword_is_recognized_in_any_case() {
        for keyword in KEYWORDS.iter() {
            let upper = format!("prefix {} suffix", keyword.as_str().to_uppercase());
            assert!(is_transaction(&upper), "{:?} should match", keyword);
            assert_eq!(matched_keyword(keyword.as_str()), Some(*keyword));
        }
    }

    #[test]
    fn test_exactly_seven_keywords() {
        assert_eq!(KEYWORDS.len(), 7);
    }
}
