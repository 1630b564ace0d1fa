//! Smoke screen unit tests for the expense approval components
//!
//! Happy-path checks that span the public API of each module, kept apart from
//! the end to end scenarios.

use chrono::{Datelike, Utc};
use expense_approval::{
    error::{ExpenseError, ValidationError},
    expense::{Category, CurrencyCode, ExpenseDraft, ExpenseStatus, TimeStamp},
    user::Role,
    utils::{EXPENSE_HRP, USER_HRP, new_uuid_to_bech32},
    workflow::{Action, RejectionReason, TRANSITIONS, rule_for},
};
use rust_decimal::Decimal;

// UTILS MODULE TESTS
mod utils_tests {
    use super::*;

    /// Ids carry their human readable prefix and never repeat
    #[test]
    fn ids_are_prefixed_and_unique() {
        let a = new_uuid_to_bech32(EXPENSE_HRP).unwrap();
        let b = new_uuid_to_bech32(EXPENSE_HRP).unwrap();

        assert!(a.starts_with("expense_1"));
        assert_ne!(a, b);
        assert!(new_uuid_to_bech32(USER_HRP).unwrap().starts_with("user_1"));
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}

// EXPENSE MODULE TESTS
mod expense_tests {
    use super::*;

    fn complete() -> ExpenseDraft {
        ExpenseDraft::new()
            .set_title("Conference ticket")
            .set_amount(Decimal::new(39900, 2))
            .set_currency("eur")
            .set_category(Category::Training)
            .set_date(TimeStamp::new_with(2024, 9, 12, 0, 0, 0).unwrap())
    }

    #[test]
    fn complete_draft_finalises() {
        let details = complete().validate_and_finalise().unwrap();

        assert_eq!(details.title, "Conference ticket");
        assert_eq!(details.currency.as_str(), "EUR");
        assert_eq!(details.amount.value(), Decimal::new(39900, 2));
        assert_eq!(details.date.to_datetime_utc().year(), 2024);
        assert_eq!(details.description, None);
    }

    /// Each missing required field is reported by name
    #[test]
    fn missing_fields_are_reported() {
        let blank_title = complete().set_title("   ");
        assert_eq!(
            blank_title.validate_and_finalise(),
            Err(ValidationError::MissingTitle)
        );

        let no_date = ExpenseDraft::new()
            .set_title("Parking")
            .set_amount(Decimal::new(12, 0))
            .set_currency("USD")
            .set_category(Category::Transportation);
        assert_eq!(no_date.validate_and_finalise(), Err(ValidationError::MissingDate));

        assert_eq!(
            ExpenseDraft::new().validate_and_finalise(),
            Err(ValidationError::MissingTitle)
        );

        let negative = complete().set_amount(Decimal::new(-5, 0));
        assert_eq!(
            negative.validate_and_finalise(),
            Err(ValidationError::NegativeAmount)
        );

        // zero is a legitimate amount
        assert!(complete().set_amount(Decimal::ZERO).validate_and_finalise().is_ok());
    }

    #[test]
    fn categories_parse_loosely() {
        assert_eq!("office_supplies".parse::<Category>(), Ok(Category::OfficeSupplies));
        assert_eq!("Office Supplies".parse::<Category>(), Ok(Category::OfficeSupplies));
        assert_eq!(Category::OfficeSupplies.to_string(), "Office Supplies");
        assert!(matches!(
            "yachts".parse::<Category>(),
            Err(ValidationError::UnknownCategory(_))
        ));
    }

    #[test]
    fn currency_codes_are_three_letters() {
        assert_eq!(CurrencyCode::parse(" gbp ").unwrap().as_str(), "GBP");
        assert!(CurrencyCode::parse("POUND").is_err());
        assert!(CurrencyCode::parse("U$D").is_err());
    }

    #[test]
    fn status_graph() {
        use ExpenseStatus::*;

        assert!(Pending.may_transition_to(ApprovedByManager));
        assert!(ApprovedByManager.may_transition_to(Rejected));
        assert!(!Approved.may_transition_to(Pending));
        assert!(!Rejected.may_transition_to(Approved));
        assert!(Rejected.is_terminal() && Reimbursed.is_terminal());
        assert!(Pending.is_editable() && !ApprovedByManager.is_editable());
        assert_eq!("approved_by_manager".parse::<ExpenseStatus>(), Ok(ApprovedByManager));
    }

    #[test]
    fn timestamps_round_trip_through_cbor() {
        let now = TimeStamp::<Utc>::new();
        let cbor = minicbor::to_vec(now).unwrap();
        let back: TimeStamp<Utc> = minicbor::decode(&cbor).unwrap();
        assert_eq!(back, now);
    }
}

// WORKFLOW MODULE TESTS
mod workflow_tests {
    use super::*;

    /// Every rule only ever moves along an edge of the status graph
    #[test]
    fn table_follows_the_status_graph() {
        for rule in &TRANSITIONS {
            for from in rule.from {
                assert!(from.may_transition_to(rule.to), "{from} -> {}", rule.to);
            }
        }
    }

    #[test]
    fn lookups() {
        let rule = rule_for(Role::Manager, ExpenseStatus::Pending, Action::Approve).unwrap();
        assert_eq!(rule.to, ExpenseStatus::ApprovedByManager);

        assert!(matches!(
            rule_for(Role::Employee, ExpenseStatus::Pending, Action::Reject),
            Err(ExpenseError::Forbidden(_))
        ));
        assert!(matches!(
            rule_for(Role::Manager, ExpenseStatus::ApprovedByManager, Action::Approve),
            Err(ExpenseError::InvalidTransition(_))
        ));
    }

    #[test]
    fn rejection_reasons_are_trimmed() {
        assert_eq!(RejectionReason::parse("  Over budget ").unwrap().as_str(), "Over budget");
        assert_eq!(
            RejectionReason::parse(" \t "),
            Err(ValidationError::EmptyRejectionReason)
        );
    }

    #[test]
    fn roles_parse() {
        assert_eq!("Admin".parse::<Role>(), Ok(Role::Admin));
        assert!(matches!(
            "superuser".parse::<Role>(),
            Err(ValidationError::UnknownRole(_))
        ));
    }
}
