//! Expense approval state machine.
//!
//! Every legal move is a row in [`TRANSITIONS`], keyed by the acting role, the
//! action and the set of statuses it may start from. The functions here are
//! pure: they take the loaded expense plus the people involved and return the
//! next expense together with the notifications that must go out. Persisting
//! the result and delivering the notifications is the caller's job.
use super::error::{ExpenseError, ValidationError};
use super::expense::{Approval, Expense, ExpenseDetails, ExpenseId, ExpenseStatus, Rejection, TimeStamp};
use super::notification::{Notification, NotificationType};
use super::user::{Role, User, UserId};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Approve,
    Reject,
}

/// Relationship the actor must have with the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamCheck {
    /// No relationship needed.
    Anyone,
    /// The submitter must have a manager on file and it must be the actor.
    AssignedManager,
    /// The actor must be the submitter's manager, unless the submitter has none.
    AssignedManagerOrUnassigned,
}

#[derive(Debug)]
pub struct TransitionRule {
    pub role: Role,
    pub action: Action,
    pub from: &'static [ExpenseStatus],
    pub to: ExpenseStatus,
    pub team: TeamCheck,
    // reported when the expense is not in one of the `from` statuses
    pub wrong_status: &'static str,
}

pub static TRANSITIONS: [TransitionRule; 4] = [
    TransitionRule {
        role: Role::Manager,
        action: Action::Approve,
        from: &[ExpenseStatus::Pending],
        to: ExpenseStatus::ApprovedByManager,
        team: TeamCheck::AssignedManager,
        wrong_status: "Only pending expenses can be approved by manager",
    },
    TransitionRule {
        role: Role::Admin,
        action: Action::Approve,
        from: &[ExpenseStatus::ApprovedByManager],
        to: ExpenseStatus::Approved,
        team: TeamCheck::Anyone,
        wrong_status: "Only expenses approved by manager can be approved by admin",
    },
    // a manager may reject an expense from someone with no manager at all,
    // while approving the same expense is refused
    TransitionRule {
        role: Role::Manager,
        action: Action::Reject,
        from: &[ExpenseStatus::Pending],
        to: ExpenseStatus::Rejected,
        team: TeamCheck::AssignedManagerOrUnassigned,
        wrong_status: "Only pending expenses can be rejected by manager",
    },
    TransitionRule {
        role: Role::Admin,
        action: Action::Reject,
        from: &[ExpenseStatus::Pending, ExpenseStatus::ApprovedByManager],
        to: ExpenseStatus::Rejected,
        team: TeamCheck::Anyone,
        wrong_status: "Only pending or manager-approved expenses can be rejected by admin",
    },
];

/// Everyone a transition may need to know about.
#[derive(Debug, Clone, Copy)]
pub struct Participants<'a> {
    pub actor: &'a User,
    pub submitter: &'a User,
    pub company_admins: &'a [User],
}

/// Output of a workflow step: the expense to commit and the notices to send after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub expense: Expense,
    pub notifications: Vec<Notification>,
}

/// Trimmed, non-empty reason attached to a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionReason(String);

impl RejectionReason {
    pub fn parse(reason: &str) -> Result<Self, ValidationError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(ValidationError::EmptyRejectionReason);
        }
        Ok(Self(reason.to_string()))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approve => f.write_str("approve"),
            Self::Reject => f.write_str("reject"),
        }
    }
}

/// Finds the rule that lets `role` perform `action` on an expense in `status`.
///
/// A role with no rule at all for the action is `Forbidden`; a role that has a
/// rule but not from this status is an `InvalidTransition`.
pub fn rule_for(
    role: Role,
    status: ExpenseStatus,
    action: Action,
) -> Result<&'static TransitionRule, ExpenseError> {
    let rule = TRANSITIONS
        .iter()
        .find(|rule| rule.role == role && rule.action == action)
        .ok_or_else(|| ExpenseError::forbidden(format!("Users with role {role} cannot {action} expenses")))?;

    if !rule.from.contains(&status) {
        return Err(ExpenseError::invalid_transition(rule.wrong_status));
    }
    Ok(rule)
}

fn check_team(rule: &TransitionRule, actor: &User, submitter: &User) -> Result<(), ExpenseError> {
    let not_on_team = || {
        ExpenseError::forbidden(format!(
            "You can only {} expenses from your team members",
            rule.action
        ))
    };

    match (rule.team, submitter.manager.as_ref()) {
        (TeamCheck::Anyone, _) => Ok(()),
        (TeamCheck::AssignedManager, None) => Err(ExpenseError::forbidden(
            "This expense was submitted by a user without an assigned manager",
        )),
        (TeamCheck::AssignedManagerOrUnassigned, None) => Ok(()),
        (_, Some(manager)) if *manager == actor.id => Ok(()),
        (_, Some(_)) => Err(not_on_team()),
    }
}

fn admins_of<'a>(
    admins: &'a [User],
    submitter: &'a User,
) -> impl Iterator<Item = &'a User> + 'a {
    admins
        .iter()
        .filter(move |admin| admin.role == Role::Admin && admin.company == submitter.company)
}

/// Creates a pending expense and the notices for the submitter's manager and the company admins.
pub fn submit(
    id: ExpenseId,
    submitter: &User,
    details: ExpenseDetails,
    company_admins: &[User],
    now: TimeStamp<Utc>,
) -> Transition {
    let expense = Expense::new(
        id,
        submitter.company.clone(),
        submitter.id.clone(),
        details,
        now,
    );

    let message = format!(
        "{} submitted an expense of {} {}",
        submitter.full_name(),
        expense.details.currency,
        expense.details.amount
    );
    let notice = |recipient: &UserId| {
        Notification::new(
            recipient.clone(),
            submitter.id.clone(),
            NotificationType::ExpenseSubmitted,
            "New Expense Submitted",
            message.clone(),
            expense.id.clone(),
        )
    };

    let mut notifications: Vec<Notification> = submitter.manager.iter().map(notice).collect();
    notifications.extend(
        admins_of(company_admins, submitter)
            .filter(|admin| admin.id != submitter.id)
            .map(|admin| notice(&admin.id)),
    );

    Transition {
        expense,
        notifications,
    }
}

/// Moves an expense one approval stage forward on behalf of `participants.actor`.
pub fn approve(
    expense: &Expense,
    participants: Participants<'_>,
    now: TimeStamp<Utc>,
) -> Result<Transition, ExpenseError> {
    let Participants {
        actor,
        submitter,
        company_admins,
    } = participants;

    let rule = rule_for(actor.role, expense.status, Action::Approve)?;
    check_team(rule, actor, submitter)?;

    let mut next = advance(expense, rule, now);
    let approval = Approval {
        by: actor.id.clone(),
        at: now,
    };
    let title = &expense.details.title;
    let mut notifications = Vec::new();

    match rule.to {
        ExpenseStatus::ApprovedByManager => {
            next.manager_approval = Some(approval);
            notifications.push(Notification::new(
                submitter.id.clone(),
                actor.id.clone(),
                NotificationType::ExpenseApprovedByManager,
                "Expense Approved by Manager",
                format!(
                    "Your expense \"{title}\" has been approved by your manager. Waiting for admin approval."
                ),
                expense.id.clone(),
            ));
            notifications.extend(admins_of(company_admins, submitter).map(|admin| {
                Notification::new(
                    admin.id.clone(),
                    actor.id.clone(),
                    NotificationType::ExpensePendingAdminApproval,
                    "Expense Pending Admin Approval",
                    format!(
                        "Manager approved expense \"{title}\" from {}. Amount: {} {}",
                        submitter.full_name(),
                        expense.details.currency,
                        expense.details.amount
                    ),
                    expense.id.clone(),
                )
            }));
        }
        _ => {
            next.admin_approval = Some(approval);
            notifications.push(Notification::new(
                submitter.id.clone(),
                actor.id.clone(),
                NotificationType::ExpenseApproved,
                "Expense Fully Approved",
                format!("Your expense \"{title}\" has been fully approved by admin"),
                expense.id.clone(),
            ));
            if let Some(manager_approval) = &expense.manager_approval {
                notifications.push(Notification::new(
                    manager_approval.by.clone(),
                    actor.id.clone(),
                    NotificationType::ExpenseApproved,
                    "Expense Fully Approved",
                    format!("Expense \"{title}\" has been approved by admin"),
                    expense.id.clone(),
                ));
            }
        }
    }

    Ok(Transition {
        expense: next,
        notifications,
    })
}

/// Rejects an expense on behalf of `participants.actor`.
pub fn reject(
    expense: &Expense,
    participants: Participants<'_>,
    reason: &RejectionReason,
    now: TimeStamp<Utc>,
) -> Result<Transition, ExpenseError> {
    let Participants {
        actor, submitter, ..
    } = participants;

    let rule = rule_for(actor.role, expense.status, Action::Reject)?;
    check_team(rule, actor, submitter)?;

    let mut next = advance(expense, rule, now);
    next.rejection = Some(Rejection {
        by: actor.id.clone(),
        at: now,
        reason: reason.as_str().to_string(),
    });

    let title = &expense.details.title;
    let mut notifications = vec![Notification::new(
        submitter.id.clone(),
        actor.id.clone(),
        NotificationType::ExpenseRejected,
        "Expense Rejected",
        format!(
            "Your expense \"{title}\" has been rejected by {}. Reason: {reason}",
            actor.role,
            reason = reason.as_str()
        ),
        expense.id.clone(),
    )];

    // the manager who already signed off hears about the admin overruling them
    if actor.role == Role::Admin {
        if let Some(manager_approval) = &expense.manager_approval {
            notifications.push(Notification::new(
                manager_approval.by.clone(),
                actor.id.clone(),
                NotificationType::ExpenseRejected,
                "Expense Rejected by Admin",
                format!(
                    "Expense \"{title}\" that you approved has been rejected by admin. Reason: {}",
                    reason.as_str()
                ),
                expense.id.clone(),
            ));
        }
    }

    Ok(Transition {
        expense: next,
        notifications,
    })
}

fn advance(expense: &Expense, rule: &TransitionRule, now: TimeStamp<Utc>) -> Expense {
    debug_assert!(expense.status.may_transition_to(rule.to));

    let mut next = expense.clone();
    next.status = rule.to;
    next.updated_at = now;
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expense::{Category, ExpenseDraft};
    use crate::user::CompanyId;
    use rust_decimal::Decimal;

    struct Office {
        alice: User,
        bob: User,
        dave: User,
        carol: User,
        erin: User, // employee without a manager
    }

    fn office() -> Office {
        let company = CompanyId::from("company_acme");
        let person = |id: &str, name: &str, role| {
            User::new(
                UserId::from(id),
                company.clone(),
                name,
                "Example",
                &format!("{name}@example.com"),
                role,
            )
        };

        Office {
            alice: person("user_alice", "Alice", Role::Employee).with_manager(UserId::from("user_bob")),
            bob: person("user_bob", "Bob", Role::Manager),
            dave: person("user_dave", "Dave", Role::Manager),
            carol: person("user_carol", "Carol", Role::Admin),
            erin: person("user_erin", "Erin", Role::Employee),
        }
    }

    fn submitted_by(submitter: &User, admins: &[User]) -> Transition {
        let details = ExpenseDraft::new()
            .set_title("Taxi")
            .set_amount(Decimal::new(50, 0))
            .set_currency("USD")
            .set_category(Category::Transportation)
            .set_date(TimeStamp::new())
            .validate_and_finalise()
            .unwrap();

        submit(
            ExpenseId::from("expense_taxi"),
            submitter,
            details,
            admins,
            TimeStamp::new(),
        )
    }

    fn by<'a>(actor: &'a User, submitter: &'a User, admins: &'a [User]) -> Participants<'a> {
        Participants {
            actor,
            submitter,
            company_admins: admins,
        }
    }

    #[test]
    fn every_rule_follows_the_status_graph() {
        for rule in &TRANSITIONS {
            for from in rule.from {
                assert!(from.may_transition_to(rule.to), "{:?}", rule);
            }
        }
    }

    #[test]
    fn employees_have_no_rules() {
        for status in [ExpenseStatus::Pending, ExpenseStatus::ApprovedByManager] {
            for action in [Action::Approve, Action::Reject] {
                assert!(matches!(
                    rule_for(Role::Employee, status, action),
                    Err(ExpenseError::Forbidden(_))
                ));
            }
        }
    }

    #[test]
    fn rule_lookup_distinguishes_wrong_status() {
        let err = rule_for(Role::Admin, ExpenseStatus::Pending, Action::Approve).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Only expenses approved by manager can be approved by admin"
        );
        assert!(rule_for(Role::Admin, ExpenseStatus::Pending, Action::Reject).is_ok());
        assert!(matches!(
            rule_for(Role::Manager, ExpenseStatus::ApprovedByManager, Action::Reject),
            Err(ExpenseError::InvalidTransition(_))
        ));
        assert!(matches!(
            rule_for(Role::Admin, ExpenseStatus::Rejected, Action::Reject),
            Err(ExpenseError::InvalidTransition(_))
        ));
    }

    #[test]
    fn submission_notifies_manager_and_admins() {
        let o = office();
        let admins = vec![o.carol.clone()];
        let t = submitted_by(&o.alice, &admins);

        assert_eq!(t.expense.status(), ExpenseStatus::Pending);
        let recipients: Vec<_> = t.notifications.iter().map(|n| n.recipient.clone()).collect();
        assert_eq!(recipients, vec![o.bob.id.clone(), o.carol.id.clone()]);
        assert!(t
            .notifications
            .iter()
            .all(|n| n.kind == NotificationType::ExpenseSubmitted));
        assert_eq!(
            t.notifications[0].message,
            "Alice Example submitted an expense of USD 50"
        );
    }

    #[test]
    fn admin_submitting_does_not_notify_themselves() {
        let o = office();
        let admins = vec![o.carol.clone()];
        let t = submitted_by(&o.carol, &admins);
        assert!(t.notifications.is_empty());
    }

    #[test]
    fn two_stage_approval() {
        let o = office();
        let admins = vec![o.carol.clone()];
        let pending = submitted_by(&o.alice, &admins).expense;

        let stage_one = approve(&pending, by(&o.bob, &o.alice, &admins), TimeStamp::new()).unwrap();
        let expense = &stage_one.expense;
        assert_eq!(expense.status(), ExpenseStatus::ApprovedByManager);
        assert_eq!(expense.manager_approval().unwrap().by, o.bob.id);
        assert!(expense.approved_by().is_none());
        assert_eq!(
            stage_one
                .notifications
                .iter()
                .map(|n| (n.recipient.clone(), n.kind))
                .collect::<Vec<_>>(),
            vec![
                (o.alice.id.clone(), NotificationType::ExpenseApprovedByManager),
                (o.carol.id.clone(), NotificationType::ExpensePendingAdminApproval),
            ]
        );

        let stage_two = approve(expense, by(&o.carol, &o.alice, &admins), TimeStamp::new()).unwrap();
        let expense = &stage_two.expense;
        assert_eq!(expense.status(), ExpenseStatus::Approved);
        assert_eq!(expense.approved_by(), Some(&o.carol.id));
        assert_eq!(expense.approved_at(), expense.admin_approval().map(|a| a.at));
        assert_eq!(
            stage_two
                .notifications
                .iter()
                .map(|n| n.recipient.clone())
                .collect::<Vec<_>>(),
            vec![o.alice.id.clone(), o.bob.id.clone()]
        );
    }

    #[test]
    fn manager_outside_the_team_is_forbidden() {
        let o = office();
        let pending = submitted_by(&o.alice, &[]).expense;

        let err = approve(&pending, by(&o.dave, &o.alice, &[]), TimeStamp::new()).unwrap_err();
        assert!(matches!(err, ExpenseError::Forbidden(_)));

        let reason = RejectionReason::parse("Not our budget").unwrap();
        let err = reject(&pending, by(&o.dave, &o.alice, &[]), &reason, TimeStamp::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "You can only reject expenses from your team members"
        );
    }

    #[test]
    fn unassigned_submitter_can_be_rejected_but_not_approved() {
        let o = office();
        let pending = submitted_by(&o.erin, &[]).expense;

        let err = approve(&pending, by(&o.dave, &o.erin, &[]), TimeStamp::new()).unwrap_err();
        assert!(matches!(err, ExpenseError::Forbidden(_)));

        let reason = RejectionReason::parse("Missing receipt").unwrap();
        let t = reject(&pending, by(&o.dave, &o.erin, &[]), &reason, TimeStamp::new()).unwrap();
        assert_eq!(t.expense.status(), ExpenseStatus::Rejected);
        assert_eq!(t.expense.rejection().unwrap().by, o.dave.id);
    }

    #[test]
    fn admin_rejection_after_manager_approval_tells_the_manager() {
        let o = office();
        let admins = vec![o.carol.clone()];
        let pending = submitted_by(&o.alice, &admins).expense;
        let approved = approve(&pending, by(&o.bob, &o.alice, &admins), TimeStamp::new())
            .unwrap()
            .expense;

        let reason = RejectionReason::parse("  Over budget ").unwrap();
        let t = reject(&approved, by(&o.carol, &o.alice, &admins), &reason, TimeStamp::new()).unwrap();

        assert_eq!(t.expense.rejection().unwrap().reason, "Over budget");
        // manager approval stays on record
        assert_eq!(t.expense.manager_approval().unwrap().by, o.bob.id);
        assert_eq!(
            t.notifications
                .iter()
                .map(|n| n.recipient.clone())
                .collect::<Vec<_>>(),
            vec![o.alice.id.clone(), o.bob.id.clone()]
        );
        assert_eq!(
            t.notifications[0].message,
            "Your expense \"Taxi\" has been rejected by admin. Reason: Over budget"
        );
    }

    #[test]
    fn rejection_reason_must_have_content() {
        assert_eq!(
            RejectionReason::parse(" \t\n"),
            Err(ValidationError::EmptyRejectionReason)
        );
    }

    #[test]
    fn nothing_leaves_a_terminal_state() {
        let o = office();
        let admins = vec![o.carol.clone()];
        let pending = submitted_by(&o.alice, &admins).expense;
        let reason = RejectionReason::parse("Duplicate").unwrap();
        let rejected = reject(&pending, by(&o.bob, &o.alice, &admins), &reason, TimeStamp::new())
            .unwrap()
            .expense;

        for actor in [&o.bob, &o.carol] {
            assert!(matches!(
                approve(&rejected, by(actor, &o.alice, &admins), TimeStamp::new()),
                Err(ExpenseError::InvalidTransition(_))
            ));
            assert!(matches!(
                reject(&rejected, by(actor, &o.alice, &admins), &reason, TimeStamp::new()),
                Err(ExpenseError::InvalidTransition(_))
            ));
        }
    }
}
