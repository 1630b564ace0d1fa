//! Who may see and who may touch which expense.
//!
//! Every check starts from the same two primitives: is the target inside the
//! actor's company, and is the target the actor themself. A company mismatch
//! is always reported as `NotFound` so nothing leaks across tenants.
use super::error::ExpenseError;
use super::expense::{Category, Expense, ExpenseStatus, TimeStamp};
use super::user::{CompanyId, Role, User, UserId};
use chrono::Utc;
use std::collections::HashSet;

pub const NO_SUCH_EXPENSE: &str = "No expense found with that ID";

pub fn same_company(actor: &User, company: &CompanyId) -> bool {
    actor.company == *company
}

pub fn is_self(actor: &User, user: &UserId) -> bool {
    actor.id == *user
}

/// The set of expenses an actor is allowed to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// Employees: only what they submitted themselves.
    Own { company: CompanyId, user: UserId },
    /// Managers: their own expenses plus those of their direct reports.
    Team {
        company: CompanyId,
        submitters: HashSet<UserId>,
    },
    /// Admins: everything in their company.
    Company(CompanyId),
}

impl Visibility {
    /// `reports` are the users whose manager is `actor`; ignored unless the actor is a manager.
    pub fn for_actor(actor: &User, reports: &[User]) -> Self {
        match actor.role {
            Role::Employee => Self::Own {
                company: actor.company.clone(),
                user: actor.id.clone(),
            },
            Role::Manager => {
                let mut submitters: HashSet<UserId> = reports
                    .iter()
                    .filter(|report| actor.manages(report))
                    .map(|report| report.id.clone())
                    .collect();
                submitters.insert(actor.id.clone());
                Self::Team {
                    company: actor.company.clone(),
                    submitters,
                }
            }
            Role::Admin => Self::Company(actor.company.clone()),
        }
    }

    pub fn includes(&self, expense: &Expense) -> bool {
        match self {
            Self::Own { company, user } => {
                expense.company == *company && expense.submitted_by == *user
            }
            Self::Team {
                company,
                submitters,
            } => expense.company == *company && submitters.contains(&expense.submitted_by),
            Self::Company(company) => expense.company == *company,
        }
    }
}

/// Single record read.
pub fn authorize_read(
    actor: &User,
    visibility: &Visibility,
    expense: &Expense,
) -> Result<(), ExpenseError> {
    if !same_company(actor, &expense.company) {
        return Err(ExpenseError::not_found(NO_SUCH_EXPENSE));
    }
    if !visibility.includes(expense) {
        return Err(ExpenseError::forbidden(
            "You do not have permission to access this expense",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    Update,
    Delete,
}

/// Edits and deletes: only the submitter, and only while the expense is pending.
pub fn authorize_modify(
    actor: &User,
    expense: &Expense,
    modification: Modification,
) -> Result<(), ExpenseError> {
    let verb = match modification {
        Modification::Update => "update",
        Modification::Delete => "delete",
    };

    if !same_company(actor, &expense.company) {
        return Err(ExpenseError::not_found(NO_SUCH_EXPENSE));
    }
    if !is_self(actor, &expense.submitted_by) {
        return Err(ExpenseError::forbidden(format!(
            "You can only {verb} your own expenses"
        )));
    }
    if !expense.status().is_editable() {
        return Err(ExpenseError::forbidden(format!(
            "You can only {verb} pending expenses"
        )));
    }
    Ok(())
}

/// Approvals and rejections only need the tenant check here; everything else
/// is decided by the workflow's transition table.
pub fn authorize_transition(actor: &User, expense: &Expense) -> Result<(), ExpenseError> {
    if !same_company(actor, &expense.company) {
        return Err(ExpenseError::not_found(NO_SUCH_EXPENSE));
    }
    Ok(())
}

/// Inclusive range over the expense date. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<TimeStamp<Utc>>,
    pub end: Option<TimeStamp<Utc>>,
}

impl DateRange {
    pub fn new(start: Option<TimeStamp<Utc>>, end: Option<TimeStamp<Utc>>) -> Self {
        Self { start, end }
    }
    pub fn contains(&self, date: &TimeStamp<Utc>) -> bool {
        self.start.is_none_or(|start| *date >= start) && self.end.is_none_or(|end| *date <= end)
    }
}

/// Optional narrowing applied on top of the actor's visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpenseFilter {
    pub status: Option<ExpenseStatus>,
    pub category: Option<Category>,
    pub range: DateRange,
    pub submitter: Option<UserId>,
}

impl ExpenseFilter {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_status(mut self, status: ExpenseStatus) -> Self {
        self.status = Some(status);
        self
    }
    pub fn set_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
    pub fn set_range(mut self, range: DateRange) -> Self {
        self.range = range;
        self
    }
    pub fn set_submitter(mut self, submitter: UserId) -> Self {
        self.submitter = Some(submitter);
        self
    }

    /// Employees can't pick a submitter; their scope already pins it to themselves.
    pub fn scoped_for(mut self, actor: &User) -> Self {
        if actor.role == Role::Employee {
            self.submitter = None;
        }
        self
    }

    pub fn matches(&self, expense: &Expense) -> bool {
        self.status.is_none_or(|status| expense.status() == status)
            && self
                .category
                .is_none_or(|category| expense.details.category == category)
            && self.range.contains(&expense.details.date)
            && self
                .submitter
                .as_ref()
                .is_none_or(|submitter| expense.submitted_by == *submitter)
    }
}
