//! Service layer API for expense workflow operations
use super::currency::{self, CurrencyConverter, DisplayExpense, StaticRateConverter, Total};
use super::error::{ExpenseError, ValidationError};
use super::expense::{Expense, ExpenseDraft, ExpenseId, ExpenseStatus, TimeStamp};
use super::notification::{self, NotificationLog, NotificationSink, StoredNotification};
use super::policy::{self, DateRange, ExpenseFilter, Modification, NO_SUCH_EXPENSE, Visibility};
use super::stats::{self, ExpenseStats, TeamAnalytics};
use super::store::{ExpenseStore, UserDirectory, Versioned};
use super::user::{Role, User, UserId};
use super::workflow::{self, Participants, RejectionReason, Transition};
use std::collections::HashMap;
use std::sync::Arc;

const CONCURRENT_CHANGE: &str = "Expense was modified by another request, please reload and try again";

pub struct ExpenseService {
    expenses: ExpenseStore,
    users: UserDirectory,
    inbox: NotificationLog,
    sink: Arc<dyn NotificationSink>,
    converter: Arc<dyn CurrencyConverter>,
}

impl ExpenseService {
    /// Opens the service over a sled instance. Notifications go to the sled inbox
    /// and conversions use an empty rate table until configured otherwise.
    pub fn new(instance: Arc<sled::Db>) -> anyhow::Result<Self> {
        let inbox = NotificationLog::open(&instance)?;
        Ok(Self {
            expenses: ExpenseStore::open(&instance)?,
            users: UserDirectory::open(&instance)?,
            sink: Arc::new(inbox.clone()),
            inbox,
            converter: Arc::new(StaticRateConverter::new(
                super::expense::CurrencyCode::usd(),
                HashMap::new(),
            )),
        })
    }

    pub fn with_notification_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn CurrencyConverter>) -> Self {
        self.converter = converter;
        self
    }

    /// Adds or replaces a user. A manager must belong to the same company.
    pub fn register_user(&self, user: &User) -> Result<(), ExpenseError> {
        if let Some(manager) = &user.manager {
            let manager = self.user(manager)?;
            if manager.company != user.company {
                return Err(ExpenseError::not_found(format!(
                    "No user found with ID {}",
                    manager.id
                )));
            }
        }
        self.users.upsert(user)?;
        tracing::info!(user = %user.id, role = %user.role, "user registered");
        Ok(())
    }

    /// Resolves the acting user of a request.
    pub fn actor(&self, id: &UserId) -> Result<User, ExpenseError> {
        self.user(id)
    }

    fn user(&self, id: &UserId) -> Result<User, ExpenseError> {
        self.users
            .get(id)?
            .ok_or_else(|| ExpenseError::not_found(format!("No user found with ID {id}")))
    }

    fn load(&self, id: &ExpenseId) -> Result<Versioned, ExpenseError> {
        self.expenses
            .load(id)?
            .ok_or_else(|| ExpenseError::not_found(NO_SUCH_EXPENSE))
    }

    fn visibility(&self, actor: &User) -> Result<Visibility, ExpenseError> {
        let reports = match actor.role {
            Role::Manager => self.users.reports_of(&actor.id)?,
            _ => Vec::new(),
        };
        Ok(Visibility::for_actor(actor, &reports))
    }

    /// Commits `next` over `before` and only then hands out the notifications.
    fn commit(&self, before: &Versioned, transition: Transition) -> Result<Transition, ExpenseError> {
        if !self.expenses.commit(before, &transition.expense)? {
            return Err(ExpenseError::invalid_transition(CONCURRENT_CHANGE));
        }
        notification::dispatch(self.sink.as_ref(), &transition.notifications);
        Ok(transition)
    }

    /// Submit a new expense; it always starts out pending.
    pub fn submit_expense(
        &self,
        submitter: &User,
        draft: &ExpenseDraft,
    ) -> Result<Transition, ExpenseError> {
        let details = draft.validate_and_finalise()?;
        let admins = self.users.admins_of(&submitter.company)?;

        let transition = workflow::submit(
            ExpenseId::generate()?,
            submitter,
            details,
            &admins,
            TimeStamp::new(),
        );
        self.expenses.insert(&transition.expense)?;
        tracing::info!(
            expense = %transition.expense.id,
            submitter = %submitter.id,
            "expense submitted"
        );

        notification::dispatch(self.sink.as_ref(), &transition.notifications);
        Ok(transition)
    }

    /// Expenses the actor may see, narrowed by `filter`, newest first.
    pub fn list_expenses(
        &self,
        actor: &User,
        filter: ExpenseFilter,
    ) -> Result<Vec<Expense>, ExpenseError> {
        let visibility = self.visibility(actor)?;
        let filter = filter.scoped_for(actor);

        Ok(self
            .expenses
            .scan(|expense| visibility.includes(expense) && filter.matches(expense))?)
    }

    /// Same as [`Self::list_expenses`] with amounts shown in the actor's preferred currency.
    pub fn list_expenses_for_display(
        &self,
        actor: &User,
        filter: ExpenseFilter,
    ) -> Result<Vec<DisplayExpense>, ExpenseError> {
        let expenses = self.list_expenses(actor, filter)?;
        Ok(currency::convert_expenses(
            self.converter.as_ref(),
            expenses,
            &actor.preferred_currency,
        ))
    }

    /// Converted total of the visible expenses, in the actor's preferred currency.
    pub fn calculate_total(
        &self,
        actor: &User,
        filter: ExpenseFilter,
    ) -> Result<Total, ExpenseError> {
        let expenses = self.list_expenses(actor, filter)?;
        Ok(currency::calculate_total(
            self.converter.as_ref(),
            expenses,
            &actor.preferred_currency,
        ))
    }

    pub fn get_expense(&self, actor: &User, id: &ExpenseId) -> Result<Expense, ExpenseError> {
        let expense = self.load(id)?.expense;
        policy::authorize_read(actor, &self.visibility(actor)?, &expense)?;
        Ok(expense)
    }

    /// Applies the fields set on `changes` to one of the actor's own pending expenses.
    pub fn update_expense(
        &self,
        actor: &User,
        id: &ExpenseId,
        changes: &ExpenseDraft,
    ) -> Result<Expense, ExpenseError> {
        if changes.is_empty() {
            return Err(ValidationError::NothingToUpdate.into());
        }
        let before = self.load(id)?;
        policy::authorize_modify(actor, &before.expense, Modification::Update)?;

        let details = changes.merge_into(&before.expense.details)?;
        let mut next = before.expense.clone();
        next.replace_details(details, TimeStamp::new());

        if !self.expenses.commit(&before, &next)? {
            return Err(ExpenseError::invalid_transition(CONCURRENT_CHANGE));
        }
        tracing::info!(expense = %id, "expense updated");
        Ok(next)
    }

    pub fn delete_expense(&self, actor: &User, id: &ExpenseId) -> Result<(), ExpenseError> {
        let before = self.load(id)?;
        policy::authorize_modify(actor, &before.expense, Modification::Delete)?;

        if !self.expenses.remove(&before)? {
            return Err(ExpenseError::invalid_transition(CONCURRENT_CHANGE));
        }
        tracing::info!(expense = %id, "expense deleted");
        Ok(())
    }

    /// Manager approval of a pending expense, or admin approval of a manager-approved one.
    pub fn approve_expense(&self, actor: &User, id: &ExpenseId) -> Result<Transition, ExpenseError> {
        let before = self.load(id)?;
        policy::authorize_transition(actor, &before.expense)?;

        let submitter = self.user(&before.expense.submitted_by)?;
        let admins = self.users.admins_of(&actor.company)?;
        let transition = workflow::approve(
            &before.expense,
            Participants {
                actor,
                submitter: &submitter,
                company_admins: &admins,
            },
            TimeStamp::new(),
        )?;

        let transition = self.commit(&before, transition)?;
        tracing::info!(
            expense = %id,
            actor = %actor.id,
            status = %transition.expense.status(),
            "expense approved"
        );
        Ok(transition)
    }

    /// Rejects an expense. The reason is checked before anything is loaded.
    pub fn reject_expense(
        &self,
        actor: &User,
        id: &ExpenseId,
        reason: &str,
    ) -> Result<Transition, ExpenseError> {
        let reason = RejectionReason::parse(reason)?;

        let before = self.load(id)?;
        policy::authorize_transition(actor, &before.expense)?;

        let submitter = self.user(&before.expense.submitted_by)?;
        let transition = workflow::reject(
            &before.expense,
            Participants {
                actor,
                submitter: &submitter,
                company_admins: &[],
            },
            &reason,
            TimeStamp::new(),
        )?;

        let transition = self.commit(&before, transition)?;
        tracing::info!(expense = %id, actor = %actor.id, "expense rejected");
        Ok(transition)
    }

    /// Figures over everything the actor can see within `range`.
    pub fn expense_stats(&self, actor: &User, range: DateRange) -> Result<ExpenseStats, ExpenseError> {
        let expenses = self.list_expenses(actor, ExpenseFilter::new().set_range(range))?;
        Ok(stats::summarise(&expenses))
    }

    /// Pending expenses waiting on the actor: a manager's team, or the whole company for admins.
    pub fn pending_count(&self, actor: &User) -> Result<usize, ExpenseError> {
        let team = match actor.role {
            Role::Employee => {
                return Err(ExpenseError::forbidden(
                    "You do not have permission to perform this action",
                ));
            }
            Role::Manager => Some(self.users.reports_of(&actor.id)?),
            Role::Admin => None,
        };

        let pending = self.expenses.scan(|expense| {
            expense.company == actor.company
                && expense.status() == ExpenseStatus::Pending
                && team.as_ref().is_none_or(|team| {
                    team.iter().any(|member| member.id == expense.submitted_by)
                })
        })?;
        Ok(pending.len())
    }

    /// Admin work queue: manager-approved expenses, most recently approved first.
    pub fn manager_approved_expenses(&self, actor: &User) -> Result<Vec<Expense>, ExpenseError> {
        if actor.role != Role::Admin {
            return Err(ExpenseError::forbidden(
                "You do not have permission to perform this action",
            ));
        }

        let mut queue = self.expenses.scan(|expense| {
            expense.company == actor.company && expense.status() == ExpenseStatus::ApprovedByManager
        })?;
        queue.sort_by(|a, b| {
            let at = |e: &Expense| e.manager_approval().map(|approval| approval.at);
            at(b).cmp(&at(a))
        });
        Ok(queue)
    }

    /// Team analytics for a manager over their direct reports. Admins get the
    /// same view over everyone else in their company.
    pub fn manager_analytics(
        &self,
        actor: &User,
        range: DateRange,
    ) -> Result<TeamAnalytics, ExpenseError> {
        let team = match actor.role {
            Role::Employee => {
                return Err(ExpenseError::forbidden(
                    "You do not have permission to perform this action",
                ));
            }
            Role::Manager => self.users.reports_of(&actor.id)?,
            Role::Admin => self
                .users
                .members_of(&actor.company)?
                .into_iter()
                .filter(|member| member.id != actor.id)
                .collect(),
        };

        let expenses = self.expenses.scan(|expense| {
            expense.company == actor.company
                && team.iter().any(|member| member.id == expense.submitted_by)
        })?;
        let reviewed = self.expenses.scan(|expense| {
            expense
                .manager_approval()
                .is_some_and(|approval| approval.by == actor.id)
        })?;

        Ok(stats::team_analytics(
            &expenses,
            |expense| range.contains(&expense.details.date),
            team.len(),
            stats::average_approval_hours(&actor.id, &reviewed),
            TimeStamp::new(),
        ))
    }

    /// The actor's notification inbox, newest first. A `limit` of zero returns everything.
    pub fn notifications(
        &self,
        actor: &User,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<(String, StoredNotification)>, ExpenseError> {
        Ok(self.inbox.list_for(&actor.id, unread_only, limit)?)
    }

    pub fn mark_notification_read(
        &self,
        actor: &User,
        notification_id: &str,
    ) -> Result<StoredNotification, ExpenseError> {
        self.inbox.mark_read(&actor.id, notification_id)
    }

    pub fn mark_all_notifications_read(&self, actor: &User) -> Result<usize, ExpenseError> {
        Ok(self.inbox.mark_all_read(&actor.id)?)
    }

    pub fn delete_notification(&self, actor: &User, notification_id: &str) -> Result<(), ExpenseError> {
        self.inbox.delete(&actor.id, notification_id)?;
        tracing::debug!(user = %actor.id, notification = notification_id, "notification deleted");
        Ok(())
    }

    pub fn unread_notification_count(&self, actor: &User) -> Result<usize, ExpenseError> {
        Ok(self.inbox.unread_count(&actor.id)?)
    }
}
