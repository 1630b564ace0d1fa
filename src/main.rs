use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use expense_approval::config::{AppConfig, LogFormat};
use expense_approval::currency::CurrencyTable;
use expense_approval::error::ExpenseError;
use expense_approval::expense::{
    Category, CurrencyCode, Expense, ExpenseDraft, ExpenseId, ExpenseStatus, Receipt, TimeStamp,
};
use expense_approval::policy::{DateRange, ExpenseFilter};
use expense_approval::service::ExpenseService;
use expense_approval::user::{CompanyId, Role, User, UserId};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "expense-approval",
    about = "Two-stage expense approval: employees submit, managers then admins approve",
    after_help = "Examples:\n  expense-approval --as user_1... submit --title Taxi --amount 23.50 --currency EUR --category travel --date 2024-05-02\n  expense-approval --as user_1... approve expense_1..."
)]
struct Cli {
    #[arg(long, global = true, help = "Path to a TOML config file")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Path to the sled database, overrides the config")]
    db: Option<PathBuf>,
    #[arg(long = "as", global = true, help = "Id of the acting user")]
    actor: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct ExpenseFields {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    amount: Option<Decimal>,
    #[arg(long)]
    currency: Option<String>,
    #[arg(long)]
    category: Option<Category>,
    #[arg(long, help = "Expense date as YYYY-MM-DD")]
    date: Option<NaiveDate>,
    #[arg(long)]
    receipt_url: Option<String>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, clap::Args)]
struct Range {
    #[arg(long, help = "Earliest expense date, inclusive")]
    from: Option<NaiveDate>,
    #[arg(long, help = "Latest expense date, inclusive")]
    to: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Register a user in a company")]
    AddUser {
        #[arg(long, help = "Company id; a new company is created when omitted")]
        company: Option<String>,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        role: Role,
        #[arg(long)]
        manager: Option<String>,
        #[arg(long, default_value = "United States")]
        country: String,
        #[arg(long, help = "Defaults to the currency of the country")]
        currency: Option<String>,
    },
    #[command(about = "Submit a new expense")]
    Submit(ExpenseFields),
    #[command(about = "List visible expenses, newest first")]
    List {
        #[arg(long)]
        status: Option<ExpenseStatus>,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        submitter: Option<String>,
        #[command(flatten)]
        range: Range,
        #[arg(long, help = "Show amounts in the acting user's preferred currency")]
        display: bool,
    },
    #[command(about = "Show a single expense")]
    Show { id: String },
    #[command(about = "Change fields of one of your pending expenses")]
    Update {
        id: String,
        #[command(flatten)]
        fields: ExpenseFields,
    },
    #[command(about = "Delete one of your pending expenses")]
    Delete { id: String },
    #[command(about = "Approve an expense")]
    Approve { id: String },
    #[command(about = "Reject an expense")]
    Reject {
        id: String,
        #[arg(long)]
        reason: String,
    },
    #[command(about = "Totals by status, category and month")]
    Stats {
        #[command(flatten)]
        range: Range,
    },
    #[command(about = "Total of the visible expenses in your preferred currency")]
    Total {
        #[arg(long)]
        status: Option<ExpenseStatus>,
        #[command(flatten)]
        range: Range,
    },
    #[command(about = "Number of pending expenses waiting on you")]
    PendingCount,
    #[command(about = "Manager-approved expenses waiting for an admin")]
    ApprovalQueue,
    #[command(about = "Spending overview for your team")]
    Analytics {
        #[command(flatten)]
        range: Range,
    },
    #[command(about = "Show your notifications")]
    Notifications {
        #[arg(long)]
        unread: bool,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    #[command(about = "Mark one notification, or all of them, as read")]
    ReadNotifications {
        #[arg(long, help = "Notification id; marks everything read when omitted")]
        id: Option<String>,
    },
    #[command(about = "Delete one of your notifications")]
    DeleteNotification { id: String },
    #[command(about = "Number of unread notifications")]
    UnreadCount,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(db) = &cli.db {
                config.database.path = db.clone();
            }
            config
        }
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&config);

    match run(cli, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ExpenseError>() {
                Some(expense_err) => eprintln!("{}: {expense_err}", expense_err.kind()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run(cli: Cli, config: &AppConfig) -> anyhow::Result<()> {
    let db = Arc::new(sled::open(&config.database.path)?);
    let service = ExpenseService::new(db)?.with_converter(Arc::new(config.converter()?));
    let currencies = config.currency_table()?;

    let actor = || -> anyhow::Result<User> {
        let id = cli
            .actor
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("this command needs the acting user, pass --as <user id>"))?;
        Ok(service.actor(&UserId::from(id))?)
    };

    match cli.command {
        Command::AddUser {
            company,
            first_name,
            last_name,
            email,
            role,
            manager,
            country,
            currency,
        } => {
            let company = match company {
                Some(company) => CompanyId::from(company.as_str()),
                None => CompanyId::generate()?,
            };
            let currency = preferred_currency(&currencies, &country, currency.as_deref())?;
            let mut user = User::new(UserId::generate()?, company, &first_name, &last_name, &email, role)
                .with_country(&country)
                .with_preferred_currency(currency);
            if let Some(manager) = manager {
                user = user.with_manager(UserId::from(manager.as_str()));
            }
            service.register_user(&user)?;
            println!("{} {} ({}, {})", user.id, user.full_name(), user.role, user.company);
        }
        Command::Submit(fields) => {
            let transition = service.submit_expense(&actor()?, &fields.into_draft()?)?;
            print_expense(&transition.expense);
            println!("{} notification(s) sent", transition.notifications.len());
        }
        Command::List {
            status,
            category,
            submitter,
            range,
            display,
        } => {
            let mut filter = ExpenseFilter::new().set_range(range.into_range()?);
            if let Some(status) = status {
                filter = filter.set_status(status);
            }
            if let Some(category) = category {
                filter = filter.set_category(category);
            }
            if let Some(submitter) = submitter {
                filter = filter.set_submitter(UserId::from(submitter.as_str()));
            }

            let actor = actor()?;
            if display {
                for shown in service.list_expenses_for_display(&actor, filter)? {
                    let note = shown.conversion_error.map(|e| format!(" ({e})")).unwrap_or_default();
                    println!(
                        "{}  {:<20} {} {}  {}{note}",
                        shown.expense.id,
                        shown.expense.details.title,
                        shown.display_currency,
                        shown.display_amount.round_dp(2),
                        shown.expense.status()
                    );
                }
            } else {
                for expense in service.list_expenses(&actor, filter)? {
                    print_expense(&expense);
                }
            }
        }
        Command::Show { id } => {
            let expense = service.get_expense(&actor()?, &ExpenseId::from(id.as_str()))?;
            print_expense(&expense);
            if let Some(approval) = expense.manager_approval() {
                println!("  manager approval: {} at {}", approval.by, approval.at);
            }
            if let Some(approval) = expense.admin_approval() {
                println!("  admin approval:   {} at {}", approval.by, approval.at);
            }
            if let Some(rejection) = expense.rejection() {
                println!("  rejected by {} at {}: {}", rejection.by, rejection.at, rejection.reason);
            }
        }
        Command::Update { id, fields } => {
            let changes = fields.into_draft()?;
            let expense = service.update_expense(&actor()?, &ExpenseId::from(id.as_str()), &changes)?;
            print_expense(&expense);
        }
        Command::Delete { id } => {
            service.delete_expense(&actor()?, &ExpenseId::from(id.as_str()))?;
            println!("deleted {id}");
        }
        Command::Approve { id } => {
            let transition = service.approve_expense(&actor()?, &ExpenseId::from(id.as_str()))?;
            print_expense(&transition.expense);
        }
        Command::Reject { id, reason } => {
            let transition = service.reject_expense(&actor()?, &ExpenseId::from(id.as_str()), &reason)?;
            print_expense(&transition.expense);
        }
        Command::Stats { range } => {
            let stats = service.expense_stats(&actor()?, range.into_range()?)?;
            println!("{} expense(s), {} in total", stats.total_count, stats.total_amount);
            for (status, bucket) in &stats.by_status {
                println!("  {status:<20} {:>4}  {}", bucket.count, bucket.total);
            }
            for (category, bucket) in &stats.by_category {
                println!("  {category:<20} {:>4}  {}", bucket.count, bucket.total);
            }
            for (month, bucket) in &stats.monthly {
                println!("  {}-{:02}              {:>4}  {}", month.year, month.month, bucket.count, bucket.total);
            }
        }
        Command::Total { status, range } => {
            let mut filter = ExpenseFilter::new().set_range(range.into_range()?);
            if let Some(status) = status {
                filter = filter.set_status(status);
            }
            let total = service.calculate_total(&actor()?, filter)?;
            println!(
                "{} {} over {} expense(s)",
                total.currency,
                total.total.round_dp(2),
                total.expense_count
            );
            for (currency, sum) in &total.breakdown {
                println!("  {currency} {sum}");
            }
        }
        Command::PendingCount => {
            println!("{}", service.pending_count(&actor()?)?);
        }
        Command::ApprovalQueue => {
            for expense in service.manager_approved_expenses(&actor()?)? {
                print_expense(&expense);
            }
        }
        Command::Analytics { range } => {
            let analytics = service.manager_analytics(&actor()?, range.into_range()?)?;
            println!(
                "this month {} ({}), last month {} ({}), change {}%",
                analytics.current_month.total,
                analytics.current_month.count,
                analytics.previous_month.total,
                analytics.previous_month.count,
                analytics.percentage_change
            );
            println!(
                "team of {}, {} pending, {} expense(s) totalling {}",
                analytics.team_size,
                analytics.pending_count,
                analytics.overall.total_count,
                analytics.overall.total_amount
            );
            if let Some(hours) = analytics.avg_approval_hours {
                println!("average approval time {hours}h");
            }
            for (employee, bucket) in &analytics.top_employees {
                println!("  {employee:<30} {:>4}  {}", bucket.count, bucket.total);
            }
            for (currency, bucket) in &analytics.by_currency {
                println!("  {currency:<30} {:>4}  {}", bucket.count, bucket.total);
            }
            for (reason, count) in &analytics.rejection_reasons {
                println!("  rejected {count:>4}  {reason}");
            }
            for expense in &analytics.recent {
                print_expense(expense);
            }
        }
        Command::Notifications { unread, limit } => {
            for (id, stored) in service.notifications(&actor()?, unread, limit)? {
                let marker = if stored.is_read() { ' ' } else { '*' };
                println!(
                    "{marker} {id}  {}  {}: {}",
                    stored.created_at, stored.notification.title, stored.notification.message
                );
            }
        }
        Command::ReadNotifications { id } => {
            let actor = actor()?;
            match id {
                Some(id) => {
                    service.mark_notification_read(&actor, &id)?;
                    println!("1 notification marked read");
                }
                None => println!(
                    "{} notification(s) marked read",
                    service.mark_all_notifications_read(&actor)?
                ),
            }
        }
        Command::DeleteNotification { id } => {
            service.delete_notification(&actor()?, &id)?;
            println!("notification deleted");
        }
        Command::UnreadCount => {
            println!("{}", service.unread_notification_count(&actor()?)?);
        }
    }
    Ok(())
}

fn preferred_currency(
    currencies: &CurrencyTable,
    country: &str,
    explicit: Option<&str>,
) -> anyhow::Result<CurrencyCode> {
    match explicit {
        Some(code) => Ok(CurrencyCode::parse(code)?),
        None => Ok(currencies.currency_for(country).clone()),
    }
}

fn print_expense(expense: &Expense) {
    println!(
        "{}  {:<20} {} {}  {:<10} {:<20} {}",
        expense.id,
        expense.details.title,
        expense.details.currency,
        expense.details.amount,
        expense.details.date.to_datetime_utc().date_naive(),
        expense.status(),
        expense.submitted_by
    );
}

impl ExpenseFields {
    fn into_draft(self) -> anyhow::Result<ExpenseDraft> {
        let mut draft = ExpenseDraft::new();
        if let Some(title) = self.title {
            draft = draft.set_title(&title);
        }
        if let Some(description) = self.description {
            draft = draft.set_description(&description);
        }
        if let Some(amount) = self.amount {
            draft = draft.set_amount(amount);
        }
        if let Some(currency) = self.currency {
            draft = draft.set_currency(&currency);
        }
        if let Some(category) = self.category {
            draft = draft.set_category(category);
        }
        if let Some(date) = self.date {
            draft = draft.set_date(to_timestamp(date)?);
        }
        if let Some(url) = self.receipt_url {
            draft = draft.set_receipt(Receipt {
                url,
                public_id: None,
            });
        }
        if let Some(notes) = self.notes {
            draft = draft.set_notes(&notes);
        }
        Ok(draft)
    }
}

impl Range {
    fn into_range(self) -> anyhow::Result<DateRange> {
        Ok(DateRange::new(
            self.from.map(to_timestamp).transpose()?,
            self.to.map(to_timestamp).transpose()?,
        ))
    }
}

fn to_timestamp(date: NaiveDate) -> anyhow::Result<TimeStamp<chrono::Utc>> {
    TimeStamp::from_date(date).ok_or_else(|| anyhow::anyhow!("{date} is not a representable date"))
}
