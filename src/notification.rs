//! Notification events emitted by the workflow and the inbox they are delivered into
use super::error::ExpenseError;
use super::expense::{ExpenseId, TimeStamp};
use super::user::UserId;
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum NotificationType {
    #[n(0)]
    ExpenseSubmitted,
    #[n(1)]
    ExpenseApprovedByManager,
    #[n(2)]
    ExpensePendingAdminApproval,
    #[n(3)]
    ExpenseApproved,
    #[n(4)]
    ExpenseRejected,
}

/// A notice the workflow wants delivered. Produced as data, never sent by the workflow itself.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Notification {
    #[n(0)]
    pub recipient: UserId,
    #[n(1)]
    pub sender: UserId,
    #[n(2)]
    pub kind: NotificationType,
    #[n(3)]
    pub title: String,
    #[n(4)]
    pub message: String,
    #[n(5)]
    pub related_expense: ExpenseId,
}

// what the inbox keeps for each delivered notification
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct StoredNotification {
    #[n(0)]
    pub notification: Notification,
    #[n(1)]
    pub created_at: TimeStamp<Utc>,
    #[n(2)]
    pub read_at: Option<TimeStamp<Utc>>,
}

/// Somewhere notifications can be delivered to. Delivery is best effort.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpenseSubmitted => "expense_submitted",
            Self::ExpenseApprovedByManager => "expense_approved_by_manager",
            Self::ExpensePendingAdminApproval => "expense_pending_admin_approval",
            Self::ExpenseApproved => "expense_approved",
            Self::ExpenseRejected => "expense_rejected",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Notification {
    pub fn new(
        recipient: UserId,
        sender: UserId,
        kind: NotificationType,
        title: &str,
        message: String,
        related_expense: ExpenseId,
    ) -> Self {
        Self {
            recipient,
            sender,
            kind,
            title: title.to_string(),
            message,
            related_expense,
        }
    }
}

impl StoredNotification {
    pub fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

/// Hands every notification to the sink. Failures are logged and dropped so that
/// an already committed transition is never undone by a delivery problem.
pub fn dispatch(sink: &dyn NotificationSink, notifications: &[Notification]) -> usize {
    let mut delivered = 0;
    for notification in notifications {
        match sink.deliver(notification) {
            Ok(()) => delivered += 1,
            Err(err) => tracing::warn!(
                recipient = %notification.recipient,
                kind = %notification.kind,
                expense = %notification.related_expense,
                error = %err,
                "failed to deliver notification"
            ),
        }
    }
    delivered
}

/// sled backed inbox. Keys are `<recipient>/<sha256 of the record and a uuid7>`
/// so a recipient's notifications can be scanned by prefix.
#[derive(Clone)]
pub struct NotificationLog {
    tree: sled::Tree,
}

impl NotificationLog {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree("notifications")?,
        })
    }

    fn key(recipient: &UserId, id: &str) -> String {
        format!("{recipient}/{id}")
    }

    /// Stores a notification, returning its id within the recipient's inbox.
    pub fn record(&self, notification: &Notification) -> anyhow::Result<String> {
        let stored = StoredNotification {
            notification: notification.clone(),
            created_at: TimeStamp::new(),
            read_at: None,
        };
        let cbor = minicbor::to_vec(&stored)?;
        // salted with a uuid7 so identical notices in the same tick get distinct keys
        let mut salted = cbor.clone();
        salted.extend_from_slice(uuid7::uuid7().as_bytes());
        let id = sha256::digest(&salted);

        self.tree
            .insert(Self::key(&notification.recipient, &id).as_bytes(), cbor)?;

        Ok(id)
    }

    /// Newest first. `limit` of zero means no limit.
    pub fn list_for(
        &self,
        recipient: &UserId,
        unread_only: bool,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, StoredNotification)>> {
        let prefix = format!("{recipient}/");
        let mut found = Vec::new();

        for entry in self.tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let stored: StoredNotification = minicbor::decode(&value)?;
            if unread_only && stored.is_read() {
                continue;
            }
            let id = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            found.push((id, stored));
        }

        found.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        if limit > 0 {
            found.truncate(limit);
        }
        Ok(found)
    }

    /// Only the recipient may mark a notification as read; anyone else sees it as missing.
    pub fn mark_read(&self, reader: &UserId, id: &str) -> Result<StoredNotification, ExpenseError> {
        let key = Self::key(reader, id);
        let raw = self
            .tree
            .get(key.as_bytes())
            .map_err(anyhow::Error::from)?
            .ok_or_else(|| ExpenseError::not_found("No notification found with that ID"))?;

        let mut stored: StoredNotification =
            minicbor::decode(&raw).map_err(anyhow::Error::from)?;
        if stored.read_at.is_none() {
            stored.read_at = Some(TimeStamp::new());
            let cbor = minicbor::to_vec(&stored).map_err(anyhow::Error::from)?;
            self.tree
                .insert(key.as_bytes(), cbor)
                .map_err(anyhow::Error::from)?;
        }
        Ok(stored)
    }

    /// Returns how many notifications changed.
    pub fn mark_all_read(&self, reader: &UserId) -> anyhow::Result<usize> {
        let now = TimeStamp::new();
        let mut changed = 0;
        for (id, mut stored) in self.list_for(reader, true, 0)? {
            stored.read_at = Some(now);
            self.tree.insert(
                Self::key(reader, &id).as_bytes(),
                minicbor::to_vec(&stored)?,
            )?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Removes one of the reader's notifications. Other inboxes are invisible to them.
    pub fn delete(&self, reader: &UserId, id: &str) -> Result<(), ExpenseError> {
        self.tree
            .remove(Self::key(reader, id).as_bytes())
            .map_err(anyhow::Error::from)?
            .map(|_| ())
            .ok_or_else(|| ExpenseError::not_found("No notification found with that ID"))
    }

    pub fn unread_count(&self, reader: &UserId) -> anyhow::Result<usize> {
        Ok(self.list_for(reader, true, 0)?.len())
    }
}

impl NotificationSink for NotificationLog {
    fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        self.record(notification).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Flaky {
        fail_for: UserId,
        seen: Mutex<Vec<UserId>>,
    }

    impl NotificationSink for Flaky {
        fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
            if notification.recipient == self.fail_for {
                anyhow::bail!("smtp relay refused connection");
            }
            self.seen.lock().unwrap().push(notification.recipient.clone());
            Ok(())
        }
    }

    fn notice(recipient: &str) -> Notification {
        Notification::new(
            UserId::from(recipient),
            UserId::from("user_sender"),
            NotificationType::ExpenseSubmitted,
            "New Expense Submitted",
            "Alice Smith submitted an expense of USD 50".to_string(),
            ExpenseId::from("expense_1"),
        )
    }

    #[test]
    fn type_strings() {
        assert_eq!(
            NotificationType::ExpensePendingAdminApproval.as_str(),
            "expense_pending_admin_approval"
        );
        assert_eq!(NotificationType::ExpenseRejected.to_string(), "expense_rejected");
    }

    #[test]
    fn dispatch_keeps_going_after_a_failure() {
        let sink = Flaky {
            fail_for: UserId::from("user_b"),
            seen: Mutex::new(vec![]),
        };

        let delivered = dispatch(&sink, &[notice("user_a"), notice("user_b"), notice("user_c")]);

        assert_eq!(delivered, 2);
        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec![UserId::from("user_a"), UserId::from("user_c")]
        );
    }

    #[test]
    fn inbox_is_scoped_to_its_recipient() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = sled::open(dir.path().join("inbox.db"))?;
        let log = NotificationLog::open(&db)?;

        let id = log.record(&notice("user_a"))?;
        log.record(&notice("user_a"))?;
        log.record(&notice("user_b"))?;

        assert_eq!(log.list_for(&UserId::from("user_a"), false, 0)?.len(), 2);
        assert_eq!(log.list_for(&UserId::from("user_a"), false, 1)?.len(), 1);

        // someone else cannot mark it read
        assert!(matches!(
            log.mark_read(&UserId::from("user_b"), &id),
            Err(ExpenseError::NotFound(_))
        ));

        let read = log.mark_read(&UserId::from("user_a"), &id).unwrap();
        assert!(read.is_read());
        assert_eq!(log.list_for(&UserId::from("user_a"), true, 0)?.len(), 1);

        assert_eq!(log.mark_all_read(&UserId::from("user_a"))?, 1);
        assert!(log.list_for(&UserId::from("user_a"), true, 0)?.is_empty());
        Ok(())
    }

    #[test]
    fn identical_notices_are_kept_apart() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = sled::open(dir.path().join("inbox.db"))?;
        let log = NotificationLog::open(&db)?;

        let first = log.record(&notice("user_a"))?;
        let second = log.record(&notice("user_a"))?;

        assert_ne!(first, second);
        assert_eq!(log.list_for(&UserId::from("user_a"), false, 0)?.len(), 2);
        Ok(())
    }

    #[test]
    fn delete_and_unread_count() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let db = sled::open(dir.path().join("inbox.db"))?;
        let log = NotificationLog::open(&db)?;
        let alice = UserId::from("user_a");

        let id = log.record(&notice("user_a"))?;
        let kept = log.record(&notice("user_a"))?;
        assert_eq!(log.unread_count(&alice)?, 2);

        assert!(matches!(
            log.delete(&UserId::from("user_b"), &id),
            Err(ExpenseError::NotFound(_))
        ));
        log.delete(&alice, &id).unwrap();
        assert!(matches!(log.delete(&alice, &id), Err(ExpenseError::NotFound(_))));

        log.mark_read(&alice, &kept).unwrap();
        assert_eq!(log.unread_count(&alice)?, 0);
        assert_eq!(log.list_for(&alice, false, 0)?.len(), 1);
        Ok(())
    }
}
