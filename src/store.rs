//! sled persistence for expenses and the user directory.
//!
//! Expenses are written with compare-and-swap against the exact bytes that
//! were read, so two requests racing on the same expense cannot both commit.
use super::expense::{Expense, ExpenseId};
use super::user::{CompanyId, Role, User, UserId};
use sled::IVec;

#[derive(Clone)]
pub struct ExpenseStore {
    tree: sled::Tree,
}

/// An expense as loaded, together with the stored bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Versioned {
    pub expense: Expense,
    raw: IVec,
}

#[derive(Clone)]
pub struct UserDirectory {
    tree: sled::Tree,
}

impl ExpenseStore {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree("expenses")?,
        })
    }

    /// Stores a brand new expense. Fails if the id is already taken.
    pub fn insert(&self, expense: &Expense) -> anyhow::Result<()> {
        let cbor = minicbor::to_vec(expense)?;
        if self
            .tree
            .compare_and_swap(expense.id.as_str(), None::<&[u8]>, Some(cbor))?
            .is_err()
        {
            anyhow::bail!("expense {} already exists", expense.id);
        }
        tracing::debug!(expense = %expense.id, "expense stored");
        Ok(())
    }

    pub fn load(&self, id: &ExpenseId) -> anyhow::Result<Option<Versioned>> {
        match self.tree.get(id.as_str())? {
            Some(raw) => {
                let expense: Expense = minicbor::decode(&raw)?;
                Ok(Some(Versioned { expense, raw }))
            }
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &ExpenseId) -> anyhow::Result<Option<Expense>> {
        Ok(self.load(id)?.map(|v| v.expense))
    }

    /// Replaces `before` with `after` if nobody changed it in between.
    /// Returns false when the stored record no longer matches `before`.
    pub fn commit(&self, before: &Versioned, after: &Expense) -> anyhow::Result<bool> {
        let cbor = minicbor::to_vec(after)?;
        let swapped = self
            .tree
            .compare_and_swap(after.id.as_str(), Some(&before.raw), Some(cbor))?;

        if swapped.is_err() {
            tracing::warn!(expense = %after.id, "lost a concurrent update, nothing committed");
            return Ok(false);
        }
        tracing::debug!(expense = %after.id, status = %after.status(), "expense committed");
        Ok(true)
    }

    /// Deletes `before` if it is still exactly what is stored.
    pub fn remove(&self, before: &Versioned) -> anyhow::Result<bool> {
        let swapped = self.tree.compare_and_swap(
            before.expense.id.as_str(),
            Some(&before.raw),
            None::<&[u8]>,
        )?;

        if swapped.is_err() {
            tracing::warn!(expense = %before.expense.id, "lost a concurrent update, nothing deleted");
            return Ok(false);
        }
        tracing::debug!(expense = %before.expense.id, "expense deleted");
        Ok(true)
    }

    /// Every stored expense `keep` accepts, newest submission first.
    pub fn scan(&self, mut keep: impl FnMut(&Expense) -> bool) -> anyhow::Result<Vec<Expense>> {
        let mut found = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let expense: Expense = minicbor::decode(&value)?;
            if keep(&expense) {
                found.push(expense);
            }
        }
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(found)
    }
}

impl UserDirectory {
    pub fn open(db: &sled::Db) -> anyhow::Result<Self> {
        Ok(Self {
            tree: db.open_tree("users")?,
        })
    }

    /// Inserts or replaces a user record.
    pub fn upsert(&self, user: &User) -> anyhow::Result<()> {
        self.tree
            .insert(user.id.as_str(), minicbor::to_vec(user)?)?;
        Ok(())
    }

    pub fn get(&self, id: &UserId) -> anyhow::Result<Option<User>> {
        match self.tree.get(id.as_str())? {
            Some(raw) => Ok(Some(minicbor::decode(&raw)?)),
            None => Ok(None),
        }
    }

    fn filter(&self, mut keep: impl FnMut(&User) -> bool) -> anyhow::Result<Vec<User>> {
        let mut found = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let user: User = minicbor::decode(&value)?;
            if keep(&user) {
                found.push(user);
            }
        }
        Ok(found)
    }

    /// Users whose manager is `manager`.
    pub fn reports_of(&self, manager: &UserId) -> anyhow::Result<Vec<User>> {
        self.filter(|user| user.manager.as_ref() == Some(manager))
    }

    pub fn members_of(&self, company: &CompanyId) -> anyhow::Result<Vec<User>> {
        self.filter(|user| user.company == *company)
    }

    pub fn admins_of(&self, company: &CompanyId) -> anyhow::Result<Vec<User>> {
        self.filter(|user| user.role == Role::Admin && user.company == *company)
    }
}
