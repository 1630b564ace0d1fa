//! Users as seen by the approval workflow. The workflow only ever reads them.
use super::error::ValidationError;
use super::expense::CurrencyCode;
use super::utils::{COMPANY_HRP, USER_HRP, new_uuid_to_bech32};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct UserId(#[n(0)] String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct CompanyId(#[n(0)] String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum Role {
    #[n(0)]
    Employee,
    #[n(1)]
    Manager,
    #[n(2)]
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct User {
    #[n(0)]
    pub id: UserId,
    #[n(1)]
    pub company: CompanyId,
    #[n(2)]
    pub first_name: String,
    #[n(3)]
    pub last_name: String,
    #[n(4)]
    pub email: String,
    #[n(5)]
    pub role: Role,
    #[n(6)]
    pub manager: Option<UserId>, // only meaningful for employees
    #[n(7)]
    pub country: String,
    #[n(8)]
    pub preferred_currency: CurrencyCode,
}

impl UserId {
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self(new_uuid_to_bech32(USER_HRP)?))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl CompanyId {
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self(new_uuid_to_bech32(COMPANY_HRP)?))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for CompanyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "employee" => Ok(Self::Employee),
            "manager" => Ok(Self::Manager),
            "admin" => Ok(Self::Admin),
            other => Err(ValidationError::UnknownRole(other.to_string())),
        }
    }
}

impl User {
    pub fn new(
        id: UserId,
        company: CompanyId,
        first_name: &str,
        last_name: &str,
        email: &str,
        role: Role,
    ) -> Self {
        Self {
            id,
            company,
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            email: email.trim().to_lowercase(),
            role,
            manager: None,
            country: "United States".to_string(),
            preferred_currency: CurrencyCode::usd(),
        }
    }
    pub fn with_manager(mut self, manager: UserId) -> Self {
        self.manager = Some(manager);
        self
    }
    pub fn with_country(mut self, country: &str) -> Self {
        self.country = country.trim().to_string();
        self
    }
    pub fn with_preferred_currency(mut self, currency: CurrencyCode) -> Self {
        self.preferred_currency = currency;
        self
    }
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
    /// True when `other` reports directly to this user.
    pub fn manages(&self, other: &User) -> bool {
        other.manager.as_ref() == Some(&self.id)
    }
}
