//! Identifier generation

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique id then encode it using bech32 under the given prefix
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// expenses, users and companies each get their own prefix so ids are never confused
pub const EXPENSE_HRP: &str = "expense_";
pub const USER_HRP: &str = "user_";
pub const COMPANY_HRP: &str = "company_";
