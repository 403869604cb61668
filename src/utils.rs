//! Identifier minting for ledger records

use bech32::Bech32m;
use uuid7::uuid7;

/// Prefix for donation record ids.
pub const DONATION_HRP: &str = "donation_";
/// Prefix for request record ids.
pub const REQUEST_HRP: &str = "request_";
/// Prefix for transaction record ids.
pub const TXN_HRP: &str = "txn_";

// mint a unique uuid7 then encode using bech32 under the given prefix
pub fn mint_id(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}
