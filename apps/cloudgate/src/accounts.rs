//! Seeds the default `InMemoryAccountStore` (C1) so the binary is runnable
//! standalone. `spec.md` §1 treats persistence as an external concern; this
//! is the minimal loader a host-less deployment needs, reading the same
//! `Account` shape `cloudgate-core` defines.

use cloudgate_core::{Account, InMemoryAccountStore};

/// Loads accounts from the JSON array at `CLOUDGATE_ACCOUNTS_FILE`, or starts
/// empty when unset — an empty pool simply fails every request at
/// `SelectNext` until accounts are added by whatever owns the store.
pub fn load_accounts_from_env() -> anyhow::Result<InMemoryAccountStore> {
    let Ok(path) = std::env::var("CLOUDGATE_ACCOUNTS_FILE") else {
        return Ok(InMemoryAccountStore::default());
    };
    let raw = std::fs::read_to_string(&path)
        .map_err(|err| anyhow::anyhow!("failed to read {path}: {err}"))?;
    let accounts: Vec<Account> = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("failed to parse {path} as a JSON account array: {err}"))?;
    tracing::info!(count = accounts.len(), path, "loaded accounts");
    Ok(InMemoryAccountStore::new(accounts))
}
