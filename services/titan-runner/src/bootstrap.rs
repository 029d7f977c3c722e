//! Session bootstrapper
//!
//! live endpoint → authenticate → register device → persist credentials.
//! If authentication or registration fails and the pool has another
//! entry, the account rotates once and the whole sequence is retried.

use titan_api::{Registration, StoredAccount, register_device};
use tracing::{info, warn};

use crate::account::{Account, Shared};
use crate::error::AccountError;

/// Leave `account` authenticated and registered against a live endpoint.
pub async fn bootstrap(account: &mut Account, shared: &Shared) -> Result<(), AccountError> {
    let mut rotated = false;
    loop {
        let endpoint = shared
            .strategy
            .ensure_live(&mut account.pool, &shared.prober, &account.device)
            .await?;
        account
            .credentials
            .client_mut()
            .set_base(endpoint.api().clone());
        info!(
            account = %account.label,
            endpoint = %endpoint,
            strategy = shared.strategy.label(),
            "endpoint selected"
        );

        match authenticate_and_register(account).await {
            Ok(()) => break,
            Err(e) if !rotated && account.pool.has_alternatives() => {
                warn!(account = %account.label, endpoint = %endpoint, error = %e, "bootstrap failed, rotating endpoint");
                account.pool.advance();
                rotated = true;
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(store) = &shared.store {
        let snapshot = StoredAccount::from_manager(&account.credentials);
        if let Err(e) = store.record(&account.label, snapshot).await {
            warn!(account = %account.label, error = %e, "failed to persist credentials");
        }
    }
    Ok(())
}

async fn authenticate_and_register(account: &mut Account) -> Result<(), AccountError> {
    account
        .credentials
        .authenticate()
        .await
        .map_err(|e| AccountError::BootstrapFailed(e.to_string()))?;

    match register_device(account.credentials.client(), &account.device).await {
        Ok(Registration::Registered { initial_points }) => {
            info!(account = %account.label, points = %initial_points, "initial point balance");
            Ok(())
        }
        Ok(Registration::Rejected(e)) => {
            // Already-registered devices land here
            warn!(account = %account.label, error = %e, "registration rejected, continuing");
            Ok(())
        }
        Err(e) => Err(AccountError::BootstrapFailed(format!(
            "device registration failed: {e}"
        ))),
    }
}
