use std::time::Duration;

use crate::{error::Error, ledger::WalletRuleEntryCollection, storage::kv_store::StorageHandler};

use super::{Config, stage};

const DEFAULT_SYNC_STAGE_TIMEOUT_SECS: u64 = 600;

fn gasket_policy(stage_timeout: u64) -> gasket::runtime::Policy {
    let default_retries = gasket::retries::Policy {
        max_retries: 20,
        backoff_unit: Duration::from_secs(1),
        backoff_factor: 2,
        max_backoff: Duration::from_secs(60),
        ..Default::default()
    };

    gasket::runtime::Policy {
        tick_timeout: Duration::from_secs(stage_timeout).into(),
        bootstrap_retry: default_retries.clone(),
        work_retry: default_retries.clone(),
        teardown_retry: default_retries,
    }
}

pub fn pipeline(
    config: Config,
    db: StorageHandler,
    rules: WalletRuleEntryCollection,
) -> Result<gasket::daemon::Daemon, Error> {
    let stage_timeout = config
        .stage_timeout_secs
        .unwrap_or(DEFAULT_SYNC_STAGE_TIMEOUT_SECS);

    let ledger = stage::Stage::new(config, db, rules)?;

    let ledger = gasket::runtime::spawn_stage(ledger, gasket_policy(stage_timeout));

    Ok(gasket::daemon::Daemon::new(vec![ledger]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_back_off_up_to_a_minute() {
        let policy = gasket_policy(30);

        assert_eq!(policy.tick_timeout, Some(Duration::from_secs(30)));
        assert_eq!(policy.work_retry.max_retries, 20);
        assert_eq!(policy.work_retry.max_backoff, Duration::from_secs(60));
    }
}
