//! Ordered balance changes: what a transaction changed for a script or a wallet, keyed so that a
//! partition reads back in chain order.

pub mod balance_id;
pub mod change;
pub mod codec;
pub mod coin;
pub mod extract;
pub mod locator;
pub mod repository;
pub mod resolve;
pub mod rules;
pub mod signer;
pub mod view;

pub use balance_id::{BalanceId, MAX_SCRIPT_SIZE};
pub use change::{OrderedBalanceChange, UNCONFIRMED_HEIGHT};
pub use coin::{Coin, CoinCollection, Resolution};
pub use extract::{
    extract_script_balances, extract_script_balances_for, extract_wallet_balances, project_wallets,
};
pub use locator::BalanceLocator;
pub use repository::{
    BalanceRepository, InMemoryTransactionRepository, StoredTransactionRepository,
    TransactionRepository,
};
pub use rules::{
    MatchLocation, MatchedRule, WalletConfig, WalletRule, WalletRuleEntry,
    WalletRuleEntryCollection, WalletRules,
};
pub use view::{BalanceChangeView, BalanceView};
