use std::collections::HashMap;

use bitcoin::{Address, Network, Script, ScriptBuf, address::NetworkUnchecked};
use config::ConfigError;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Maps a script to a wallet, optionally knowing the script the output actually executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRule {
    pub script_pubkey: ScriptBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<ScriptBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<String>,
}

impl WalletRule {
    pub fn new(script_pubkey: ScriptBuf) -> Self {
        Self {
            script_pubkey,
            redeem_script: None,
            custom_data: None,
        }
    }

    /// Rule for a pay-to-script-hash output of `redeem_script`
    pub fn for_redeem_script(redeem_script: ScriptBuf) -> Self {
        Self {
            script_pubkey: ScriptBuf::new_p2sh(&redeem_script.script_hash()),
            redeem_script: Some(redeem_script),
            custom_data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRuleEntry {
    pub wallet_id: String,
    pub rule: WalletRule,
}

impl WalletRuleEntry {
    pub fn new(wallet_id: impl Into<String>, rule: WalletRule) -> Self {
        Self {
            wallet_id: wallet_id.into(),
            rule,
        }
    }
}

/// Wallet rule as written in the configuration, exactly one of `script`, `address` and
/// `redeem_script` is set
#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub id: String,
    /// Hex encoded script pubkey
    pub script: Option<String>,
    pub address: Option<String>,
    /// Hex encoded redeem script, the rule matches its P2SH output
    pub redeem_script: Option<String>,
    pub custom_data: Option<String>,
}

impl WalletConfig {
    pub fn into_entry(self, network: Network) -> Result<WalletRuleEntry, Error> {
        let invalid =
            |msg: String| Error::Config(ConfigError::Message(format!("wallet {}: {msg}", self.id)));

        let rule = match (&self.script, &self.address, &self.redeem_script) {
            (Some(script), None, None) => WalletRule::new(decode_script(script).map_err(invalid)?),
            (None, Some(address), None) => {
                let address = address
                    .parse::<Address<NetworkUnchecked>>()
                    .and_then(|a| a.require_network(network))
                    .map_err(|e| invalid(format!("invalid address: {e}")))?;

                WalletRule::new(address.script_pubkey())
            }
            (None, None, Some(redeem)) => {
                WalletRule::for_redeem_script(decode_script(redeem).map_err(invalid)?)
            }
            _ => {
                return Err(invalid(
                    "set exactly one of script, address and redeem_script".into(),
                ));
            }
        };

        Ok(WalletRuleEntry::new(
            self.id.clone(),
            WalletRule {
                custom_data: self.custom_data.clone(),
                ..rule
            },
        ))
    }
}

fn decode_script(hex_script: &str) -> Result<ScriptBuf, String> {
    hex::decode(hex_script)
        .map(ScriptBuf::from_bytes)
        .map_err(|e| format!("invalid script hex: {e}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchLocation {
    Input,
    Output,
}

/// Why a wallet-level record includes the input or output at `index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub index: u32,
    pub location: MatchLocation,
    pub rule: WalletRule,
}

/// Resolves a script to every wallet rule matching it
pub trait WalletRules {
    fn rules_for(&self, script: &Script) -> Vec<WalletRuleEntry>;
}

/// Wallet rules indexed by script
#[derive(Debug, Clone, Default)]
pub struct WalletRuleEntryCollection {
    by_script: HashMap<ScriptBuf, Vec<WalletRuleEntry>>,
    len: usize,
}

impl WalletRuleEntryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entry: WalletRuleEntry) {
        self.by_script
            .entry(entry.rule.script_pubkey.clone())
            .or_default()
            .push(entry);

        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl FromIterator<WalletRuleEntry> for WalletRuleEntryCollection {
    fn from_iter<I: IntoIterator<Item = WalletRuleEntry>>(iter: I) -> Self {
        let mut collection = Self::new();

        for entry in iter {
            collection.add(entry);
        }

        collection
    }
}

impl WalletRules for WalletRuleEntryCollection {
    fn rules_for(&self, script: &Script) -> Vec<WalletRuleEntry> {
        self.by_script.get(script).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_found_by_script() {
        let a = ScriptBuf::from_bytes(vec![0x51]);
        let b = ScriptBuf::from_bytes(vec![0x52]);

        let rules: WalletRuleEntryCollection = [
            WalletRuleEntry::new("alice", WalletRule::new(a.clone())),
            WalletRuleEntry::new("bob", WalletRule::new(a.clone())),
            WalletRuleEntry::new("bob", WalletRule::new(b.clone())),
        ]
        .into_iter()
        .collect();

        assert_eq!(rules.len(), 3);
        assert_eq!(rules.rules_for(&a).len(), 2);
        assert_eq!(rules.rules_for(&b)[0].wallet_id, "bob");
        assert!(rules.rules_for(&ScriptBuf::new()).is_empty());
    }

    fn wallet(script: Option<&str>, address: Option<&str>, redeem: Option<&str>) -> WalletConfig {
        WalletConfig {
            id: "treasury".into(),
            script: script.map(String::from),
            address: address.map(String::from),
            redeem_script: redeem.map(String::from),
            custom_data: Some("cold storage".into()),
        }
    }

    #[test]
    fn wallet_configs_become_rules() {
        let entry = wallet(Some("51"), None, None)
            .into_entry(Network::Regtest)
            .unwrap();

        assert_eq!(entry.wallet_id, "treasury");
        assert_eq!(entry.rule.script_pubkey, ScriptBuf::from_bytes(vec![0x51]));
        assert_eq!(entry.rule.custom_data.as_deref(), Some("cold storage"));

        let entry = wallet(None, None, Some("51"))
            .into_entry(Network::Regtest)
            .unwrap();

        assert!(entry.rule.script_pubkey.is_p2sh());

        let entry = wallet(None, Some("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"), None)
            .into_entry(Network::Bitcoin)
            .unwrap();

        assert!(entry.rule.script_pubkey.is_p2pkh());
    }

    #[test]
    fn ambiguous_or_invalid_wallet_configs_are_rejected() {
        assert!(wallet(None, None, None).into_entry(Network::Regtest).is_err());
        assert!(wallet(Some("51"), Some("x"), None).into_entry(Network::Regtest).is_err());
        assert!(wallet(Some("zz"), None, None).into_entry(Network::Regtest).is_err());

        // mainnet address on regtest
        assert!(
            wallet(None, Some("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2"), None)
                .into_entry(Network::Regtest)
                .is_err()
        );
    }

    #[test]
    fn redeem_rule_targets_p2sh() {
        let redeem = ScriptBuf::from_bytes(vec![0x51]);
        let rule = WalletRule::for_redeem_script(redeem.clone());

        assert!(rule.script_pubkey.is_p2sh());
        assert_eq!(rule.redeem_script, Some(redeem));
    }
}
