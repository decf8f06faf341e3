use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut};
use indexmap::IndexMap;

/// A previous output reference together with the output it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    /// Set when a matching wallet rule knows the script the output actually executes
    pub redeem_script: Option<ScriptBuf>,
}

impl Coin {
    pub fn new(outpoint: OutPoint, txout: TxOut) -> Self {
        Self {
            outpoint,
            txout,
            redeem_script: None,
        }
    }

    pub fn amount(&self) -> Amount {
        self.txout.value
    }

    /// Promote to a redeem-script-aware coin
    pub fn with_redeem_script(mut self, redeem_script: ScriptBuf) -> Self {
        self.redeem_script = Some(redeem_script);
        self
    }
}

/// Coins keyed by outpoint, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinCollection(IndexMap<OutPoint, Coin>);

impl CoinCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless a coin with the same outpoint is already present, returns whether inserted
    pub fn insert(&mut self, coin: Coin) -> bool {
        if self.0.contains_key(&coin.outpoint) {
            return false;
        }

        self.0.insert(coin.outpoint, coin);
        true
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Coin> {
        self.0.get(outpoint)
    }

    pub fn get_mut(&mut self, outpoint: &OutPoint) -> Option<&mut Coin> {
        self.0.get_mut(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.0.contains_key(outpoint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Coin> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> Amount {
        self.iter().map(Coin::amount).sum()
    }
}

impl FromIterator<Coin> for CoinCollection {
    fn from_iter<I: IntoIterator<Item = Coin>>(iter: I) -> Self {
        let mut collection = Self::new();

        for coin in iter {
            collection.insert(coin);
        }

        collection
    }
}

/// State of lazily resolved data on a record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Resolution<T> {
    /// Not yet attempted, or invalidated since
    #[default]
    Unresolved,
    Resolved(T),
    /// Attempted and can never succeed
    Unavailable,
}

impl<T> Resolution<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn resolved(&self) -> Option<&T> {
        match self {
            Self::Resolved(value) => Some(value),
            _ => None,
        }
    }

    pub fn resolved_mut(&mut self) -> Option<&mut T> {
        match self {
            Self::Resolved(value) => Some(value),
            _ => None,
        }
    }
}
