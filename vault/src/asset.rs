//! Asset model: the native coin and fungible tokens, their precision and
//! supply metrics, and the registry the vault keeps them in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::Network;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::api::types::AssetRecord;
use crate::errors::{VaultError, VaultResult};

/// Largest supported number of decimal places.
pub const MAX_PRECISION: u8 = 20;

const POW10: [u128; MAX_PRECISION as usize + 1] = [
    1,
    10,
    100,
    1_000,
    10_000,
    100_000,
    1_000_000,
    10_000_000,
    100_000_000,
    1_000_000_000,
    10_000_000_000,
    100_000_000_000,
    1_000_000_000_000,
    10_000_000_000_000,
    100_000_000_000_000,
    1_000_000_000_000_000,
    10_000_000_000_000_000,
    100_000_000_000_000_000,
    1_000_000_000_000_000_000,
    10_000_000_000_000_000_000,
    100_000_000_000_000_000_000,
];

const NATIVE_PRECISION: u8 = 8;
const HALVING_INTERVAL: u64 = 210_000;
const INITIAL_SUBSIDY: u64 = 50 * 100_000_000;

/// Total native supply once every subsidy era has been mined.
pub const MAX_NATIVE_SUPPLY: u64 = 2_099_999_997_690_000;

/// Number of decimal places of an asset, bounded by [`MAX_PRECISION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Precision(u8);

impl Precision {
    pub fn new(decimals: u8) -> VaultResult<Self> {
        if decimals > MAX_PRECISION {
            return Err(VaultError::Validation(format!(
                "Precision {} exceeds the maximum of {}",
                decimals, MAX_PRECISION
            )));
        }
        Ok(Self(decimals))
    }

    pub fn decimals(self) -> u8 {
        self.0
    }

    /// Atoms per whole unit.
    pub fn factor(self) -> u128 {
        POW10[self.0 as usize]
    }

    pub fn amount_from_atoms(self, atoms: u64) -> DecimalAmount {
        DecimalAmount {
            mantissa: atoms as u128,
            scale: self.0,
        }
    }

    /// Rescale to this precision, rounding half away from zero.
    pub fn amount_to_atoms(self, amount: &DecimalAmount) -> VaultResult<u64> {
        let atoms = if amount.scale >= self.0 {
            let divisor = POW10[(amount.scale - self.0) as usize];
            let quotient = amount.mantissa / divisor;
            let remainder = amount.mantissa % divisor;
            if divisor > 1 && remainder >= divisor - remainder {
                quotient + 1
            } else {
                quotient
            }
        } else {
            amount
                .mantissa
                .checked_mul(POW10[(self.0 - amount.scale) as usize])
                .ok_or_else(|| VaultError::Validation("Amount overflow".to_string()))?
        };

        u64::try_from(atoms)
            .map_err(|_| VaultError::Validation(format!("Amount {} is too large", amount)))
    }

    /// Convenience conversion for UI-entered floating point values.
    pub fn atoms_from_f64(self, value: f64) -> Option<u64> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        let scaled = (value * self.factor() as f64).round();
        if scaled > u64::MAX as f64 {
            return None;
        }
        Some(scaled as u64)
    }
}

impl<'de> Deserialize<'de> for Precision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let decimals = u8::deserialize(deserializer)?;
        Precision::new(decimals).map_err(serde::de::Error::custom)
    }
}

/// Exact fixed-point decimal: `mantissa / 10^scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecimalAmount {
    mantissa: u128,
    scale: u8,
}

impl DecimalAmount {
    pub fn new(mantissa: u128, scale: u8) -> VaultResult<Self> {
        Precision::new(scale)?;
        Ok(Self { mantissa, scale })
    }

    pub fn mantissa(&self) -> u128 {
        self.mantissa
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    /// Lossy conversion for display purposes.
    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / POW10[self.scale as usize] as f64
    }
}

impl FromStr for DecimalAmount {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VaultError::Validation("Amount cannot be empty".to_string()));
        }

        let (whole, fraction) = match s.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (s, ""),
        };
        if fraction.len() > MAX_PRECISION as usize {
            return Err(VaultError::Validation(
                "Too many decimal places".to_string(),
            ));
        }
        if whole.is_empty() && fraction.is_empty() {
            return Err(VaultError::Validation("Invalid number format".to_string()));
        }
        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if !all_digits(whole) || !all_digits(fraction) {
            return Err(VaultError::Validation("Invalid number format".to_string()));
        }

        let digits = format!("{}{}", whole, fraction);
        let mantissa = digits
            .trim_start_matches('0')
            .parse::<u128>()
            .or_else(|e| {
                if digits.chars().all(|c| c == '0') {
                    Ok(0)
                } else {
                    Err(e)
                }
            })
            .map_err(|_| VaultError::Validation("Amount overflow".to_string()))?;

        Ok(Self {
            mantissa,
            scale: fraction.len() as u8,
        })
    }
}

impl fmt::Display for DecimalAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factor = POW10[self.scale as usize];
        let whole = self.mantissa / factor;
        let fractional = self.mantissa % factor;

        if fractional == 0 {
            write!(f, "{}", whole)
        } else {
            let digits = format!("{:0width$}", fractional, width = self.scale as usize);
            write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
        }
    }
}

impl Serialize for DecimalAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DecimalAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Supply figures in atoms. `None` means unknown, never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplyMetrics {
    pub known_issued: Option<u64>,
    pub known_burned: Option<u64>,
    pub max_issuable: Option<u64>,
    pub max_unknown: Option<u64>,
    pub known_replaced: Option<u64>,
}

impl SupplyMetrics {
    /// `(known_issued [+ max_unknown]) / max_issuable * 100`, or `None` when
    /// any required figure is unknown.
    pub fn percentage_issued(&self, including_unknown: bool) -> Option<f64> {
        let issued = self.known_issued? as f64;
        let max = self.max_issuable?;
        if max == 0 {
            return None;
        }
        let unknown = if including_unknown {
            self.max_unknown? as f64
        } else {
            0.0
        };
        Some((issued + unknown) / max as f64 * 100.0)
    }
}

/// Issuer and verification metadata of a token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticity {
    pub issuer: Option<String>,
    pub verified: bool,
    pub ricardian_contract: Option<String>,
}

/// Capabilities shared by every asset kind.
pub trait Fungible {
    fn id(&self) -> &str;
    fn ticker(&self) -> &str;
    fn name(&self) -> &str;
    fn precision(&self) -> Precision;
    fn supply(&self) -> &SupplyMetrics;
    fn is_native(&self) -> bool;

    fn amount_from_atoms(&self, atoms: u64) -> DecimalAmount {
        self.precision().amount_from_atoms(atoms)
    }

    fn amount_to_atoms(&self, amount: &DecimalAmount) -> VaultResult<u64> {
        self.precision().amount_to_atoms(amount)
    }

    fn percentage_issued(&self, including_unknown: bool) -> Option<f64> {
        self.supply().percentage_issued(including_unknown)
    }
}

/// Native coin of a network, synthesized locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NativeAsset {
    id: String,
    ticker: String,
    name: String,
    network: Network,
    precision: Precision,
    supply: SupplyMetrics,
}

impl NativeAsset {
    pub fn new(network: Network) -> Self {
        let (ticker, name) = match network {
            Network::Bitcoin => ("BTC", "Bitcoin"),
            _ => ("tBTC", "Test bitcoin"),
        };
        Self {
            id: Self::id_for(network).to_string(),
            ticker: ticker.to_string(),
            name: name.to_string(),
            network,
            precision: Precision(NATIVE_PRECISION),
            supply: SupplyMetrics {
                known_issued: None,
                known_burned: None,
                max_issuable: Some(MAX_NATIVE_SUPPLY),
                max_unknown: Some(0),
                known_replaced: Some(0),
            },
        }
    }

    /// Id under which the remote engine reports native allocations.
    pub fn id_for(network: Network) -> &'static str {
        match network {
            Network::Bitcoin => "btc",
            _ => "tbtc",
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Refresh issuance from the latest known block height.
    pub fn update_from_chain(&mut self, height: Option<u32>) {
        self.supply.known_issued = height.map(issued_at_height);
    }
}

/// Coins created by block subsidies from genesis up to and including `height`.
pub fn issued_at_height(height: u32) -> u64 {
    let mut remaining = height as u64 + 1;
    let mut subsidy = INITIAL_SUBSIDY;
    let mut total = 0u64;
    while remaining > 0 && subsidy > 0 {
        let blocks = remaining.min(HALVING_INTERVAL);
        total = total.saturating_add(blocks * subsidy);
        remaining -= blocks;
        subsidy >>= 1;
    }
    total
}

impl Fungible for NativeAsset {
    fn id(&self) -> &str {
        &self.id
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn supply(&self) -> &SupplyMetrics {
        &self.supply
    }

    fn is_native(&self) -> bool {
        true
    }
}

/// Fungible token created from remote genesis data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenAsset {
    id: String,
    ticker: String,
    name: String,
    precision: Precision,
    supply: SupplyMetrics,
    authenticity: Authenticity,
    genesis: String,
}

impl TokenAsset {
    pub fn new(
        id: impl Into<String>,
        ticker: impl Into<String>,
        name: impl Into<String>,
        precision: Precision,
    ) -> Self {
        Self {
            id: id.into(),
            ticker: ticker.into(),
            name: name.into(),
            precision,
            supply: SupplyMetrics::default(),
            authenticity: Authenticity::default(),
            genesis: String::new(),
        }
    }

    pub fn from_record(record: AssetRecord) -> VaultResult<Self> {
        if record.id.trim().is_empty() {
            return Err(VaultError::Validation("Asset id cannot be empty".to_string()));
        }
        let supply = record.supply();
        Ok(Self {
            precision: Precision::new(record.precision)?,
            supply,
            authenticity: Authenticity {
                issuer: record.issuer,
                verified: record.verified,
                ricardian_contract: record.ricardian_contract,
            },
            id: record.id,
            ticker: record.ticker,
            name: record.name,
            genesis: record.genesis,
        })
    }

    pub fn with_supply(mut self, supply: SupplyMetrics) -> Self {
        self.supply = supply;
        self
    }

    pub fn with_authenticity(mut self, authenticity: Authenticity) -> Self {
        self.authenticity = authenticity;
        self
    }

    pub fn with_genesis(mut self, genesis: impl Into<String>) -> Self {
        self.genesis = genesis.into();
        self
    }

    /// Replace the mutable supply fields, leaving identity untouched.
    pub fn update_supply(&mut self, supply: SupplyMetrics) {
        self.supply = supply;
    }

    pub fn authenticity(&self) -> &Authenticity {
        &self.authenticity
    }

    pub fn genesis(&self) -> &str {
        &self.genesis
    }
}

impl Fungible for TokenAsset {
    fn id(&self) -> &str {
        &self.id
    }

    fn ticker(&self) -> &str {
        &self.ticker
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn supply(&self) -> &SupplyMetrics {
        &self.supply
    }

    fn is_native(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Asset {
    Native(NativeAsset),
    Token(TokenAsset),
}

impl Asset {
    fn inner(&self) -> &dyn Fungible {
        match self {
            Asset::Native(asset) => asset as &dyn Fungible,
            Asset::Token(asset) => asset as &dyn Fungible,
        }
    }

    pub fn as_token(&self) -> Option<&TokenAsset> {
        match self {
            Asset::Token(token) => Some(token),
            Asset::Native(_) => None,
        }
    }
}

impl Fungible for Asset {
    fn id(&self) -> &str {
        self.inner().id()
    }

    fn ticker(&self) -> &str {
        self.inner().ticker()
    }

    fn name(&self) -> &str {
        self.inner().name()
    }

    fn precision(&self) -> Precision {
        self.inner().precision()
    }

    fn supply(&self) -> &SupplyMetrics {
        self.inner().supply()
    }

    fn is_native(&self) -> bool {
        self.inner().is_native()
    }
}

/// Counts from one asset synchronisation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AssetSyncReport {
    pub updated: usize,
    pub inserted: usize,
}

/// Assets known to the vault, keyed by id. Always holds the native asset
/// after any public operation returns.
#[derive(Debug, Clone)]
pub struct AssetRegistry {
    network: Network,
    assets: BTreeMap<String, Asset>,
}

impl AssetRegistry {
    pub fn new(network: Network) -> Self {
        let mut registry = Self {
            network,
            assets: BTreeMap::new(),
        };
        registry.ensure_native();
        registry
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn native_id(&self) -> &'static str {
        NativeAsset::id_for(self.network)
    }

    pub fn native(&self) -> Option<&NativeAsset> {
        match self.assets.get(self.native_id()) {
            Some(Asset::Native(native)) => Some(native),
            _ => None,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Asset> {
        self.assets.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.assets.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Asset> {
        self.assets.values()
    }

    /// Insert or replace a token. The native id is reserved.
    pub fn insert_token(&mut self, token: TokenAsset) -> VaultResult<()> {
        if token.id() == self.native_id() {
            return Err(VaultError::Validation(format!(
                "Asset id {} is reserved for the native asset",
                token.id()
            )));
        }
        self.assets.insert(token.id().to_string(), Asset::Token(token));
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Asset> {
        let removed = self.assets.remove(id);
        self.ensure_native();
        removed
    }

    /// Reconcile with the remote asset list: known tokens get their supply
    /// updated in place, unknown ones are added. Records are validated
    /// before anything is applied.
    pub fn apply_remote(&mut self, records: Vec<AssetRecord>) -> VaultResult<AssetSyncReport> {
        let native_id = self.native_id();
        let tokens = records
            .into_iter()
            .filter(|record| {
                if record.id == native_id {
                    log::warn!("Ignoring remote asset record for native asset {}", native_id);
                    false
                } else {
                    true
                }
            })
            .map(TokenAsset::from_record)
            .collect::<VaultResult<Vec<_>>>()?;

        let mut report = AssetSyncReport::default();
        for token in tokens {
            match self.assets.get_mut(token.id()) {
                Some(Asset::Token(existing)) => {
                    existing.update_supply(token.supply().clone());
                    report.updated += 1;
                }
                _ => {
                    self.assets.insert(token.id().to_string(), Asset::Token(token));
                    report.inserted += 1;
                }
            }
        }

        self.ensure_native();
        Ok(report)
    }

    pub fn update_native_supply(&mut self, height: Option<u32>) {
        self.ensure_native();
        let native_id = self.native_id();
        if let Some(Asset::Native(native)) = self.assets.get_mut(native_id) {
            native.update_from_chain(height);
        }
    }

    fn ensure_native(&mut self) {
        let native_id = self.native_id();
        if !matches!(self.assets.get(native_id), Some(Asset::Native(_))) {
            self.assets.insert(
                native_id.to_string(),
                Asset::Native(NativeAsset::new(self.network)),
            );
        }
    }
}
