//! Pure hierarchical-deterministic derivation helpers.
//!
//! Nothing here touches storage: functions take seed phrases or extended keys
//! and return derived material, leaving persistence to the signer.

use std::fmt;
use std::str::FromStr;

use bip39::{Language, Mnemonic};
use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::Network;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::{VaultError, VaultResult};

pub(crate) static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

static KEY_ORIGIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\[([0-9a-fA-F]{8})((?:/[0-9]+['h]?)*)\]([xt]pub[1-9A-HJ-NP-Za-km-z]+)((?:/[0-9]+)*)/\*",
    )
    .expect("key origin pattern is valid")
});

/// Purpose branch for contracts carrying token-protocol support.
pub const PURPOSE_TOKEN: u32 = 827166;
pub const PURPOSE_TAPROOT_SINGLE: u32 = 86;
pub const PURPOSE_TAPROOT_MULTISIG: u32 = 87;
pub const PURPOSE_SEGWIT: u32 = 84;
pub const PURPOSE_LEGACY_SINGLE: u32 = 44;
pub const PURPOSE_LEGACY_MULTISIG: u32 = 45;

/// Seed phrases are always 24 words (256 bits of entropy).
pub const MNEMONIC_WORDS: usize = 24;
const ENTROPY_BYTES: usize = 32;
const SCOPE_MASK: u32 = 0x7FFF_FFFF;

/// Script family a contract descriptor commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorCategory {
    Bare,
    Hashed,
    SegWit,
    Taproot,
}

impl fmt::Display for DescriptorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DescriptorCategory::Bare => "bare",
            DescriptorCategory::Hashed => "hashed",
            DescriptorCategory::SegWit => "segwit",
            DescriptorCategory::Taproot => "taproot",
        };
        f.write_str(label)
    }
}

impl FromStr for DescriptorCategory {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bare" => Ok(DescriptorCategory::Bare),
            "hashed" | "pkh" => Ok(DescriptorCategory::Hashed),
            "segwit" | "wpkh" => Ok(DescriptorCategory::SegWit),
            "taproot" | "tr" => Ok(DescriptorCategory::Taproot),
            other => Err(VaultError::Validation(format!(
                "Unknown descriptor category '{}'",
                other
            ))),
        }
    }
}

/// Inputs of the derivation path policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathPolicy {
    pub category: DescriptorCategory,
    pub token_enabled: bool,
    pub multisig: bool,
    pub network: Network,
}

impl PathPolicy {
    pub fn single_sig(category: DescriptorCategory, token_enabled: bool, network: Network) -> Self {
        Self {
            category,
            token_enabled,
            multisig: false,
            network,
        }
    }

    pub fn purpose(&self) -> u32 {
        if self.token_enabled {
            return PURPOSE_TOKEN;
        }
        match (self.category, self.multisig) {
            (DescriptorCategory::Taproot, false) => PURPOSE_TAPROOT_SINGLE,
            (DescriptorCategory::Taproot, true) => PURPOSE_TAPROOT_MULTISIG,
            (DescriptorCategory::SegWit, _) => PURPOSE_SEGWIT,
            (DescriptorCategory::Bare | DescriptorCategory::Hashed, false) => PURPOSE_LEGACY_SINGLE,
            (DescriptorCategory::Bare | DescriptorCategory::Hashed, true) => {
                PURPOSE_LEGACY_MULTISIG
            }
        }
    }

    /// `m/<purpose>'/<coin>'/<scope>'/0/*`
    pub fn path(&self, scope: u32) -> VaultResult<ScopedPath> {
        if scope > SCOPE_MASK {
            return Err(VaultError::Validation(format!(
                "Scope {} exceeds the 31-bit index space",
                scope
            )));
        }

        let steps = vec![
            hardened(self.purpose())?,
            hardened(coin_index(self.network))?,
            hardened(scope)?,
            ChildNumber::Normal { index: 0 },
        ];
        ScopedPath::new(steps)
    }
}

pub fn coin_index(network: Network) -> u32 {
    match network {
        Network::Bitcoin => 0,
        _ => 1,
    }
}

fn hardened(index: u32) -> VaultResult<ChildNumber> {
    ChildNumber::from_hardened_idx(index)
        .map_err(|e| VaultError::Validation(format!("Invalid hardened index {}: {}", index, e)))
}

/// Derivation path split into its hardened account prefix and the unhardened
/// steps leading to a wildcard terminal index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPath {
    hardened: Vec<ChildNumber>,
    unhardened: Vec<ChildNumber>,
}

impl ScopedPath {
    pub fn new(steps: Vec<ChildNumber>) -> VaultResult<Self> {
        let split = steps
            .iter()
            .position(|step| step.is_normal())
            .unwrap_or(steps.len());
        let (hardened, unhardened) = steps.split_at(split);

        if hardened.is_empty() {
            return Err(VaultError::Validation(
                "Derivation path needs at least one hardened step".to_string(),
            ));
        }
        if unhardened.iter().any(|step| step.is_hardened()) {
            return Err(VaultError::Validation(
                "Hardened step after an unhardened one cannot be derived publicly".to_string(),
            ));
        }

        Ok(Self {
            hardened: hardened.to_vec(),
            unhardened: unhardened.to_vec(),
        })
    }

    /// Hardened prefix derived privately from the master key.
    pub fn account(&self) -> DerivationPath {
        DerivationPath::from(self.hardened.clone())
    }

    pub fn terminal(&self) -> &[ChildNumber] {
        &self.unhardened
    }

    pub fn purpose(&self) -> Option<u32> {
        self.hardened_index(0)
    }

    pub fn scope(&self) -> Option<u32> {
        self.hardened_index(2)
    }

    fn hardened_index(&self, position: usize) -> Option<u32> {
        match self.hardened.get(position) {
            Some(ChildNumber::Hardened { index }) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for ScopedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for step in self.hardened.iter().chain(self.unhardened.iter()) {
            write!(f, "/{}", step)?;
        }
        f.write_str("/*")
    }
}

impl FromStr for ScopedPath {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .trim()
            .strip_suffix("/*")
            .ok_or_else(|| VaultError::Validation(format!("Path '{}' lacks a wildcard step", s)))?;
        let body = body.strip_prefix("m/").ok_or_else(|| {
            VaultError::Validation(format!("Path '{}' must start from the master key", s))
        })?;

        let steps = body
            .split('/')
            .map(|step| {
                ChildNumber::from_str(step).map_err(|e| {
                    VaultError::Validation(format!("Invalid path step '{}': {}", step, e))
                })
            })
            .collect::<VaultResult<Vec<_>>>()?;
        ScopedPath::new(steps)
    }
}

/// Uniformly sampled 31-bit scope index.
pub fn random_scope() -> VaultResult<u32> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| VaultError::KeyGeneration(format!("Failed to generate scope: {}", e)))?;
    Ok(u32::from_le_bytes(bytes) & SCOPE_MASK)
}

/// Generate a fresh 24-word BIP39 phrase.
pub fn generate_mnemonic() -> VaultResult<Zeroizing<String>> {
    let mut entropy = Zeroizing::new([0u8; ENTROPY_BYTES]);
    OsRng
        .try_fill_bytes(entropy.as_mut())
        .map_err(|e| VaultError::KeyGeneration(format!("Failed to generate entropy: {}", e)))?;

    let mnemonic = Mnemonic::from_entropy(entropy.as_ref())
        .map_err(|e| VaultError::KeyGeneration(format!("Failed to create mnemonic: {}", e)))?;

    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Derive the BIP32 master key; test networks produce `tprv` keys.
pub fn master_from_mnemonic(phrase: &str, network: Network) -> VaultResult<Xpriv> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| VaultError::KeyGeneration(format!("Invalid mnemonic: {}", e)))?;
    let seed = Zeroizing::new(mnemonic.to_seed(""));

    Xpriv::new_master(network, seed.as_ref())
        .map_err(|e| VaultError::KeyGeneration(format!("Failed to derive master key: {}", e)))
}

/// Overwrite the private scalar and chain code of an extended key.
pub fn scrub(xpriv: &mut Xpriv) {
    xpriv.private_key.non_secure_erase();
    xpriv.chain_code = ChainCode::from([0u8; 32]);
}

/// Private key for one contract together with its public descriptor.
pub struct ScopedKey {
    xpriv: Xpriv,
    descriptor: String,
}

impl ScopedKey {
    /// Public key-origin expression, also used as the secret store lookup key.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn encode_secret(&self) -> Zeroizing<String> {
        Zeroizing::new(self.xpriv.to_string())
    }
}

impl fmt::Debug for ScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedKey")
            .field("descriptor", &self.descriptor)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Drop for ScopedKey {
    fn drop(&mut self) {
        scrub(&mut self.xpriv);
    }
}

/// Derive the hardened account key for `path` and render
/// `[<fingerprint>/<hardened steps>]<xpub>/<unhardened steps>/*`.
pub fn derive_scoped(master: &Xpriv, path: &ScopedPath) -> VaultResult<ScopedKey> {
    let account = path.account();
    let xpriv = master
        .derive_priv(&*SECP, &account)
        .map_err(|e| VaultError::KeyGeneration(format!("Failed to derive scoped key: {}", e)))?;
    let xpub = Xpub::from_priv(&*SECP, &xpriv);

    let mut descriptor = format!("[{}", master.fingerprint(&*SECP));
    for step in &path.hardened {
        descriptor.push_str(&format!("/{}", step));
    }
    descriptor.push_str(&format!("]{}", xpub));
    for step in &path.unhardened {
        descriptor.push_str(&format!("/{}", step));
    }
    descriptor.push_str("/*");

    Ok(ScopedKey { xpriv, descriptor })
}

/// Key origin embedded in a contract descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyOrigin {
    pub fingerprint: Fingerprint,
    pub account: DerivationPath,
    /// The `[origin]xpub/.../*` expression exactly as stored by the signer.
    pub expression: String,
}

impl KeyOrigin {
    /// Locate the first key-origin expression inside a (possibly wrapped)
    /// descriptor such as `wpkh([..]tpub../0/*)`.
    pub fn find(descriptor: &str) -> Option<Self> {
        let captures = KEY_ORIGIN.captures(descriptor)?;
        let fingerprint = Fingerprint::from_str(captures.get(1)?.as_str()).ok()?;
        let account =
            DerivationPath::from_str(&format!("m{}", captures.get(2)?.as_str())).ok()?;
        Some(Self {
            fingerprint,
            account,
            expression: captures.get(0)?.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn scrub_clears_private_material() {
        let mut master = master_from_mnemonic(PHRASE, Network::Testnet).unwrap();
        let original = master;
        scrub(&mut master);

        assert_eq!(master.chain_code, ChainCode::from([0u8; 32]));
        assert_ne!(master.chain_code, original.chain_code);
        assert_ne!(
            master.private_key.secret_bytes(),
            original.private_key.secret_bytes()
        );
        // Public metadata is untouched.
        assert_eq!(master.depth, original.depth);
        assert_eq!(master.network, original.network);
    }

    #[test]
    fn generated_mnemonic_has_fixed_word_count() {
        let phrase = generate_mnemonic().unwrap();
        assert_eq!(phrase.split_whitespace().count(), MNEMONIC_WORDS);
        assert!(Mnemonic::parse_in_normalized(Language::English, &phrase).is_ok());
    }

    #[test]
    fn master_key_prefix_follows_network() {
        let main = master_from_mnemonic(PHRASE, Network::Bitcoin).unwrap();
        let test = master_from_mnemonic(PHRASE, Network::Testnet).unwrap();
        assert!(main.to_string().starts_with("xprv"));
        assert!(test.to_string().starts_with("tprv"));
        assert_eq!(main.fingerprint(&*SECP), test.fingerprint(&*SECP));
    }

    #[test]
    fn invalid_mnemonic_is_key_generation_error() {
        let result = master_from_mnemonic("not a real phrase", Network::Bitcoin);
        assert!(matches!(result, Err(VaultError::KeyGeneration(_))));
    }

    #[test]
    fn purpose_selection() {
        let net = Network::Testnet;
        let cases = [
            (DescriptorCategory::SegWit, false, false, PURPOSE_SEGWIT),
            (DescriptorCategory::Taproot, false, false, PURPOSE_TAPROOT_SINGLE),
            (DescriptorCategory::Taproot, false, true, PURPOSE_TAPROOT_MULTISIG),
            (DescriptorCategory::Hashed, false, false, PURPOSE_LEGACY_SINGLE),
            (DescriptorCategory::Bare, false, true, PURPOSE_LEGACY_MULTISIG),
            (DescriptorCategory::SegWit, true, false, PURPOSE_TOKEN),
            (DescriptorCategory::Taproot, true, true, PURPOSE_TOKEN),
        ];
        for (category, token_enabled, multisig, expected) in cases {
            let policy = PathPolicy {
                category,
                token_enabled,
                multisig,
                network: net,
            };
            assert_eq!(policy.purpose(), expected, "{:?}", policy);
        }
    }

    #[test]
    fn path_shape_and_parse() {
        let policy = PathPolicy::single_sig(DescriptorCategory::SegWit, false, Network::Testnet);
        let path = policy.path(1234).unwrap();
        assert_eq!(path.to_string(), "m/84'/1'/1234'/0/*");
        assert_eq!(path.scope(), Some(1234));
        assert_eq!(path.purpose(), Some(PURPOSE_SEGWIT));

        let reparsed: ScopedPath = "m/84h/1h/1234h/0/*".parse().unwrap();
        assert_eq!(reparsed, path);

        let mainnet = PathPolicy::single_sig(DescriptorCategory::Taproot, true, Network::Bitcoin);
        assert_eq!(mainnet.path(7).unwrap().to_string(), "m/827166'/0'/7'/0/*");
    }

    #[test]
    fn path_rejects_bad_shapes() {
        assert!("m/84'/1'/0'/0".parse::<ScopedPath>().is_err());
        assert!("84'/1'/0'/0/*".parse::<ScopedPath>().is_err());
        assert!("m/0/1'/*".parse::<ScopedPath>().is_err());

        let policy = PathPolicy::single_sig(DescriptorCategory::SegWit, false, Network::Testnet);
        assert!(policy.path(0x8000_0000).is_err());
    }

    #[test]
    fn random_scope_fits_31_bits() {
        for _ in 0..64 {
            assert!(random_scope().unwrap() <= SCOPE_MASK);
        }
    }

    #[test]
    fn scoped_descriptor_is_deterministic() {
        let master = master_from_mnemonic(PHRASE, Network::Testnet).unwrap();
        let path: ScopedPath = "m/84'/1'/5'/0/*".parse().unwrap();

        let first = derive_scoped(&master, &path).unwrap();
        let second = derive_scoped(&master, &path).unwrap();
        assert_eq!(first.descriptor(), second.descriptor());
        assert!(first.descriptor().starts_with("[73c5da0a/84'/1'/5']tpub"));
        assert!(first.descriptor().ends_with("/0/*"));

        let other: ScopedPath = "m/84'/1'/6'/0/*".parse().unwrap();
        assert_ne!(
            derive_scoped(&master, &other).unwrap().descriptor(),
            first.descriptor()
        );
    }

    #[test]
    fn key_origin_found_inside_wrapped_descriptor() {
        let master = master_from_mnemonic(PHRASE, Network::Testnet).unwrap();
        let path: ScopedPath = "m/86'/1'/42'/0/*".parse().unwrap();
        let key = derive_scoped(&master, &path).unwrap();

        let wrapped = format!("tr({})", key.descriptor());
        let origin = KeyOrigin::find(&wrapped).expect("origin present");
        assert_eq!(origin.expression, key.descriptor());
        assert_eq!(origin.fingerprint, master.fingerprint(&*SECP));
        assert_eq!(origin.account, path.account());

        assert!(KeyOrigin::find("wpkh(02abcdef)").is_none());
    }

    #[test]
    fn scoped_key_debug_is_redacted() {
        let master = master_from_mnemonic(PHRASE, Network::Testnet).unwrap();
        let path: ScopedPath = "m/84'/1'/1'/0/*".parse().unwrap();
        let key = derive_scoped(&master, &path).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("tprv"));
    }
}
