//! Custody of the seed, master key and contract-scoped keys.
//!
//! The signer is the only component that reads or writes raw key material.
//! Callers get back public descriptors or signed transfers, never secrets.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::bip32::{self, ChildNumber, DerivationPath, Fingerprint, Xpriv};
use bitcoin::psbt::{GetKey, KeyRequest, SigningKeys, SigningKeysMap};
use bitcoin::secp256k1::{Secp256k1, Signing};
use bitcoin::{Network, PrivateKey, Psbt};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::derivation::{
    self, derive_scoped, master_from_mnemonic, scrub, KeyOrigin, PathPolicy, ScopedPath, SECP,
};
use crate::errors::{VaultError, VaultResult};
use crate::storage::{SecretStore, StoreOperation, StoreStatus};

pub const SEED_ENTRY: &str = "citadel.seed";
pub const MASTER_ENTRY: &str = "citadel.master-xpriv";

/// Fresh scopes tried before giving up on a colliding derivation path.
pub const MAX_SCOPE_ATTEMPTS: usize = 8;

/// What `ensure_seed` found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedOutcome {
    /// A new seed and master key were generated.
    Created,
    /// A seed was present without its master key; the master key was rebuilt.
    Recovered,
    /// Nothing to do.
    Existing,
}

pub struct Signer {
    store: Arc<dyn SecretStore>,
    network: Network,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("namespace", &self.store.namespace())
            .field("network", &self.network)
            .finish()
    }
}

impl Signer {
    pub fn new(store: Arc<dyn SecretStore>, network: Network) -> Self {
        Self { store, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn has_master_key(&self) -> VaultResult<bool> {
        self.check(MASTER_ENTRY)
    }

    /// Create the seed and master key unless they already exist.
    ///
    /// A persisted seed whose master key write failed is completed on the
    /// next call instead of being regenerated.
    pub fn ensure_seed(&self) -> VaultResult<SeedOutcome> {
        let has_seed = self.check(SEED_ENTRY)?;
        let has_master = self.check(MASTER_ENTRY)?;

        match (has_seed, has_master) {
            (true, true) => Ok(SeedOutcome::Existing),
            (false, true) => {
                log::warn!("Master key present without a seed entry; leaving key material untouched");
                Ok(SeedOutcome::Existing)
            }
            (true, false) => {
                let seed = self
                    .read(SEED_ENTRY)?
                    .ok_or_else(|| VaultError::storage(StoreOperation::Read, StoreStatus::NotFound))?;
                let phrase = std::str::from_utf8(&seed)
                    .map_err(|_| VaultError::storage(StoreOperation::Read, StoreStatus::Corrupted))?;
                self.persist_master(phrase)?;
                log::info!("Recovered master key from existing seed");
                Ok(SeedOutcome::Recovered)
            }
            (false, false) => {
                let phrase = derivation::generate_mnemonic()?;
                self.write(SEED_ENTRY, phrase.as_bytes())?;
                self.persist_master(&phrase)?;
                log::info!("Created new seed and master key for {}", self.network);
                Ok(SeedOutcome::Created)
            }
        }
    }

    /// Derive, persist and describe the scoped key at `path`.
    ///
    /// Returns the public descriptor, which is also the store key of the
    /// private counterpart.
    pub fn derive_scoped_key(&self, path: &ScopedPath) -> VaultResult<String> {
        let mut master = self.load_master()?;
        let derived = derive_scoped(&master, path);
        scrub(&mut master);

        let scoped = derived?;
        let encoded = scoped.encode_secret();
        self.write(scoped.descriptor(), encoded.as_bytes())?;
        log::debug!("Stored scoped key for path {}", path);
        Ok(scoped.descriptor().to_string())
    }

    /// Provision a key for a new contract under a random scope, retrying with
    /// another scope when the derived descriptor is already taken.
    pub fn provision_scoped_key(&self, policy: &PathPolicy) -> VaultResult<(ScopedPath, String)> {
        self.provision_scoped_key_with(policy, derivation::random_scope)
    }

    pub fn provision_scoped_key_with<F>(
        &self,
        policy: &PathPolicy,
        mut next_scope: F,
    ) -> VaultResult<(ScopedPath, String)>
    where
        F: FnMut() -> VaultResult<u32>,
    {
        for attempt in 1..=MAX_SCOPE_ATTEMPTS {
            let path = policy.path(next_scope()?)?;
            match self.derive_scoped_key(&path) {
                Ok(descriptor) => return Ok((path, descriptor)),
                Err(VaultError::SecureStorage {
                    status: StoreStatus::Duplicate,
                    ..
                }) => {
                    log::warn!(
                        "Derivation path {} already provisioned (attempt {}), picking a new scope",
                        path,
                        attempt
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(VaultError::KeyGeneration(format!(
            "No free derivation scope after {} attempts",
            MAX_SCOPE_ATTEMPTS
        )))
    }

    /// Sign every PSBT input derived from the scoped key referenced by
    /// `descriptor`. Returns the updated PSBT in base64.
    pub fn sign_transfer(&self, descriptor: &str, psbt_base64: &str) -> VaultResult<String> {
        let origin = KeyOrigin::find(descriptor).ok_or_else(|| {
            VaultError::Signing("Contract policy carries no locally held key".to_string())
        })?;

        let secret = self
            .read(&origin.expression)?
            .ok_or_else(|| VaultError::storage(StoreOperation::Read, StoreStatus::NotFound))?;
        let xpriv = parse_xpriv(&secret)?;
        let source = AccountKeySource {
            master: origin.fingerprint,
            account: origin.account,
            xpriv,
        };

        let mut psbt = Psbt::from_str(psbt_base64.trim())
            .map_err(|e| VaultError::Signing(format!("Invalid PSBT: {}", e)))?;

        match psbt.sign(&source, &*SECP) {
            Ok(signed) => match signature_count(&signed) {
                0 => Err(VaultError::Signing(
                    "No transfer inputs belong to this contract".to_string(),
                )),
                count => {
                    log::info!("Added {} signature(s) to the transfer locally", count);
                    Ok(psbt.to_string())
                }
            },
            Err((_, errors)) => Err(VaultError::Signing(format!(
                "Failed to sign inputs: {:?}",
                errors
            ))),
        }
    }

    fn persist_master(&self, phrase: &str) -> VaultResult<()> {
        let mut master = master_from_mnemonic(phrase, self.network)?;
        let encoded = Zeroizing::new(master.to_string());
        scrub(&mut master);

        match self.write(MASTER_ENTRY, encoded.as_bytes()) {
            Err(VaultError::SecureStorage {
                status: StoreStatus::Duplicate,
                ..
            }) => Ok(()),
            other => other,
        }
    }

    fn load_master(&self) -> VaultResult<Xpriv> {
        let secret = self.read(MASTER_ENTRY)?.ok_or(VaultError::MissingMasterKey)?;
        parse_xpriv(&secret)
    }

    fn check(&self, key: &str) -> VaultResult<bool> {
        self.store
            .exists(key)
            .map_err(|status| VaultError::storage(StoreOperation::Check, status))
    }

    fn read(&self, key: &str) -> VaultResult<Option<Zeroizing<Vec<u8>>>> {
        self.store
            .read(key)
            .map_err(|status| VaultError::storage(StoreOperation::Read, status))
    }

    fn write(&self, key: &str, secret: &[u8]) -> VaultResult<()> {
        self.store
            .write(key, secret)
            .map_err(|status| VaultError::storage(StoreOperation::Write, status))
    }
}

/// The signing map carries an entry per input even when no key matched.
fn signature_count(signed: &SigningKeysMap) -> usize {
    signed
        .values()
        .map(|keys| match keys {
            SigningKeys::Ecdsa(keys) => keys.len(),
            SigningKeys::Schnorr(keys) => keys.len(),
        })
        .sum()
}

fn parse_xpriv(secret: &[u8]) -> VaultResult<Xpriv> {
    let corrupted = || VaultError::storage(StoreOperation::Read, StoreStatus::Corrupted);
    let encoded = std::str::from_utf8(secret).map_err(|_| corrupted())?;
    Xpriv::from_str(encoded).map_err(|_| corrupted())
}

/// Resolves PSBT key requests against one account-level key.
///
/// Requests carry the master fingerprint and the full path; only paths below
/// the account prefix are answered.
struct AccountKeySource {
    master: Fingerprint,
    account: DerivationPath,
    xpriv: Xpriv,
}

impl Drop for AccountKeySource {
    fn drop(&mut self) {
        scrub(&mut self.xpriv);
    }
}

impl GetKey for AccountKeySource {
    type Error = bip32::Error;

    fn get_key<C: Signing>(
        &self,
        key_request: KeyRequest,
        secp: &Secp256k1<C>,
    ) -> Result<Option<PrivateKey>, Self::Error> {
        match key_request {
            KeyRequest::Bip32((fingerprint, path)) if fingerprint == self.master => {
                let steps: &[ChildNumber] = path.as_ref();
                let account: &[ChildNumber] = self.account.as_ref();
                match steps.strip_prefix(account) {
                    Some(rest) if rest.iter().all(|step| step.is_normal()) => {
                        let mut child = self.xpriv.derive_priv(secp, &rest)?;
                        let key = child.to_priv();
                        scrub(&mut child);
                        Ok(Some(key))
                    }
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::DescriptorCategory;
    use crate::storage::MemorySecretStore;
    use bitcoin::{
        absolute, transaction, Amount, CompressedPublicKey, OutPoint, ScriptBuf, Transaction,
        TxIn, TxOut,
    };

    fn signer() -> (MemorySecretStore, Signer) {
        let store = MemorySecretStore::new("signer-test");
        let signer = Signer::new(Arc::new(store.clone()), Network::Testnet);
        (store, signer)
    }

    #[test]
    fn ensure_seed_is_idempotent() {
        let (store, signer) = signer();
        assert_eq!(signer.ensure_seed().unwrap(), SeedOutcome::Created);
        assert!(store.exists(SEED_ENTRY).unwrap());
        assert!(store.exists(MASTER_ENTRY).unwrap());

        let seed_before = store.read(SEED_ENTRY).unwrap().unwrap();
        assert_eq!(signer.ensure_seed().unwrap(), SeedOutcome::Existing);
        let seed_after = store.read(SEED_ENTRY).unwrap().unwrap();
        assert_eq!(seed_before.as_slice(), seed_after.as_slice());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn seed_without_master_is_recovered() {
        let (store, signer) = signer();
        store.deny_writes(MASTER_ENTRY);

        let err = signer.ensure_seed().unwrap_err();
        assert_eq!(
            err,
            VaultError::storage(StoreOperation::Write, StoreStatus::AccessDenied)
        );
        assert!(store.exists(SEED_ENTRY).unwrap());
        assert!(!store.exists(MASTER_ENTRY).unwrap());

        store.allow_writes(MASTER_ENTRY);
        assert_eq!(signer.ensure_seed().unwrap(), SeedOutcome::Recovered);
        assert!(signer.has_master_key().unwrap());
        assert_eq!(signer.ensure_seed().unwrap(), SeedOutcome::Existing);
    }

    #[test]
    fn scoped_key_requires_master() {
        let (_store, signer) = signer();
        let path: ScopedPath = "m/84'/1'/3'/0/*".parse().unwrap();
        assert_eq!(
            signer.derive_scoped_key(&path),
            Err(VaultError::MissingMasterKey)
        );
    }

    #[test]
    fn scoped_key_is_stored_under_descriptor() {
        let (store, signer) = signer();
        signer.ensure_seed().unwrap();

        let path: ScopedPath = "m/84'/1'/3'/0/*".parse().unwrap();
        let descriptor = signer.derive_scoped_key(&path).unwrap();
        assert!(descriptor.contains("/84'/1'/3']tpub"));

        let secret = store.read(&descriptor).unwrap().expect("scoped key stored");
        assert!(std::str::from_utf8(&secret).unwrap().starts_with("tprv"));

        // write-once: the same path cannot be provisioned twice
        assert!(matches!(
            signer.derive_scoped_key(&path),
            Err(VaultError::SecureStorage {
                status: StoreStatus::Duplicate,
                ..
            })
        ));
    }

    #[test]
    fn provisioning_skips_taken_scopes() {
        let (_store, signer) = signer();
        signer.ensure_seed().unwrap();
        let policy = PathPolicy::single_sig(DescriptorCategory::SegWit, false, Network::Testnet);

        let taken = signer.derive_scoped_key(&policy.path(5).unwrap()).unwrap();

        let mut scopes = vec![6u32, 5].into_iter().rev();
        let (path, descriptor) = signer
            .provision_scoped_key_with(&policy, || Ok(scopes.next().unwrap()))
            .unwrap();
        assert_eq!(path.scope(), Some(6));
        assert_ne!(descriptor, taken);
    }

    #[test]
    fn provisioning_gives_up_after_bounded_attempts() {
        let (_store, signer) = signer();
        signer.ensure_seed().unwrap();
        let policy = PathPolicy::single_sig(DescriptorCategory::Taproot, false, Network::Testnet);
        signer.derive_scoped_key(&policy.path(9).unwrap()).unwrap();

        let result = signer.provision_scoped_key_with(&policy, || Ok(9));
        assert!(matches!(result, Err(VaultError::KeyGeneration(_))));
    }

    fn funding_psbt(signer_store: &MemorySecretStore, path: &str) -> Psbt {
        let master_secret = signer_store.read(MASTER_ENTRY).unwrap().unwrap();
        let master = parse_xpriv(&master_secret).unwrap();
        let full_path = DerivationPath::from_str(path).unwrap();
        let child = master.derive_priv(&*SECP, &full_path).unwrap();
        let pubkey = CompressedPublicKey::from_private_key(&*SECP, &child.to_priv()).unwrap();
        let script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());

        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: Amount::from_sat(40_000),
                script_pubkey: script.clone(),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(50_000),
            script_pubkey: script,
        });
        psbt.inputs[0]
            .bip32_derivation
            .insert(pubkey.0, (master.fingerprint(&*SECP), full_path));
        psbt
    }

    #[test]
    fn local_signing_uses_scoped_key() {
        let (store, signer) = signer();
        signer.ensure_seed().unwrap();
        let path: ScopedPath = "m/84'/1'/11'/0/*".parse().unwrap();
        let descriptor = signer.derive_scoped_key(&path).unwrap();

        let psbt = funding_psbt(&store, "m/84'/1'/11'/0/3");
        let signed = signer
            .sign_transfer(&format!("wpkh({})", descriptor), &psbt.to_string())
            .unwrap();

        let signed = Psbt::from_str(&signed).unwrap();
        assert_eq!(signed.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn local_signing_rejects_foreign_inputs() {
        let (store, signer) = signer();
        signer.ensure_seed().unwrap();
        let descriptor = signer
            .derive_scoped_key(&"m/84'/1'/11'/0/*".parse().unwrap())
            .unwrap();

        let psbt = funding_psbt(&store, "m/84'/1'/12'/0/3");
        let result = signer.sign_transfer(&descriptor, &psbt.to_string());
        assert!(matches!(result, Err(VaultError::Signing(_))));

        let result = signer.sign_transfer(&descriptor, "not a psbt");
        assert!(matches!(result, Err(VaultError::Signing(_))));
    }
}
