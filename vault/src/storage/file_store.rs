use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::secret_store::{SecretStore, StoreLease, StoreOperation, StoreStatus};
use super::VaultPaths;
use crate::errors::{VaultError, VaultResult};

const STORE_MAGIC: &[u8; 8] = b"CITADLSS";
const STORE_VERSION: u16 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const KEYCHECK_FILENAME: &str = "keycheck.json";
const KEYCHECK_PLAINTEXT: &[u8] = b"citadel-vault-keycheck";

/// Argon2id cost applied when a store is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            m_cost_kib: 256 * 1024, // 256 MiB
            t_cost: 4,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdfParameters {
    m_cost_kib: u32,
    t_cost: u32,
    p_cost: u32,
    salt: [u8; SALT_LEN],
}

impl KdfParameters {
    fn generate(cost: KdfCost) -> Self {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        Self {
            m_cost_kib: cost.m_cost_kib,
            t_cost: cost.t_cost,
            p_cost: cost.p_cost,
            salt,
        }
    }
}

/// Password verifier written once per store; a wrong password fails to open it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyCheckFile {
    magic: [u8; 8],
    version: u16,
    kdf: KdfParameters,
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SecretEnvelope {
    magic: [u8; 8],
    version: u16,
    nonce: [u8; NONCE_LEN],
    checksum: [u8; 32],
    ciphertext: Vec<u8>,
}

/// Password-protected store keeping one encrypted file per entry.
///
/// Each entry is sealed with AES-256-GCM under a key stretched from the
/// password with Argon2id. The entry name is bound as associated data, so a
/// file copied under another name fails to decrypt.
pub struct FileSecretStore {
    paths: VaultPaths,
    namespace: String,
    key: Zeroizing<[u8; KEY_LEN]>,
}

impl FileSecretStore {
    pub fn open(paths: &VaultPaths, password: &SecretString) -> VaultResult<Self> {
        Self::open_with_cost(paths, password, KdfCost::default())
    }

    /// Open or create the store. `cost` only applies to newly created stores.
    pub fn open_with_cost(
        paths: &VaultPaths,
        password: &SecretString,
        cost: KdfCost,
    ) -> VaultResult<Self> {
        paths.ensure_directories()?;
        let keycheck_path = paths.secrets_dir().join(KEYCHECK_FILENAME);

        let key = if keycheck_path.exists() {
            let bytes = fs::read(&keycheck_path)?;
            let keycheck: KeyCheckFile = serde_json::from_slice(&bytes)
                .map_err(|_| VaultError::storage(StoreOperation::Read, StoreStatus::Corrupted))?;
            if &keycheck.magic != STORE_MAGIC || keycheck.version != STORE_VERSION {
                return Err(VaultError::storage(
                    StoreOperation::Read,
                    StoreStatus::Corrupted,
                ));
            }

            let key = derive_key(password, &keycheck.kdf)?;
            let nonce = Nonce::assume_unique_for_key(keycheck.nonce);
            let plaintext = decrypt_aes_gcm(&key, nonce, STORE_MAGIC, &keycheck.ciphertext)
                .map_err(|_| VaultError::storage(StoreOperation::Read, StoreStatus::AccessDenied))?;
            if plaintext.as_slice() != KEYCHECK_PLAINTEXT {
                return Err(VaultError::storage(
                    StoreOperation::Read,
                    StoreStatus::AccessDenied,
                ));
            }
            key
        } else {
            let kdf = KdfParameters::generate(cost);
            let key = derive_key(password, &kdf)?;
            let nonce_bytes = random_nonce();
            let ciphertext = encrypt_aes_gcm(
                &key,
                Nonce::assume_unique_for_key(nonce_bytes),
                STORE_MAGIC,
                KEYCHECK_PLAINTEXT,
            )
            .map_err(|status| VaultError::storage(StoreOperation::Write, status))?;

            let keycheck = KeyCheckFile {
                magic: *STORE_MAGIC,
                version: STORE_VERSION,
                kdf,
                nonce: nonce_bytes,
                ciphertext,
            };
            write_replacing(&keycheck_path, &serde_json::to_vec(&keycheck)?)?;
            log::info!("Created secret store at {}", paths.secrets_dir().display());
            key
        };

        Ok(Self {
            namespace: paths.root_dir().display().to_string(),
            paths: paths.clone(),
            key,
        })
    }

    pub fn paths(&self) -> &VaultPaths {
        &self.paths
    }
}

impl fmt::Debug for FileSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSecretStore")
            .field("namespace", &self.namespace)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl SecretStore for FileSecretStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn exists(&self, key: &str) -> Result<bool, StoreStatus> {
        Ok(self.paths.secret_file(key).exists())
    }

    fn read(&self, key: &str) -> Result<Option<Zeroizing<Vec<u8>>>, StoreStatus> {
        let path = self.paths.secret_file(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_status(err)),
        };

        let envelope: SecretEnvelope =
            serde_json::from_slice(&bytes).map_err(|_| StoreStatus::Corrupted)?;
        if &envelope.magic != STORE_MAGIC || envelope.version != STORE_VERSION {
            return Err(StoreStatus::Corrupted);
        }

        let nonce = Nonce::assume_unique_for_key(envelope.nonce);
        let plaintext = decrypt_aes_gcm(&self.key, nonce, key.as_bytes(), &envelope.ciphertext)?;
        if *blake3::hash(&plaintext).as_bytes() != envelope.checksum {
            return Err(StoreStatus::Corrupted);
        }
        Ok(Some(plaintext))
    }

    fn write(&self, key: &str, secret: &[u8]) -> Result<(), StoreStatus> {
        let final_path = self.paths.secret_file(key);
        if final_path.exists() {
            return Err(StoreStatus::Duplicate);
        }

        let nonce_bytes = random_nonce();
        let ciphertext = encrypt_aes_gcm(
            &self.key,
            Nonce::assume_unique_for_key(nonce_bytes),
            key.as_bytes(),
            secret,
        )?;
        let envelope = SecretEnvelope {
            magic: *STORE_MAGIC,
            version: STORE_VERSION,
            nonce: nonce_bytes,
            checksum: *blake3::hash(secret).as_bytes(),
            ciphertext,
        };
        let serialized =
            serde_json::to_vec(&envelope).map_err(|e| StoreStatus::Io(e.to_string()))?;

        let mut suffix = [0u8; 6];
        OsRng.fill_bytes(&mut suffix);
        let tmp_path = final_path.with_extension(format!("tmp-{}", hex::encode(suffix)));
        {
            let mut file = File::create(&tmp_path).map_err(io_status)?;
            file.write_all(&serialized).map_err(io_status)?;
            file.sync_all().map_err(io_status)?;
        }

        // Linking fails if the target appeared meanwhile, keeping entries write-once.
        let linked = fs::hard_link(&tmp_path, &final_path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Err(StoreStatus::Duplicate),
            Err(err) => Err(io_status(err)),
        }
    }

    fn acquire(&self) -> Result<StoreLease, StoreStatus> {
        claim_lock(self.paths.lock_file(), &self.namespace, |file| {
            file.write_all(std::process::id().to_string().as_bytes())
        })
    }
}

/// Create the lock file and stamp it with `stamp`. The lease exists from the
/// moment the file does, so a failed stamp removes the file again.
fn claim_lock<F>(lock_path: &Path, namespace: &str, stamp: F) -> Result<StoreLease, StoreStatus>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Err(StoreStatus::Busy),
        Err(err) => return Err(io_status(err)),
    };

    let owned_path = lock_path.to_path_buf();
    let lease = StoreLease::new(namespace, move || {
        if let Err(err) = fs::remove_file(&owned_path) {
            log::warn!(
                "Failed to release vault lock {}: {}",
                owned_path.display(),
                err
            );
        }
    });

    stamp(&mut file).map_err(io_status)?;
    Ok(lease)
}

fn derive_key(
    password: &SecretString,
    params: &KdfParameters,
) -> VaultResult<Zeroizing<[u8; KEY_LEN]>> {
    let crypto_error =
        |msg: String| VaultError::storage(StoreOperation::Read, StoreStatus::Crypto(msg));

    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(KEY_LEN),
    )
    .map_err(|e| crypto_error(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(
            password.expose_secret().as_bytes(),
            &params.salt,
            key.as_mut(),
        )
        .map_err(|e| crypto_error(format!("KDF failed: {e}")))?;
    Ok(key)
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

fn encrypt_aes_gcm(
    key: &Zeroizing<[u8; KEY_LEN]>,
    nonce: Nonce,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, StoreStatus> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_ref())
        .map_err(|e| StoreStatus::Crypto(format!("Invalid encryption key: {e}")))?;
    let key = LessSafeKey::new(unbound_key);

    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| StoreStatus::Crypto("Encryption failure".to_string()))?;
    Ok(in_out)
}

fn decrypt_aes_gcm(
    key: &Zeroizing<[u8; KEY_LEN]>,
    nonce: Nonce,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, StoreStatus> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_ref())
        .map_err(|e| StoreStatus::Crypto(format!("Invalid encryption key: {e}")))?;
    let key = LessSafeKey::new(unbound_key);

    if ciphertext.len() < aead::AES_256_GCM.tag_len() {
        return Err(StoreStatus::Corrupted);
    }

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = key
        .open_in_place(nonce, Aad::from(aad), &mut in_out)
        .map_err(|_| StoreStatus::Crypto("Decryption failure".to_string()))?
        .len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

fn write_replacing(path: &Path, bytes: &[u8]) -> VaultResult<()> {
    let tmp_path = path.with_extension("new");
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;
    Ok(())
}

fn io_status(error: io::Error) -> StoreStatus {
    match error.kind() {
        io::ErrorKind::PermissionDenied => StoreStatus::AccessDenied,
        _ => StoreStatus::Io(error.to_string()),
    }
}
