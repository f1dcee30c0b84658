//! Universal classification of opaque strings pasted or scanned by the user.
//!
//! Dispatch order: on-chain address (plain or `bitcoin:` URI), then
//! bech32/bech32m with a tag table, then the hex, base58 and base64 families.
//! Every input ends in exactly one [`ParsedEntity`] or a typed [`ParseError`].

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bech32::primitives::decode::{CharError, UncheckedHrpstring, UncheckedHrpstringError};
use bech32::{Bech32, Bech32m, Hrp};
use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::asset::{
    AssetRegistry, Authenticity, DecimalAmount, Fungible, Precision, SupplyMetrics, TokenAsset,
    MAX_PRECISION,
};

const URI_SCHEME: &str = "bitcoin:";
const NATIVE_PRECISION: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorKind {
    BadPrefix,
    BadChecksum,
    BadEncoding,
    BadPayload,
    UnsupportedCategory,
    Internal,
    MalformedStructuredPayload,
}

impl ParseErrorKind {
    /// Stable numeric status, zero being reserved for success.
    pub fn code(self) -> u8 {
        match self {
            ParseErrorKind::BadPrefix => 1,
            ParseErrorKind::BadChecksum => 2,
            ParseErrorKind::BadEncoding => 3,
            ParseErrorKind::BadPayload => 4,
            ParseErrorKind::UnsupportedCategory => 5,
            ParseErrorKind::Internal => 6,
            ParseErrorKind::MalformedStructuredPayload => 7,
        }
    }
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ParseErrorKind::BadPrefix => "bad prefix",
            ParseErrorKind::BadChecksum => "bad checksum",
            ParseErrorKind::BadEncoding => "bad encoding",
            ParseErrorKind::BadPayload => "bad payload",
            ParseErrorKind::UnsupportedCategory => "unsupported category",
            ParseErrorKind::Internal => "internal failure",
            ParseErrorKind::MalformedStructuredPayload => "malformed structured payload",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {details}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub details: String,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
        }
    }

    pub fn code(&self) -> u8 {
        self.kind.code()
    }
}

impl From<UncheckedHrpstringError> for ParseError {
    fn from(err: UncheckedHrpstringError) -> Self {
        let kind = match &err {
            UncheckedHrpstringError::Hrp(_) => ParseErrorKind::BadPrefix,
            UncheckedHrpstringError::Char(CharError::MissingSeparator) => ParseErrorKind::BadPrefix,
            UncheckedHrpstringError::Char(_) => ParseErrorKind::BadEncoding,
            #[allow(unreachable_patterns)]
            _ => ParseErrorKind::Internal,
        };
        ParseError::new(kind, err.to_string())
    }
}

/// Without a separator there is no prefix to read, whatever character the
/// decoder stumbled on first.
fn unprefixed_error(text: &str, err: UncheckedHrpstringError) -> ParseError {
    if text.contains('1') {
        ParseError::from(err)
    } else {
        ParseError::new(
            ParseErrorKind::BadPrefix,
            format!("No bech32 prefix separator: {}", err),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFamily {
    Hex,
    Base58,
    Base64,
    Bech32,
    Bech32m,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressInfo {
    pub address: String,
    pub network: Network,
    /// Whether the address belongs to the network the vault runs on.
    pub matches_network: bool,
    pub address_type: Option<String>,
    pub script_pubkey: String,
    pub witness_version: Option<u8>,
    /// Set when the input was a `bitcoin:` URI.
    pub uri: bool,
    pub amount: Option<u64>,
    pub label: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenesisInfo {
    pub asset: TokenAsset,
    /// The asset is already in the registry.
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceInfo {
    pub beneficiary: String,
    pub asset_id: String,
    pub asset_known: bool,
    pub amount_atoms: Option<u64>,
    /// Present only when the asset precision is known.
    pub amount: Option<DecimalAmount>,
    pub merchant: Option<String>,
    pub purpose: Option<String>,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Contract,
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierInfo {
    pub kind: IdentifierKind,
    pub value: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsignmentInfo {
    pub raw: String,
    pub size: usize,
}

/// Decoded data the parser could not attribute to a known category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnknownInfo {
    pub family: EncodingFamily,
    pub prefix: Option<String>,
    /// Decoded payload, hex encoded.
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ParsedEntity {
    Address(AddressInfo),
    Genesis(GenesisInfo),
    Invoice(InvoiceInfo),
    Identifier(IdentifierInfo),
    Consignment(ConsignmentInfo),
    Unknown(UnknownInfo),
}

#[derive(Debug, Deserialize)]
struct GenesisPayload {
    id: String,
    ticker: String,
    name: String,
    precision: u8,
    #[serde(default)]
    known_issued: Option<u64>,
    #[serde(default)]
    max_issuable: Option<u64>,
    #[serde(default)]
    issuer: Option<String>,
    #[serde(default)]
    ricardian_contract: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InvoicePayload {
    beneficiary: String,
    #[serde(default)]
    asset_id: Option<String>,
    #[serde(default)]
    amount: Option<u64>,
    #[serde(default)]
    merchant: Option<String>,
    #[serde(default)]
    purpose: Option<String>,
}

/// Parser bound to an asset registry for context.
pub struct UniversalParser<'a> {
    registry: &'a AssetRegistry,
    network: Network,
}

impl<'a> UniversalParser<'a> {
    pub fn new(registry: &'a AssetRegistry) -> Self {
        Self {
            registry,
            network: registry.network(),
        }
    }

    pub fn parse(&self, input: &str) -> Result<ParsedEntity, ParseError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ParseError::new(ParseErrorKind::BadEncoding, "Empty input"));
        }

        if let Some(query) = strip_uri_scheme(text) {
            return self.parse_uri(query).map(ParsedEntity::Address);
        }
        if let Some(info) = self.parse_address(text) {
            return Ok(ParsedEntity::Address(info));
        }

        match UncheckedHrpstring::new(text) {
            Ok(unchecked) => self.parse_prefixed(text, unchecked),
            Err(err) => fallback_family(text).ok_or_else(|| unprefixed_error(text, err)),
        }
    }

    fn parse_address(&self, text: &str) -> Option<AddressInfo> {
        let unchecked = Address::<NetworkUnchecked>::from_str(text).ok()?;
        let network = self.detect_network(&unchecked)?;
        let address = unchecked.assume_checked();
        let script = address.script_pubkey();

        Some(AddressInfo {
            address: address.to_string(),
            network,
            matches_network: network == self.network,
            address_type: address.address_type().map(|kind| kind.to_string()),
            script_pubkey: script.to_hex_string(),
            witness_version: script.witness_version().map(|version| version.to_num()),
            uri: false,
            amount: None,
            label: None,
            message: None,
        })
    }

    /// The vault network wins when the encoding is shared between networks.
    fn detect_network(&self, address: &Address<NetworkUnchecked>) -> Option<Network> {
        if address.is_valid_for_network(self.network) {
            return Some(self.network);
        }
        [Network::Bitcoin, Network::Testnet, Network::Regtest]
            .into_iter()
            .find(|network| address.is_valid_for_network(*network))
    }

    fn parse_uri(&self, rest: &str) -> Result<AddressInfo, ParseError> {
        let (target, query) = match rest.split_once('?') {
            Some((target, query)) => (target, Some(query)),
            None => (rest, None),
        };
        let mut info = self.parse_address(target).ok_or_else(|| {
            ParseError::new(
                ParseErrorKind::BadPayload,
                format!("URI does not carry a valid address: {}", target),
            )
        })?;
        info.uri = true;

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = percent_decode(value)?;
            match key.to_ascii_lowercase().as_str() {
                "amount" => {
                    let amount = DecimalAmount::from_str(&value).map_err(|e| {
                        ParseError::new(ParseErrorKind::BadPayload, format!("Invalid amount: {}", e))
                    })?;
                    let precision = Precision::new(NATIVE_PRECISION)
                        .map_err(|e| ParseError::new(ParseErrorKind::Internal, e.to_string()))?;
                    let atoms = precision.amount_to_atoms(&amount).map_err(|e| {
                        ParseError::new(ParseErrorKind::BadPayload, format!("Invalid amount: {}", e))
                    })?;
                    info.amount = Some(atoms);
                }
                "label" => info.label = Some(value),
                "message" => info.message = Some(value),
                other if other.starts_with("req-") => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnsupportedCategory,
                        format!("Required URI parameter {} is not supported", other),
                    ));
                }
                _ => log::debug!("Ignoring URI parameter {}", key),
            }
        }

        Ok(info)
    }

    fn parse_prefixed(
        &self,
        text: &str,
        unchecked: UncheckedHrpstring<'_>,
    ) -> Result<ParsedEntity, ParseError> {
        let hrp = unchecked.hrp().to_lowercase();

        // Lightning invoices routinely exceed the bech32 length limit, so
        // they are recognised before the checksum is looked at.
        if is_lightning_prefix(&hrp) {
            return Err(ParseError::new(
                ParseErrorKind::UnsupportedCategory,
                "Lightning invoices are not supported",
            ));
        }

        let family = if unchecked.has_valid_checksum::<Bech32m>() {
            EncodingFamily::Bech32m
        } else if unchecked.has_valid_checksum::<Bech32>() {
            EncodingFamily::Bech32
        } else if is_hex(text) {
            return Ok(unknown(EncodingFamily::Hex, None, text.to_ascii_lowercase()));
        } else {
            return Err(ParseError::new(
                ParseErrorKind::BadChecksum,
                format!("Invalid checksum for prefix {}", hrp),
            ));
        };

        let payload: Vec<u8> = match family {
            EncodingFamily::Bech32m => unchecked.remove_checksum::<Bech32m>().byte_iter().collect(),
            _ => unchecked.remove_checksum::<Bech32>().byte_iter().collect(),
        };

        match hrp.as_str() {
            "genesis" => self.parse_genesis(text, &payload).map(ParsedEntity::Genesis),
            "invoice" => self.parse_invoice(text, &payload).map(ParsedEntity::Invoice),
            "rgb" => Ok(identifier(IdentifierKind::Contract, text, &payload)),
            "sch" => Ok(identifier(IdentifierKind::Schema, text, &payload)),
            "consignment" => Ok(ParsedEntity::Consignment(ConsignmentInfo {
                raw: text.to_string(),
                size: payload.len(),
            })),
            "bc" | "tb" | "bcrt" => Err(ParseError::new(
                ParseErrorKind::BadPayload,
                "Segwit prefix with a payload that is not a valid address",
            )),
            _ => Ok(unknown(family, Some(hrp), hex::encode(&payload))),
        }
    }

    fn parse_genesis(&self, text: &str, payload: &[u8]) -> Result<GenesisInfo, ParseError> {
        let genesis: GenesisPayload = serde_json::from_slice(payload).map_err(|e| {
            ParseError::new(
                ParseErrorKind::MalformedStructuredPayload,
                format!("Genesis data is not readable: {}", e),
            )
        })?;
        if genesis.precision > MAX_PRECISION {
            return Err(ParseError::new(
                ParseErrorKind::BadPayload,
                format!("Genesis precision {} is out of range", genesis.precision),
            ));
        }
        let precision = Precision::new(genesis.precision)
            .map_err(|e| ParseError::new(ParseErrorKind::BadPayload, e.to_string()))?;

        let known = self.registry.contains(&genesis.id);
        let asset = TokenAsset::new(genesis.id, genesis.ticker, genesis.name, precision)
            .with_supply(SupplyMetrics {
                known_issued: genesis.known_issued,
                max_issuable: genesis.max_issuable,
                ..SupplyMetrics::default()
            })
            .with_authenticity(Authenticity {
                issuer: genesis.issuer,
                verified: false,
                ricardian_contract: genesis.ricardian_contract,
            })
            .with_genesis(text);

        Ok(GenesisInfo { asset, known })
    }

    fn parse_invoice(&self, text: &str, payload: &[u8]) -> Result<InvoiceInfo, ParseError> {
        let invoice: InvoicePayload = serde_json::from_slice(payload).map_err(|e| {
            ParseError::new(
                ParseErrorKind::MalformedStructuredPayload,
                format!("Invoice data is not readable: {}", e),
            )
        })?;

        let asset_id = invoice
            .asset_id
            .unwrap_or_else(|| self.registry.native_id().to_string());
        let asset = self.registry.get(&asset_id);

        Ok(InvoiceInfo {
            beneficiary: invoice.beneficiary,
            asset_known: asset.is_some(),
            amount: asset
                .zip(invoice.amount)
                .map(|(asset, atoms)| asset.amount_from_atoms(atoms)),
            amount_atoms: invoice.amount,
            asset_id,
            merchant: invoice.merchant,
            purpose: invoice.purpose,
            raw: text.to_string(),
        })
    }
}

/// Encode `data` as bech32m under the given prefix.
pub fn encode_bech32m(prefix: &str, data: &[u8]) -> Result<String, ParseError> {
    let hrp = Hrp::parse(prefix)
        .map_err(|e| ParseError::new(ParseErrorKind::BadPrefix, e.to_string()))?;
    bech32::encode::<Bech32m>(hrp, data)
        .map_err(|e| ParseError::new(ParseErrorKind::Internal, e.to_string()))
}

fn strip_uri_scheme(text: &str) -> Option<&str> {
    let scheme = text.get(..URI_SCHEME.len())?;
    if scheme.eq_ignore_ascii_case(URI_SCHEME) {
        text.get(URI_SCHEME.len()..)
    } else {
        None
    }
}

fn is_lightning_prefix(hrp: &str) -> bool {
    ["lnbcrt", "lntbs", "lnbc", "lntb"]
        .iter()
        .any(|prefix| hrp.starts_with(prefix))
}

fn is_hex(text: &str) -> bool {
    text.len() % 2 == 0 && text.chars().all(|c| c.is_ascii_hexdigit())
}

fn fallback_family(text: &str) -> Option<ParsedEntity> {
    if is_hex(text) {
        return hex::decode(text)
            .ok()
            .map(|bytes| unknown(EncodingFamily::Hex, None, hex::encode(bytes)));
    }
    if let Ok(bytes) = bs58::decode(text).into_vec() {
        return Some(unknown(EncodingFamily::Base58, None, hex::encode(bytes)));
    }
    if let Ok(bytes) = BASE64.decode(text) {
        return Some(unknown(EncodingFamily::Base64, None, hex::encode(bytes)));
    }
    None
}

fn unknown(family: EncodingFamily, prefix: Option<String>, payload: String) -> ParsedEntity {
    ParsedEntity::Unknown(UnknownInfo {
        family,
        prefix,
        payload,
    })
}

fn identifier(kind: IdentifierKind, text: &str, payload: &[u8]) -> ParsedEntity {
    ParsedEntity::Identifier(IdentifierInfo {
        kind,
        value: text.to_ascii_lowercase(),
        payload: hex::encode(payload),
    })
}

fn percent_decode(value: &str) -> Result<String, ParseError> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escaped = bytes
                    .get(i + 1..i + 3)
                    .and_then(|pair| std::str::from_utf8(pair).ok())
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| {
                        ParseError::new(ParseErrorKind::BadEncoding, "Invalid percent escape")
                    })?;
                decoded.push(escaped);
                i += 3;
            }
            b'+' => {
                decoded.push(b' ');
                i += 1;
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(decoded)
        .map_err(|_| ParseError::new(ParseErrorKind::BadEncoding, "URI parameter is not UTF-8"))
}
