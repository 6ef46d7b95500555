//! Base58Check address encoding.
//!
//! An address is `Base58Check(version ‖ RIPEMD-160(SHA-256(pubkey)))` with a
//! checksum of the first 4 bytes of double-SHA-256(version ‖ payload).
//! Version bytes: `0x00` mainnet, `0x6f` testnet (regtest shares testnet).
//!
//! The burn address (20 zero payload bytes) is the unspendable sink that
//! compensation outputs pay to. No public key hashes to it.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::{ADDRESS_VERSION_MAINNET, ADDRESS_VERSION_TESTNET};
use crate::crypto;
use crate::error::AddressError;

/// Length of the RIPEMD-160 payload.
pub const PAYLOAD_LEN: usize = 20;

/// Length of the Base58Check checksum.
const CHECKSUM_LEN: usize = 4;

/// Network identifier determining the address version byte and wire magic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Base58Check version byte for this network.
    pub fn address_version(&self) -> u8 {
        match self {
            Network::Mainnet => ADDRESS_VERSION_MAINNET,
            Network::Testnet | Network::Regtest => ADDRESS_VERSION_TESTNET,
        }
    }

    /// Look up the network for an address version byte.
    ///
    /// Testnet and regtest share a version byte; this resolves to testnet.
    pub fn from_address_version(version: u8) -> Result<Self, AddressError> {
        match version {
            ADDRESS_VERSION_MAINNET => Ok(Network::Mainnet),
            ADDRESS_VERSION_TESTNET => Ok(Network::Testnet),
            other => Err(AddressError::UnknownVersion(other)),
        }
    }
}

/// A CarbonChain address: version byte plus 20-byte pubkey hash.
///
/// Human-readable form is Base58Check. The canonical wire encoding is the
/// raw 21 bytes (version ‖ payload); see [`codec`](crate::codec).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    version: u8,
    payload: [u8; PAYLOAD_LEN],
}

impl Address {
    /// Construct from raw parts. The version byte is not checked here;
    /// decoding validates it.
    pub fn from_parts(version: u8, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self { version, payload }
    }

    /// Derive the address of a SEC1-encoded secp256k1 public key:
    /// `RIPEMD-160(SHA-256(pubkey))`.
    pub fn from_public_key(network: Network, public_key: &[u8]) -> Self {
        Self {
            version: network.address_version(),
            payload: crypto::hash160(public_key),
        }
    }

    /// The unspendable sink address compensation outputs burn to.
    pub fn burn(network: Network) -> Self {
        Self {
            version: network.address_version(),
            payload: [0u8; PAYLOAD_LEN],
        }
    }

    /// Whether this is the burn sink for its network.
    pub fn is_burn(&self) -> bool {
        self.payload == [0u8; PAYLOAD_LEN]
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn payload(&self) -> &[u8; PAYLOAD_LEN] {
        &self.payload
    }

    pub fn network(&self) -> Result<Network, AddressError> {
        Network::from_address_version(self.version)
    }

    /// Whether a public key hashes to this address.
    pub fn matches_public_key(&self, public_key: &[u8]) -> bool {
        crypto::hash160(public_key) == self.payload
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut data = Vec::with_capacity(1 + PAYLOAD_LEN + CHECKSUM_LEN);
        data.push(self.version);
        data.extend_from_slice(&self.payload);
        let checksum = crypto::sha256d(&data);
        data.extend_from_slice(&checksum.0[..CHECKSUM_LEN]);
        f.write_str(&bs58::encode(data).into_string())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = bs58::decode(s)
            .into_vec()
            .map_err(|_| AddressError::InvalidCharacter)?;
        if data.len() != 1 + PAYLOAD_LEN + CHECKSUM_LEN {
            return Err(AddressError::InvalidLength(data.len()));
        }
        let (body, checksum) = data.split_at(1 + PAYLOAD_LEN);
        let expected = crypto::sha256d(body);
        if checksum != &expected.0[..CHECKSUM_LEN] {
            return Err(AddressError::ChecksumMismatch);
        }
        let version = body[0];
        Network::from_address_version(version)?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&body[1..]);
        Ok(Self { version, payload })
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Validate an address string: length, alphabet, checksum, version byte.
pub fn is_valid_address(s: &str) -> Result<Address, AddressError> {
    s.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn round_trip_from_public_key() {
        let kp = KeyPair::from_secret_bytes([7u8; 32]).unwrap();
        let addr = Address::from_public_key(Network::Mainnet, &kp.public_key_bytes());
        let s = addr.to_string();
        let parsed: Address = s.parse().unwrap();
        assert_eq!(parsed, addr);
        assert!(addr.matches_public_key(&kp.public_key_bytes()));
    }

    #[test]
    fn mainnet_addresses_start_with_one() {
        // Version byte 0x00 encodes to a leading '1' in Base58Check.
        let addr = Address::from_parts(ADDRESS_VERSION_MAINNET, [0xAB; 20]);
        assert!(addr.to_string().starts_with('1'));
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let addr = Address::from_parts(ADDRESS_VERSION_MAINNET, [0xAB; 20]);
        let mut s = addr.to_string();
        // Flip the last character to another alphabet member.
        let last = s.pop().unwrap();
        s.push(if last == '2' { '3' } else { '2' });
        assert_eq!(s.parse::<Address>(), Err(AddressError::ChecksumMismatch));
    }

    #[test]
    fn bad_alphabet_rejected() {
        assert_eq!(
            "0OIl-not-base58".parse::<Address>(),
            Err(AddressError::InvalidCharacter),
        );
    }

    #[test]
    fn wrong_length_rejected() {
        // Valid Base58 but too short once decoded.
        let s = bs58::encode([1u8, 2, 3]).into_string();
        assert_eq!(s.parse::<Address>(), Err(AddressError::InvalidLength(3)));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut data = vec![0x42u8];
        data.extend_from_slice(&[0u8; 20]);
        let checksum = crate::crypto::sha256d(&data);
        data.extend_from_slice(&checksum.0[..4]);
        let s = bs58::encode(data).into_string();
        assert_eq!(s.parse::<Address>(), Err(AddressError::UnknownVersion(0x42)));
    }

    #[test]
    fn burn_address_detection() {
        assert!(Address::burn(Network::Mainnet).is_burn());
        assert!(!Address::from_parts(ADDRESS_VERSION_MAINNET, [1; 20]).is_burn());
    }

    #[test]
    fn testnet_regtest_share_version() {
        assert_eq!(
            Address::burn(Network::Testnet).version(),
            Address::burn(Network::Regtest).version(),
        );
    }

    #[test]
    fn serde_round_trip_as_string() {
        let addr = Address::from_parts(ADDRESS_VERSION_MAINNET, [0x55; 20]);
        let json = serde_json::to_string(&addr).unwrap();
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
