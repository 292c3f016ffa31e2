//! c32check address encoding.
//!
//! Addresses are the c32check rendering of a one-byte network/keying
//! version followed by a 20-byte signer hash: `'S'`, the version encoded
//! as one c32 digit, then the c32 encoding of `data ‖ checksum` where
//! `checksum = sha256(sha256(version ‖ data))[..4]`.

use sha2::{Digest, Sha256};

use crate::error::DecodeError;

/// Crockford-style alphabet used by c32 (no I, L, O, U).
const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const ADDRESS_VERSION_MAINNET_SINGLESIG: u8 = 22;
pub const ADDRESS_VERSION_MAINNET_MULTISIG: u8 = 20;
pub const ADDRESS_VERSION_TESTNET_SINGLESIG: u8 = 26;
pub const ADDRESS_VERSION_TESTNET_MULTISIG: u8 = 21;

/// Origin hash modes from the transaction wire format.
pub const HASH_MODE_P2PKH: u8 = 0x00;
pub const HASH_MODE_P2SH: u8 = 0x01;
pub const HASH_MODE_P2WPKH_P2SH: u8 = 0x02;
pub const HASH_MODE_P2WSH_P2SH: u8 = 0x03;

/// The network an address version encodes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Map a spending-condition hash mode to this network's address version.
    /// P2PKH keys get the single-sig version; the script modes get multi-sig.
    pub fn address_version(self, hash_mode: u8) -> Result<u8, DecodeError> {
        match (self, hash_mode) {
            (Self::Mainnet, HASH_MODE_P2PKH) => Ok(ADDRESS_VERSION_MAINNET_SINGLESIG),
            (Self::Mainnet, HASH_MODE_P2SH | HASH_MODE_P2WPKH_P2SH | HASH_MODE_P2WSH_P2SH) => {
                Ok(ADDRESS_VERSION_MAINNET_MULTISIG)
            }
            (Self::Testnet, HASH_MODE_P2PKH) => Ok(ADDRESS_VERSION_TESTNET_SINGLESIG),
            (Self::Testnet, HASH_MODE_P2SH | HASH_MODE_P2WPKH_P2SH | HASH_MODE_P2WSH_P2SH) => {
                Ok(ADDRESS_VERSION_TESTNET_MULTISIG)
            }
            (_, hash_mode) => Err(DecodeError::UnknownHashMode {
                hash_mode,
                offset: 0,
            }),
        }
    }
}

/// Encode `version ‖ hash160` as a textual c32check address.
pub fn c32_address(version: u8, hash160: &[u8; 20]) -> Result<String, DecodeError> {
    if version >= 32 {
        return Err(DecodeError::InvalidAddressVersion { version });
    }
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(hash160);
    payload.extend_from_slice(&checksum(version, hash160));

    let mut out = String::with_capacity(41);
    out.push('S');
    out.push(C32_ALPHABET[version as usize] as char);
    out.push_str(&c32_encode(&payload));
    Ok(out)
}

/// c32check checksum: first four bytes of sha256(sha256(version ‖ data)).
fn checksum(version: u8, data: &[u8]) -> [u8; 4] {
    let mut hasher = Sha256::new();
    hasher.update([version]);
    hasher.update(data);
    let once = hasher.finalize();
    let twice = Sha256::digest(once);
    let mut sum = [0u8; 4];
    sum.copy_from_slice(&twice[..4]);
    sum
}

/// Base-32 encode with the c32 alphabet, preserving leading zero bytes as
/// leading `'0'` digits.
fn c32_encode(data: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 8 / 5 + 1);
    let mut carry: u32 = 0;
    let mut carry_bits: u32 = 0;

    for byte in data.iter().rev() {
        carry |= (*byte as u32) << carry_bits;
        carry_bits += 8;
        while carry_bits >= 5 {
            digits.push(C32_ALPHABET[(carry & 0x1f) as usize]);
            carry >>= 5;
            carry_bits -= 5;
        }
    }
    if carry_bits > 0 {
        digits.push(C32_ALPHABET[(carry & 0x1f) as usize]);
    }

    // The loop above emits digits little-end first; excess zero digits at
    // the big end collapse, then one '0' is restored per leading zero byte.
    while digits.last() == Some(&b'0') {
        digits.pop();
    }
    for byte in data {
        if *byte == 0 {
            digits.push(b'0');
        } else {
            break;
        }
    }

    digits.reverse();
    String::from_utf8(digits).expect("alphabet is ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZERO_HASH: [u8; 20] = [0u8; 20];

    #[test]
    fn burn_address_vectors() {
        // The all-zero hash160 yields the well-known burn addresses.
        assert_eq!(
            c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &ZERO_HASH).unwrap(),
            "SP000000000000000000002Q6VF78"
        );
        assert_eq!(
            c32_address(ADDRESS_VERSION_TESTNET_SINGLESIG, &ZERO_HASH).unwrap(),
            "ST000000000000000000002AMW42H"
        );
        assert_eq!(
            c32_address(ADDRESS_VERSION_MAINNET_MULTISIG, &ZERO_HASH).unwrap(),
            "SM0000000000000000000062QV6X"
        );
        assert_eq!(
            c32_address(ADDRESS_VERSION_TESTNET_MULTISIG, &ZERO_HASH).unwrap(),
            "SN000000000000000000003YDHWKJ"
        );
    }

    #[test]
    fn nonzero_hash_vectors() {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hex::decode("89f5fd1f719e4449c980de38e3504be6770a2698").unwrap());
        assert_eq!(
            c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &hash).unwrap(),
            "SP24ZBZ8ZE6F48JE9G3F3HRTG9FK7E2H6K2QZ3Q1K"
        );
        assert_eq!(
            c32_address(ADDRESS_VERSION_TESTNET_SINGLESIG, &hash).unwrap(),
            "ST24ZBZ8ZE6F48JE9G3F3HRTG9FK7E2H6K2CABFF1"
        );
    }

    #[test]
    fn version_out_of_range_rejected() {
        assert!(matches!(
            c32_address(32, &ZERO_HASH),
            Err(DecodeError::InvalidAddressVersion { version: 32 })
        ));
    }

    #[test]
    fn hash_mode_to_version() {
        assert_eq!(
            Network::Mainnet.address_version(HASH_MODE_P2PKH).unwrap(),
            ADDRESS_VERSION_MAINNET_SINGLESIG
        );
        assert_eq!(
            Network::Mainnet.address_version(HASH_MODE_P2WSH_P2SH).unwrap(),
            ADDRESS_VERSION_MAINNET_MULTISIG
        );
        assert_eq!(
            Network::Testnet.address_version(HASH_MODE_P2SH).unwrap(),
            ADDRESS_VERSION_TESTNET_MULTISIG
        );
        assert!(Network::Mainnet.address_version(0x04).is_err());
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[7u8; 20]).unwrap();
        let b = c32_address(ADDRESS_VERSION_MAINNET_SINGLESIG, &[7u8; 20]).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("SP"));
    }
}
