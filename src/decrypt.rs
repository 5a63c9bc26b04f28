//! Decryption collaborator used by workers.
//!
//! Workers only depend on the [`Decryptor`] call contract: ciphertext in,
//! plaintext or a typed error out. [`TweetCipher`] is the transform shipped
//! with the binary.

use thiserror::Error;

/// Errors reported by a [`Decryptor`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// The ciphertext contains a character outside the cipher alphabet.
    #[error("Invalid character {character:?} at position {position}")]
    InvalidCharacter { character: char, position: usize },

    /// A working buffer could not be allocated.
    #[error("Memory allocation failed")]
    ResourceExhausted,
}

/// Deterministic, side-effect free ciphertext to plaintext transform.
pub trait Decryptor: Send + Sync {
    /// Decrypts one line of ciphertext (without its line terminator).
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError>;
}

/// Symbols of the cipher alphabet, indexed by their numeric value.
const ALPHABET: &[u8; 41] = b" abcdefghijklmnopqrstuvwxyz#.,'!?()-:$/&\\";

const BASE: u64 = ALPHABET.len() as u64;
const GROUP_LEN: usize = 6;
/// Every `FILLER_PERIOD`-th ciphertext character carries no data.
const FILLER_PERIOD: usize = 8;

const MODULUS: u64 = 4_294_434_817;
const PRIVATE_EXPONENT: u64 = 1_921_821_779;

/// RSA-style block cipher over a 41-symbol alphabet.
///
/// Every 8th character is discarded, the rest is read in groups of six
/// base-41 digits and each group value `C` maps to `C^d mod n`, written back
/// with the group's original length.
#[derive(Debug, Clone, Copy, Default)]
pub struct TweetCipher;

impl TweetCipher {
    pub fn new() -> Self {
        Self
    }

    fn symbol_value(character: char) -> Option<u64> {
        if !character.is_ascii() {
            return None;
        }
        ALPHABET
            .iter()
            .position(|&b| b == character as u8)
            .map(|i| i as u64)
    }

    fn decrypt_group(values: &[u64], out: &mut String) {
        let mut cipher_value = 0u64;
        for (k, value) in values.iter().enumerate() {
            cipher_value += value * BASE.pow((GROUP_LEN - 1 - k) as u32);
        }

        let plain = mod_pow(cipher_value, PRIVATE_EXPONENT, MODULUS);

        for k in 0..values.len() {
            let digit = (plain / BASE.pow((GROUP_LEN - 1 - k) as u32)) % BASE;
            out.push(ALPHABET[digit as usize] as char);
        }
    }
}

impl Decryptor for TweetCipher {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let mut values: Vec<u64> = Vec::new();
        values
            .try_reserve(ciphertext.len())
            .map_err(|_| DecryptError::ResourceExhausted)?;

        for (position, character) in ciphertext.chars().enumerate() {
            if (position + 1) % FILLER_PERIOD == 0 {
                continue;
            }
            let value = Self::symbol_value(character).ok_or(DecryptError::InvalidCharacter {
                character,
                position,
            })?;
            values.push(value);
        }

        let mut plaintext = String::new();
        plaintext
            .try_reserve(values.len())
            .map_err(|_| DecryptError::ResourceExhausted)?;

        for group in values.chunks(GROUP_LEN) {
            Self::decrypt_group(group, &mut plaintext);
        }

        Ok(plaintext)
    }
}

fn mod_pow(base: u64, mut exponent: u64, modulus: u64) -> u64 {
    let modulus = modulus as u128;
    let mut base = base as u128 % modulus;
    let mut result = 1u128;

    while exponent > 0 {
        if exponent & 1 == 1 {
            result = result * base % modulus;
        }
        base = base * base % modulus;
        exponent >>= 1;
    }

    result as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrypts_known_tweet() {
        let cipher = TweetCipher::new();
        assert_eq!(cipher.decrypt("txdgaclx?xkbq").unwrap(), "hello world!");
    }

    #[test]
    fn test_filler_positions_are_ignored() {
        let cipher = TweetCipher::new();
        // Position 7 is filler, so even a symbol outside the alphabet is fine.
        assert_eq!(cipher.decrypt("txdgacl~?xkbq").unwrap(), "hello world!");
    }

    #[test]
    fn test_empty_line() {
        assert_eq!(TweetCipher::new().decrypt("").unwrap(), "");
    }

    #[test]
    fn test_invalid_character() {
        let err = TweetCipher::new().decrypt("txdGaclx").unwrap_err();
        assert_eq!(
            err,
            DecryptError::InvalidCharacter {
                character: 'G',
                position: 3
            }
        );
    }

    #[test]
    fn test_non_ascii_is_invalid() {
        let err = TweetCipher::new().decrypt("é").unwrap_err();
        assert!(matches!(err, DecryptError::InvalidCharacter { position: 0, .. }));
    }

    #[test]
    fn test_mod_pow() {
        assert_eq!(mod_pow(2, 10, 1_000_000), 1024);
        assert_eq!(mod_pow(MODULUS + 3, 1, MODULUS), 3);
        assert_eq!(mod_pow(7, 0, 13), 1);
    }
}
