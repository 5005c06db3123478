//! Secret kinds and their binary payload layouts
//!
//! The kind tag lives in the catalog record; the payload layout lives inside
//! the encrypted blob. `Binary` blobs are opaque. Structured kinds implement
//! [`SecretPayload`] and are decoded, validated and rendered on read.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{VaultError, VaultResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Binary,
    BankCard,
    LoginPassword,
    /// A tag written by a newer client. Read back as raw bytes.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecretKind::Binary => "binary",
            SecretKind::BankCard => "card",
            SecretKind::LoginPassword => "logpass",
            SecretKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Encode/decode/validate capability of a structured secret kind.
pub trait SecretPayload: Sized + fmt::Display {
    const KIND: SecretKind;

    fn encode(&self) -> Zeroizing<Vec<u8>>;

    fn decode(bytes: &[u8]) -> VaultResult<Self>;

    fn validate(&self) -> VaultResult<()>;
}

/// What to store: an opaque stream or one of the structured kinds.
pub enum Secret<'a> {
    Binary(&'a mut dyn Read),
    BankCard(BankCard),
    LoginPassword(LoginPassword),
}

impl Secret<'_> {
    pub fn kind(&self) -> SecretKind {
        match self {
            Secret::Binary(_) => SecretKind::Binary,
            Secret::BankCard(_) => BankCard::KIND,
            Secret::LoginPassword(_) => LoginPassword::KIND,
        }
    }
}

// ── Bank card ─────────────────────────────────────────────────────────────

const CARD_DIGITS: usize = 16;

/// A 16-digit card number stored as ASCII digits.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BankCard {
    digits: [u8; CARD_DIGITS],
}

impl BankCard {
    /// Parse a card number, allowing spaces and hyphens between digits.
    pub fn parse(number: &str) -> VaultResult<Self> {
        let mut digits = [0u8; CARD_DIGITS];
        let mut n = 0;
        for c in number.bytes() {
            match c {
                b'0'..=b'9' => {
                    if n == CARD_DIGITS {
                        return Err(VaultError::Validation(
                            "card number has more than 16 digits".into(),
                        ));
                    }
                    digits[n] = c;
                    n += 1;
                }
                b' ' | b'-' => {}
                _ => {
                    return Err(VaultError::Validation(format!(
                        "unexpected character {:?} in card number",
                        c as char
                    )))
                }
            }
        }
        if n != CARD_DIGITS {
            return Err(VaultError::Validation(format!(
                "card number has {n} digits, expected 16"
            )));
        }
        Ok(Self { digits })
    }

    /// Luhn checksum over the 16 digits.
    fn luhn_ok(&self) -> bool {
        let parity = CARD_DIGITS % 2;
        let sum: u32 = self
            .digits
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let mut digit = u32::from(d - b'0');
                if i % 2 == parity {
                    digit *= 2;
                    if digit > 9 {
                        digit -= 9;
                    }
                }
                digit
            })
            .sum();
        sum % 10 == 0
    }
}

impl SecretPayload for BankCard {
    const KIND: SecretKind = SecretKind::BankCard;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.digits.to_vec())
    }

    fn decode(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() != CARD_DIGITS || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(VaultError::Validation("card payload is corrupted".into()));
        }
        let mut digits = [0u8; CARD_DIGITS];
        digits.copy_from_slice(bytes);
        Ok(Self { digits })
    }

    fn validate(&self) -> VaultResult<()> {
        if self.luhn_ok() {
            Ok(())
        } else {
            Err(VaultError::Validation("bank card number is invalid".into()))
        }
    }
}

impl fmt::Display for BankCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.digits.chunks(4).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            for &d in group {
                write!(f, "{}", d as char)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BankCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BankCard([REDACTED])")
    }
}

// ── Login / password ──────────────────────────────────────────────────────

/// Encoded as two u32 big-endian length-prefixed byte strings.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct LoginPassword {
    username: String,
    password: String,
}

impl LoginPassword {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

fn take_field<'a>(data: &mut &'a [u8], what: &str) -> VaultResult<&'a [u8]> {
    let corrupted = || VaultError::Validation(format!("{what} is corrupted"));
    let bytes: &'a [u8] = *data;
    if bytes.len() < 4 {
        return Err(corrupted());
    }
    let (len, rest) = bytes.split_at(4);
    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() < len {
        return Err(corrupted());
    }
    let (field, rest) = rest.split_at(len);
    *data = rest;
    Ok(field)
}

impl SecretPayload for LoginPassword {
    const KIND: SecretKind = SecretKind::LoginPassword;

    fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(8 + self.username.len() + self.password.len());
        out.extend_from_slice(&(self.username.len() as u32).to_be_bytes());
        out.extend_from_slice(self.username.as_bytes());
        out.extend_from_slice(&(self.password.len() as u32).to_be_bytes());
        out.extend_from_slice(self.password.as_bytes());
        Zeroizing::new(out)
    }

    fn decode(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() < 8 {
            return Err(VaultError::Validation("login payload is too short".into()));
        }
        let mut rest = bytes;
        let username = take_field(&mut rest, "username")?;
        let password = take_field(&mut rest, "password")?;
        let utf8 = |b: &[u8], what: &str| {
            String::from_utf8(b.to_vec())
                .map_err(|_| VaultError::Validation(format!("{what} is not valid UTF-8")))
        };
        Ok(Self {
            username: utf8(username, "username")?,
            password: utf8(password, "password")?,
        })
    }

    fn validate(&self) -> VaultResult<()> {
        if self.username.trim().is_empty() {
            return Err(VaultError::Validation("username must not be blank".into()));
        }
        if self.password.trim().is_empty() {
            return Err(VaultError::Validation("password must not be blank".into()));
        }
        Ok(())
    }
}

impl fmt::Display for LoginPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.username, self.password)
    }
}

impl fmt::Debug for LoginPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginPassword")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
