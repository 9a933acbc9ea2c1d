//! 256-bit Prime-Scale Field Arithmetic
//!
//! Integers reduced modulo `MODULUS = 2^256 - 189`, the arithmetic domain for
//! commitments, blinding scalars and hash-to-field mapping.
//!
//! ## Representation
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  FieldElement: 4 x u64 limbs, little-endian                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  limbs[0] = bits   0..64   (least significant)              │
//! │  limbs[3] = bits 192..256  (most significant)               │
//! │                                                             │
//! │  Reduction: 2^256 ≡ 189 (mod MODULUS), so a 512-bit         │
//! │  product hi·2^256 + lo folds to hi·189 + lo                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Values decoded from the wire are kept as-is (possibly `>= MODULUS`) so
//! that verifiers can range-check them; every arithmetic result is canonical.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul};
use std::str::FromStr;

use rand::RngCore;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::hash::hash_bytes;

/// `2^256 - MODULUS`.
pub const MODULUS_GAP: u64 = 189;

/// Little-endian limbs of `2^256 - 189`.
const MODULUS_LIMBS: [u64; 4] = [u64::MAX - (MODULUS_GAP - 1), u64::MAX, u64::MAX, u64::MAX];

/// Largest power of ten that fits in a u64 limb.
const DECIMAL_CHUNK: u64 = 10_000_000_000_000_000_000;

/// Errors parsing a field element from text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldParseError {
    /// Empty input.
    #[error("empty field element")]
    Empty,
    /// Non-digit character.
    #[error("invalid digit '{0}' in field element")]
    InvalidDigit(char),
    /// Value does not fit in 256 bits.
    #[error("field element exceeds 256 bits")]
    Overflow,
}

/// An integer of at most 256 bits, canonical (`< MODULUS`) after any arithmetic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FieldElement {
    limbs: [u64; 4],
}

impl FieldElement {
    /// Zero.
    pub const ZERO: Self = Self { limbs: [0; 4] };

    /// One.
    pub const ONE: Self = Self { limbs: [1, 0, 0, 0] };

    /// The modulus itself (not a canonical element).
    pub const MODULUS: Self = Self { limbs: MODULUS_LIMBS };

    /// Create from a u64.
    pub const fn from_u64(value: u64) -> Self {
        Self { limbs: [value, 0, 0, 0] }
    }

    /// Interpret 32 big-endian bytes without reduction.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        Self { limbs }
    }

    /// Interpret 32 big-endian bytes, reduced into the field.
    pub fn from_be_bytes_reduced(bytes: &[u8; 32]) -> Self {
        Self::from_be_bytes(bytes).reduce_once()
    }

    /// Big-endian byte encoding.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, limb) in self.limbs.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            out[start..start + 8].copy_from_slice(&limb.to_be_bytes());
        }
        out
    }

    /// Is this zero?
    pub fn is_zero(&self) -> bool {
        self.limbs == [0; 4]
    }

    /// Is this strictly below the modulus?
    pub fn is_canonical(&self) -> bool {
        *self < Self::MODULUS
    }

    /// Draw a uniformly distributed element in `[1, MODULUS)`.
    pub fn random_nonzero<R: RngCore + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rng.fill_bytes(&mut bytes);
            let candidate = Self::from_be_bytes(&bytes);
            // Rejection keeps the draw uniform; the reject band is 189 values wide.
            if candidate.is_canonical() && !candidate.is_zero() {
                return candidate;
            }
        }
    }

    /// `0x`-prefixed hex without leading zeros.
    pub fn to_hex(&self) -> String {
        format!("{:#x}", self)
    }

    /// Subtract the modulus once if `self >= MODULUS`.
    ///
    /// Any 256-bit value is below `2 * MODULUS`, so one subtraction suffices.
    fn reduce_once(self) -> Self {
        if self.is_canonical() {
            return self;
        }
        let (limbs, _) = sub_limbs(&self.limbs, &MODULUS_LIMBS);
        Self { limbs }
    }

    /// Fold a 512-bit product into the field.
    fn reduce_wide(wide: [u64; 8]) -> Self {
        let gap = MODULUS_GAP as u128;

        // lo + hi * 189, at most 2^264.
        let mut folded = [0u64; 5];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let t = wide[i] as u128 + (wide[i + 4] as u128) * gap + carry;
            folded[i] = t as u64;
            carry = t >> 64;
        }
        folded[4] = carry as u64;

        // Fold the top limb again, at most 2^256 + 2^16.
        let mut limbs = [0u64; 4];
        let mut carry: u128 = (folded[4] as u128) * gap;
        for i in 0..4 {
            let t = folded[i] as u128 + carry;
            limbs[i] = t as u64;
            carry = t >> 64;
        }
        if carry != 0 {
            // Wrapped past 2^256; the remainder is tiny, add 2^256 mod p.
            add_small(&mut limbs, MODULUS_GAP);
        }

        Self { limbs }.reduce_once()
    }
}

/// Map arbitrary bytes to the field: `SHA-256(data)` big-endian, mod MODULUS.
pub fn hash_to_field(data: &[u8]) -> FieldElement {
    FieldElement::from_be_bytes_reduced(&hash_bytes(data))
}

// =============================================================================
// LIMB HELPERS
// =============================================================================

fn sub_limbs(a: &[u64; 4], b: &[u64; 4]) -> ([u64; 4], bool) {
    let mut out = [0u64; 4];
    let mut borrow = false;
    for i in 0..4 {
        let (d1, b1) = a[i].overflowing_sub(b[i]);
        let (d2, b2) = d1.overflowing_sub(borrow as u64);
        out[i] = d2;
        borrow = b1 || b2;
    }
    (out, borrow)
}

/// Add a small value in place; returns true on overflow past 2^256.
fn add_small(limbs: &mut [u64; 4], value: u64) -> bool {
    let mut carry = value;
    for limb in limbs.iter_mut() {
        if carry == 0 {
            return false;
        }
        let (sum, overflow) = limb.overflowing_add(carry);
        *limb = sum;
        carry = overflow as u64;
    }
    carry != 0
}

/// `limbs = limbs * mul + add`; returns true on overflow past 2^256.
fn mul_small_add(limbs: &mut [u64; 4], mul: u64, add: u64) -> bool {
    let mut carry = add as u128;
    for limb in limbs.iter_mut() {
        let t = (*limb as u128) * (mul as u128) + carry;
        *limb = t as u64;
        carry = t >> 64;
    }
    carry != 0
}

/// `limbs /= div`, returning the remainder.
fn div_rem_small(limbs: &mut [u64; 4], div: u64) -> u64 {
    let mut rem: u128 = 0;
    for limb in limbs.iter_mut().rev() {
        let cur = (rem << 64) | *limb as u128;
        *limb = (cur / div as u128) as u64;
        rem = cur % div as u128;
    }
    rem as u64
}

// =============================================================================
// ARITHMETIC
// =============================================================================

impl Add for FieldElement {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        let a = self.reduce_once();
        let b = rhs.reduce_once();

        let mut limbs = [0u64; 4];
        let mut carry: u128 = 0;
        for i in 0..4 {
            let t = a.limbs[i] as u128 + b.limbs[i] as u128 + carry;
            limbs[i] = t as u64;
            carry = t >> 64;
        }
        if carry != 0 {
            // a + b < 2p, so the wrapped part is far from 2^256.
            add_small(&mut limbs, MODULUS_GAP);
        }
        Self { limbs }.reduce_once()
    }
}

impl Mul for FieldElement {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let mut wide = [0u64; 8];
        for i in 0..4 {
            let mut carry: u128 = 0;
            for j in 0..4 {
                let t = (self.limbs[i] as u128) * (rhs.limbs[j] as u128)
                    + wide[i + j] as u128
                    + carry;
                wide[i + j] = t as u64;
                carry = t >> 64;
            }
            wide[i + 4] = carry as u64;
        }
        Self::reduce_wide(wide)
    }
}

impl PartialOrd for FieldElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldElement {
    fn cmp(&self, other: &Self) -> Ordering {
        self.limbs.iter().rev().cmp(other.limbs.iter().rev())
    }
}

// =============================================================================
// TEXT ENCODING
// =============================================================================

impl fmt::Display for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        let mut rest = self.limbs;
        let mut chunks = Vec::with_capacity(4);
        while rest != [0; 4] {
            chunks.push(div_rem_small(&mut rest, DECIMAL_CHUNK));
        }
        let mut iter = chunks.iter().rev();
        if let Some(first) = iter.next() {
            write!(f, "{}", first)?;
        }
        for chunk in iter {
            write!(f, "{:019}", chunk)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FieldElement({})", self)
    }
}

impl fmt::LowerHex for FieldElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = hex::encode(self.to_be_bytes());
        let trimmed = encoded.trim_start_matches('0');
        let digits = if trimmed.is_empty() { "0" } else { trimmed };
        if f.alternate() {
            f.write_str("0x")?;
        }
        f.write_str(digits)
    }
}

impl FromStr for FieldElement {
    type Err = FieldParseError;

    /// Parse decimal, or hex with a `0x` prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, radix) = match s.strip_prefix("0x") {
            Some(hex_digits) => (hex_digits, 16u32),
            None => (s, 10u32),
        };
        if digits.is_empty() {
            return Err(FieldParseError::Empty);
        }

        let mut limbs = [0u64; 4];
        for ch in digits.chars() {
            let digit = ch.to_digit(radix).ok_or(FieldParseError::InvalidDigit(ch))?;
            if mul_small_add(&mut limbs, radix as u64, digit as u64) {
                return Err(FieldParseError::Overflow);
            }
        }
        Ok(Self { limbs })
    }
}

impl From<u64> for FieldElement {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

// Decimal strings on the wire (snarkjs convention); plain JSON integers are
// accepted on input for small values.
impl Serialize for FieldElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldElement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldVisitor;

        impl<'de> Visitor<'de> for FieldVisitor {
            type Value = FieldElement;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal string, 0x-hex string, or unsigned integer")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<FieldElement, E> {
                Ok(FieldElement::from_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<FieldElement, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(FieldVisitor)
    }
}

// =============================================================================
// TESTS
// =============================================================================
