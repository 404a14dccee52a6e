//! Sign-magnitude arithmetic on little-endian 32-bit digit vectors, the
//! representation of `Bigint` objects. Integers that fit in 64 bits are
//! never stored as bigints.

use std::cmp::Ordering;

pub type Digits = Vec<u32>;

fn trim(mut digits: Digits) -> Digits {
    while digits.last() == Some(&0) {
        digits.pop();
    }
    digits
}

pub fn digits_of(mut magnitude: u128) -> Digits {
    let mut digits = Vec::new();
    while magnitude != 0 {
        digits.push(magnitude as u32);
        magnitude >>= 32;
    }
    digits
}

fn magnitude_u128(digits: &[u32]) -> Option<u128> {
    if digits.len() > 4 {
        return None;
    }
    Some(digits.iter().rev().fold(0u128, |acc, &d| (acc << 32) | u128::from(d)))
}

pub fn to_i128(negative: bool, digits: &[u32]) -> Option<i128> {
    let magnitude = magnitude_u128(digits)?;
    if negative {
        if magnitude == 1u128 << 127 {
            Some(i128::MIN)
        } else {
            i128::try_from(magnitude).ok().map(|m| -m)
        }
    } else {
        i128::try_from(magnitude).ok()
    }
}

pub fn to_i64(negative: bool, digits: &[u32]) -> Option<i64> {
    to_i128(negative, digits).and_then(|v| i64::try_from(v).ok())
}

pub fn to_f64(negative: bool, digits: &[u32]) -> f64 {
    let magnitude = digits.iter().rev().fold(0.0f64, |acc, &d| acc * 4294967296.0 + f64::from(d));
    if negative { -magnitude } else { magnitude }
}

// ── Magnitudes ─────────────────────────────────────────────────────

fn compare_magnitude(a: &[u32], b: &[u32]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.iter().rev().cmp(b.iter().rev()))
}

fn add_magnitude(a: &[u32], b: &[u32]) -> Digits {
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    let mut out = Vec::with_capacity(long.len() + 1);
    let mut carry = 0u64;
    for (i, &d) in long.iter().enumerate() {
        let sum = u64::from(d) + u64::from(short.get(i).copied().unwrap_or(0)) + carry;
        out.push(sum as u32);
        carry = sum >> 32;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    out
}

/// `a - b` with `a >= b`.
fn sub_magnitude(a: &[u32], b: &[u32]) -> Digits {
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i64;
    for (i, &d) in a.iter().enumerate() {
        let mut diff = i64::from(d) - i64::from(b.get(i).copied().unwrap_or(0)) - borrow;
        borrow = 0;
        if diff < 0 {
            diff += 1 << 32;
            borrow = 1;
        }
        out.push(diff as u32);
    }
    trim(out)
}

fn mul_magnitude(a: &[u32], b: &[u32]) -> Digits {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            let t = u64::from(x) * u64::from(y) + u64::from(out[i + j]) + carry;
            out[i + j] = t as u32;
            carry = t >> 32;
        }
        out[i + b.len()] = carry as u32;
    }
    trim(out)
}

/// Divides in place by a small divisor, returning the remainder.
fn div_small(digits: &mut Digits, divisor: u32) -> u32 {
    let mut rem = 0u64;
    for d in digits.iter_mut().rev() {
        let cur = (rem << 32) | u64::from(*d);
        *d = (cur / u64::from(divisor)) as u32;
        rem = cur % u64::from(divisor);
    }
    let trimmed = trim(std::mem::take(digits));
    *digits = trimmed;
    rem as u32
}

// ── Signed operations ──────────────────────────────────────────────

/// `(negative, digits)`; zero is never negative.
pub type Signed = (bool, Digits);

fn normalize((negative, digits): Signed) -> Signed {
    let digits = trim(digits);
    (negative && !digits.is_empty(), digits)
}

pub fn from_i128(value: i128) -> Signed {
    (value < 0, digits_of(value.unsigned_abs()))
}

pub fn add(a_negative: bool, a: &[u32], b_negative: bool, b: &[u32]) -> Signed {
    if a_negative == b_negative {
        return normalize((a_negative, add_magnitude(a, b)));
    }
    match compare_magnitude(a, b) {
        Ordering::Less => normalize((b_negative, sub_magnitude(b, a))),
        _ => normalize((a_negative, sub_magnitude(a, b))),
    }
}

pub fn sub(a_negative: bool, a: &[u32], b_negative: bool, b: &[u32]) -> Signed {
    add(a_negative, a, !b_negative, b)
}

pub fn mul(a_negative: bool, a: &[u32], b_negative: bool, b: &[u32]) -> Signed {
    normalize((a_negative != b_negative, mul_magnitude(a, b)))
}

pub fn compare(a_negative: bool, a: &[u32], b_negative: bool, b: &[u32]) -> Ordering {
    let a_zero = a.iter().all(|&d| d == 0);
    let b_zero = b.iter().all(|&d| d == 0);
    let a_negative = a_negative && !a_zero;
    let b_negative = b_negative && !b_zero;
    match (a_negative, b_negative) {
        (false, true) => Ordering::Greater,
        (true, false) => Ordering::Less,
        (false, false) => compare_magnitude(a, b),
        (true, true) => compare_magnitude(b, a),
    }
}

// ── Text ───────────────────────────────────────────────────────────

pub fn to_decimal(negative: bool, digits: &[u32]) -> String {
    let mut work = trim(digits.to_vec());
    if work.is_empty() {
        return "0".to_owned();
    }
    let mut chunks = Vec::new();
    while !work.is_empty() {
        chunks.push(div_small(&mut work, 1_000_000_000));
    }
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    let mut iter = chunks.iter().rev();
    if let Some(first) = iter.next() {
        out.push_str(&first.to_string());
    }
    for chunk in iter {
        out.push_str(&format!("{chunk:09}"));
    }
    out
}

pub fn to_hex(negative: bool, digits: &[u32]) -> String {
    let digits = trim(digits.to_vec());
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str("0x");
    match digits.split_last() {
        None => out.push('0'),
        Some((top, rest)) => {
            out.push_str(&format!("{top:x}"));
            for d in rest.iter().rev() {
                out.push_str(&format!("{d:08x}"));
            }
        }
    }
    out
}

/// Parses `[-]digits` in decimal or `[-]0x` hex.
pub fn parse(text: &str) -> Option<Signed> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (radix, body) = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => (16u32, hex),
        None => (10u32, body),
    };
    if body.is_empty() {
        return None;
    }
    let mut digits: Digits = Vec::new();
    for c in body.chars() {
        let d = c.to_digit(radix)?;
        digits = mul_magnitude(&digits, &[radix]);
        digits = add_magnitude(&digits, &[d]);
    }
    Some(normalize((negative, digits)))
}
