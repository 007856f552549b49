//! Fixed-width bit-strings and their arithmetic.
//!
//! A bit-string is an ordered sequence of bits with an explicit width that is
//! preserved by every operation. Arithmetic comes in three families with
//! different overflow behaviour: wrapping (truncate modulo 2^W), checked
//! (report overflow), and saturating (clamp to the representable range).
//! Comparisons treat the bits as unsigned by default; the arithmetic variants
//! interpret them as two's-complement signed.

/// An ordered sequence of bits. Index 0 is the least significant bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bits {
    bits: Vec<bool>,
}

/// Outcome of a checked arithmetic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckedResult {
    Ok,
    Overflow,
}

impl Bits {
    /// A zero-filled bit-string of the given width.
    pub fn zero(width: usize) -> Bits {
        Bits {
            bits: vec![false; width],
        }
    }

    /// Build from a u64, truncating or zero-extending to `width`.
    pub fn from_u64(width: usize, value: u64) -> Bits {
        let mut bits = Vec::with_capacity(width);
        for i in 0..width {
            bits.push(i < 64 && (value >> i) & 1 == 1);
        }
        Bits { bits }
    }

    pub fn width(&self) -> usize {
        self.bits.len()
    }

    pub fn at(&self, index: usize) -> Option<bool> {
        self.bits.get(index).copied()
    }

    pub fn set(&mut self, index: usize, value: bool) -> bool {
        match self.bits.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn any(&self) -> bool {
        self.bits.iter().any(|b| *b)
    }

    /// The value as a u64, ignoring bits past the 64th.
    pub fn to_u64(&self) -> u64 {
        let mut out = 0u64;
        for (i, bit) in self.bits.iter().enumerate().take(64) {
            if *bit {
                out |= 1 << i;
            }
        }
        out
    }

    fn sign(&self) -> bool {
        self.bits.last().copied().unwrap_or(false)
    }

    /// The most negative value of this width: 100…0.
    fn min_signed(width: usize) -> Bits {
        let mut out = Bits::zero(width);
        if width > 0 {
            out.bits[width - 1] = true;
        }
        out
    }

    /// The most positive value of this width: 011…1.
    fn max_signed(width: usize) -> Bits {
        let mut out = Bits {
            bits: vec![true; width],
        };
        if width > 0 {
            out.bits[width - 1] = false;
        }
        out
    }

    pub fn not(&self) -> Bits {
        Bits {
            bits: self.bits.iter().map(|b| !*b).collect(),
        }
    }

    fn zip(&self, other: &Bits, f: impl Fn(bool, bool) -> bool) -> Bits {
        let width = self.width().max(other.width());
        let mut bits = Vec::with_capacity(width);
        for i in 0..width {
            let a = self.bits.get(i).copied().unwrap_or(false);
            let b = other.bits.get(i).copied().unwrap_or(false);
            bits.push(f(a, b));
        }
        Bits { bits }
    }

    pub fn and(&self, other: &Bits) -> Bits {
        self.zip(other, |a, b| a && b)
    }

    pub fn or(&self, other: &Bits) -> Bits {
        self.zip(other, |a, b| a || b)
    }

    pub fn xor(&self, other: &Bits) -> Bits {
        self.zip(other, |a, b| a != b)
    }

    /// Logical shift left; bits shifted past the width are lost.
    pub fn shl(&self, by: usize) -> Bits {
        let width = self.width();
        let mut bits = vec![false; width];
        for i in by..width {
            bits[i] = self.bits[i - by];
        }
        Bits { bits }
    }

    /// Logical shift right, filling with zeroes.
    pub fn shr(&self, by: usize) -> Bits {
        let width = self.width();
        let mut bits = vec![false; width];
        for i in 0..width.saturating_sub(by) {
            bits[i] = self.bits[i + by];
        }
        Bits { bits }
    }

    /// Arithmetic shift right, replicating the sign bit.
    pub fn ashr(&self, by: usize) -> Bits {
        let width = self.width();
        let sign = self.sign();
        let mut bits = vec![sign; width];
        for i in 0..width.saturating_sub(by) {
            bits[i] = self.bits[i + by];
        }
        Bits { bits }
    }

    pub fn rol(&self, by: usize) -> Bits {
        let width = self.width();
        if width == 0 {
            return self.clone();
        }
        let by = by % width;
        let mut bits = vec![false; width];
        for (i, bit) in self.bits.iter().enumerate() {
            bits[(i + by) % width] = *bit;
        }
        Bits { bits }
    }

    pub fn ror(&self, by: usize) -> Bits {
        let width = self.width();
        if width == 0 {
            return self.clone();
        }
        self.rol(width - (by % width))
    }

    /// Ripple-carry addition truncated to the width of `self`.
    /// Returns the result and the final carry.
    fn add_raw(&self, other: &Bits) -> (Bits, bool) {
        let width = self.width();
        let mut bits = Vec::with_capacity(width);
        let mut carry = false;
        for i in 0..width {
            let a = self.bits[i];
            let b = other.bits.get(i).copied().unwrap_or(false);
            bits.push((a != b) != carry);
            carry = (a && b) || (a && carry) || (b && carry);
        }
        (Bits { bits }, carry)
    }

    fn negate(&self) -> Bits {
        let one = Bits::from_u64(self.width(), 1);
        self.not().add_raw(&one).0
    }

    /// `(a + b) mod 2^W` where W is the width of `self`.
    pub fn wrapadd(&self, other: &Bits) -> Bits {
        self.add_raw(other).0
    }

    /// `(a - b) mod 2^W`.
    pub fn wrapsub(&self, other: &Bits) -> Bits {
        self.add_raw(&other.widened(self.width()).negate()).0
    }

    /// `(a * b) mod 2^W` by shift-and-add.
    pub fn wrapmul(&self, other: &Bits) -> Bits {
        let width = self.width();
        let mut acc = Bits::zero(width);
        for i in 0..width.min(other.width()) {
            if other.bits[i] {
                acc = acc.add_raw(&self.shl(i)).0;
            }
        }
        acc
    }

    fn widened(&self, width: usize) -> Bits {
        let mut bits = self.bits.clone();
        bits.resize(width, false);
        Bits { bits }
    }

    /// Signed addition detecting two's-complement overflow.
    pub fn checked_add_signed(&self, other: &Bits) -> (Bits, CheckedResult) {
        let rhs = other.widened(self.width());
        let (sum, _) = self.add_raw(&rhs);
        // Overflow iff both operands share a sign the result does not.
        let overflow = self.sign() == rhs.sign() && sum.sign() != self.sign();
        (sum, checked(overflow))
    }

    /// Signed subtraction detecting two's-complement overflow.
    pub fn checked_sub_signed(&self, other: &Bits) -> (Bits, CheckedResult) {
        let rhs = other.widened(self.width());
        let (diff, _) = self.add_raw(&rhs.negate());
        let overflow = self.sign() != rhs.sign() && diff.sign() != self.sign();
        (diff, checked(overflow))
    }

    /// Signed multiplication detecting overflow by checking the wide product
    /// fits the operand width.
    pub fn checked_mul_signed(&self, other: &Bits) -> (Bits, CheckedResult) {
        let width = self.width();
        let wide = 2 * width.max(1);
        let a = self.sign_extended(wide);
        let b = other.widened(width).sign_extended(wide);
        let product = a.wrapmul(&b);
        let narrow = product.widened(width).truncated(width);
        // The product fits iff every discarded bit equals the narrow sign.
        let sign = narrow.sign();
        let fits = product.bits[width..].iter().all(|b| *b == sign);
        (narrow, checked(!fits))
    }

    fn sign_extended(&self, width: usize) -> Bits {
        let sign = self.sign();
        let mut bits = self.bits.clone();
        bits.resize(width, sign);
        Bits { bits }
    }

    fn truncated(&self, width: usize) -> Bits {
        Bits {
            bits: self.bits[..width.min(self.bits.len())].to_vec(),
        }
    }

    /// Saturating signed addition.
    pub fn saturating_add_signed(&self, other: &Bits) -> Bits {
        match self.checked_add_signed(other) {
            (sum, CheckedResult::Ok) => sum,
            (_, CheckedResult::Overflow) => self.saturation_limit(),
        }
    }

    /// Saturating signed subtraction.
    pub fn saturating_sub_signed(&self, other: &Bits) -> Bits {
        match self.checked_sub_signed(other) {
            (diff, CheckedResult::Ok) => diff,
            (_, CheckedResult::Overflow) => self.saturation_limit(),
        }
    }

    /// Saturating signed multiplication.
    pub fn saturating_mul_signed(&self, other: &Bits) -> Bits {
        match self.checked_mul_signed(other) {
            (product, CheckedResult::Ok) => product,
            (_, CheckedResult::Overflow) => {
                if self.sign() == other.sign() {
                    Bits::max_signed(self.width())
                } else {
                    Bits::min_signed(self.width())
                }
            }
        }
    }

    /// The bound an overflowing add/sub clamps to, selected by the sign of
    /// the true result (positive overflow → MAX, negative → MIN).
    fn saturation_limit(&self) -> Bits {
        if self.sign() {
            Bits::min_signed(self.width())
        } else {
            Bits::max_signed(self.width())
        }
    }

    /// Unsigned comparison: -1, 0, or 1.
    pub fn cmp_unsigned(&self, other: &Bits) -> std::cmp::Ordering {
        let width = self.width().max(other.width());
        for i in (0..width).rev() {
            let a = self.bits.get(i).copied().unwrap_or(false);
            let b = other.bits.get(i).copied().unwrap_or(false);
            if a != b {
                return if a {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Less
                };
            }
        }
        std::cmp::Ordering::Equal
    }

    /// Two's-complement signed comparison.
    pub fn cmp_signed(&self, other: &Bits) -> std::cmp::Ordering {
        match (self.sign(), other.sign()) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => self.cmp_unsigned(other),
        }
    }
}

fn checked(overflow: bool) -> CheckedResult {
    if overflow {
        CheckedResult::Overflow
    } else {
        CheckedResult::Ok
    }
}

impl std::fmt::Display for Bits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("0b")?;
        for bit in self.bits.iter().rev() {
            f.write_str(if *bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapadd_is_modular() {
        // For width 8: (200 + 100) mod 256 == 44.
        let a = Bits::from_u64(8, 200);
        let b = Bits::from_u64(8, 100);
        assert_eq!(a.wrapadd(&b).to_u64(), (200 + 100) % 256);
    }

    #[test]
    fn wrapsub_is_modular() {
        let a = Bits::from_u64(8, 3);
        let b = Bits::from_u64(8, 5);
        assert_eq!(a.wrapsub(&b).to_u64(), 254);
    }

    #[test]
    fn wrapmul_is_modular() {
        let a = Bits::from_u64(8, 23);
        let b = Bits::from_u64(8, 29);
        assert_eq!(a.wrapmul(&b).to_u64(), (23 * 29) % 256);
    }

    #[test]
    fn checked_add_detects_overflow() {
        // 127 + 1 overflows i8.
        let max = Bits::from_u64(8, 127);
        let one = Bits::from_u64(8, 1);
        let (_, status) = max.checked_add_signed(&one);
        assert_eq!(status, CheckedResult::Overflow);

        let (sum, status) = Bits::from_u64(8, 100).checked_add_signed(&one);
        assert_eq!(status, CheckedResult::Ok);
        assert_eq!(sum.to_u64(), 101);
    }

    #[test]
    fn checked_sub_detects_underflow() {
        // -128 - 1 underflows i8.
        let min = Bits::from_u64(8, 0x80);
        let one = Bits::from_u64(8, 1);
        let (_, status) = min.checked_sub_signed(&one);
        assert_eq!(status, CheckedResult::Overflow);
    }

    #[test]
    fn checked_mul_detects_overflow() {
        let a = Bits::from_u64(8, 16);
        let (_, status) = a.checked_mul_signed(&a);
        assert_eq!(status, CheckedResult::Overflow);

        let small = Bits::from_u64(8, 11);
        let (product, status) = small.checked_mul_signed(&Bits::from_u64(8, 11));
        assert_eq!(status, CheckedResult::Ok);
        assert_eq!(product.to_u64(), 121);
    }

    #[test]
    fn saturating_add_clamps_to_max() {
        let max = Bits::from_u64(8, 127);
        let one = Bits::from_u64(8, 1);
        assert_eq!(max.saturating_add_signed(&one).to_u64(), 127);
    }

    #[test]
    fn saturating_sub_clamps_to_min() {
        let min = Bits::from_u64(8, 0x80);
        let one = Bits::from_u64(8, 1);
        assert_eq!(min.saturating_sub_signed(&one).to_u64(), 0x80);
    }

    #[test]
    fn saturating_mul_picks_bound_by_sign() {
        let a = Bits::from_u64(8, 100);
        let b = Bits::from_u64(8, 100);
        assert_eq!(a.saturating_mul_signed(&b).to_u64(), 127);

        // 100 * -100 saturates to MIN.
        let neg = Bits::from_u64(8, 100).negate();
        assert_eq!(a.saturating_mul_signed(&neg).to_u64(), 0x80);
    }

    #[test]
    fn rotations_preserve_bits() {
        let a = Bits::from_u64(8, 0b1000_0001);
        assert_eq!(a.rol(1).to_u64(), 0b0000_0011);
        assert_eq!(a.ror(1).to_u64(), 0b1100_0000);
        assert_eq!(a.rol(8).to_u64(), a.to_u64());
    }

    #[test]
    fn shifts() {
        let a = Bits::from_u64(8, 0b1001_0000);
        assert_eq!(a.shl(1).to_u64(), 0b0010_0000);
        assert_eq!(a.shr(4).to_u64(), 0b0000_1001);
        // ashr keeps the sign bit.
        assert_eq!(a.ashr(4).to_u64(), 0b1111_1001);
    }

    #[test]
    fn signed_and_unsigned_comparisons_differ() {
        let minus_one = Bits::from_u64(8, 0xff);
        let one = Bits::from_u64(8, 1);
        assert_eq!(minus_one.cmp_unsigned(&one), std::cmp::Ordering::Greater);
        assert_eq!(minus_one.cmp_signed(&one), std::cmp::Ordering::Less);
    }
}
