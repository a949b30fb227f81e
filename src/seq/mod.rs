/*!
 * Sequence Arithmetic
 *
 * Ring-aware comparisons over the 24-bit count field of a sequence word.
 * Every ordering decision on generation words goes through these helpers;
 * raw `<`/`>` on sequence words is always a bug.
 *
 * Two counts are ordered by whichever is closer going forward, with half the
 * ring as the wrap threshold.
 */

pub mod bits;

pub use bits::{BIT_MASK, COUNT_MASK, COUNT_SHIFT, INC, MAX_COUNT};

/// Sequence word as exchanged with userspace
pub type SeqWord = u32;

const HALF_RING: u32 = MAX_COUNT / 2;

/// Strip status bits
#[inline]
pub const fn count(word: SeqWord) -> u32 {
    word & COUNT_MASK
}

/// `x` comes before `y` on the ring
#[inline]
pub fn is_lower(x: SeqWord, y: SeqWord) -> bool {
    let (x, y) = (count(x), count(y));
    if x < y {
        y - x < HALF_RING
    } else {
        x - y > HALF_RING
    }
}

/// `x` comes after `y` on the ring
#[inline]
pub fn is_higher(x: SeqWord, y: SeqWord) -> bool {
    let (x, y) = (count(x), count(y));
    if x > y {
        x - y < HALF_RING
    } else {
        y - x > HALF_RING
    }
}

#[inline]
pub fn is_lower_eq(x: SeqWord, y: SeqWord) -> bool {
    count(x) == count(y) || is_lower(x, y)
}

#[inline]
pub fn is_higher_eq(x: SeqWord, y: SeqWord) -> bool {
    count(x) == count(y) || is_higher(x, y)
}

/// Forward ring distance from `from` to `upto`, still shifted (multiples of `INC`)
#[inline]
pub fn diff(upto: SeqWord, from: SeqWord) -> u32 {
    let (upto, from) = (count(upto), count(from));
    if upto == from {
        0
    } else if upto > from {
        upto - from
    } else {
        (MAX_COUNT - from).wrapping_add(upto).wrapping_add(INC)
    }
}

/// Number of generations between `lowest` and `upto`
#[inline]
pub fn find_diff(upto: SeqWord, lowest: SeqWord) -> u32 {
    diff(upto, lowest) >> COUNT_SHIFT
}

/// Lowest of a set of sequence words by ring order
pub fn ring_min<I: IntoIterator<Item = SeqWord>>(words: I) -> Option<SeqWord> {
    words
        .into_iter()
        .map(count)
        .reduce(|low, w| if is_lower(w, low) { w } else { low })
}

/// Highest of a set of sequence words by ring order
pub fn ring_max<I: IntoIterator<Item = SeqWord>>(words: I) -> Option<SeqWord> {
    words
        .into_iter()
        .map(count)
        .reduce(|high, w| if is_higher(w, high) { w } else { high })
}
