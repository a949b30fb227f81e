/*!
 * Sequence Arithmetic Properties
 *
 * Ring ordering over the 24-bit count field, including wrap-around
 */

use proptest::prelude::*;
use psynch_kernel::seq::{
    count, diff, find_diff, is_higher, is_higher_eq, is_lower, is_lower_eq, ring_max, ring_min, INC,
    MAX_COUNT,
};

proptest! {
    #[test]
    fn lower_and_higher_are_mirror_images(x in any::<u32>(), y in any::<u32>()) {
        prop_assert_eq!(is_lower(x, y), is_higher(y, x));
        prop_assert_eq!(is_lower_eq(x, y), is_higher_eq(y, x));
    }

    #[test]
    fn exactly_one_relation_holds(x in any::<u32>(), y in any::<u32>()) {
        let relations = [is_lower(x, y), count(x) == count(y), is_higher(x, y)];
        let held = relations.iter().filter(|&&r| r).count();
        prop_assert_eq!(held, 1);
    }

    #[test]
    fn status_bits_never_affect_ordering(x in any::<u32>(), y in any::<u32>(), bits in 0u32..0x100) {
        prop_assert_eq!(is_lower(x | bits, y), is_lower(x, y));
        prop_assert_eq!(is_higher(x, y | bits), is_higher(x, y));
    }

    #[test]
    fn successor_is_higher_across_wrap(x in any::<u32>()) {
        let next = x.wrapping_add(INC);
        prop_assert!(is_higher(next, x));
        prop_assert!(is_lower(x, next));
        prop_assert_eq!(find_diff(next, x), 1);
    }

    #[test]
    fn distance_matches_steps(x in any::<u32>(), steps in 0u32..1000) {
        let upto = x.wrapping_add(steps * INC);
        prop_assert_eq!(diff(upto, x), steps * INC);
        prop_assert_eq!(find_diff(upto, x), steps);
    }

    #[test]
    fn ring_extremes_bracket_window(base in any::<u32>(), offsets in prop::collection::vec(0u32..4096, 1..32)) {
        let words: Vec<u32> = offsets.iter().map(|o| base.wrapping_add(o * INC)).collect();
        let low = ring_min(words.iter().copied()).unwrap();
        let high = ring_max(words.iter().copied()).unwrap();
        for &w in &words {
            prop_assert!(is_lower_eq(low, w));
            prop_assert!(is_higher_eq(high, w));
        }
    }
}

#[test]
fn test_wrap_boundary() {
    let top = MAX_COUNT;
    assert!(is_lower(top, 0));
    assert!(is_higher(0, top));
    assert_eq!(diff(0, top), INC);
}
