/*!
 * Sequence Word Bit Layout
 *
 * Flag positions shared with the userspace fast path. These must stay
 * bit-compatible with the userspace build: the kernel only ever returns
 * words that userspace folds back into its own atomics.
 */

// =============================================================================
// COUNT FIELD
// =============================================================================

/// Shift of the 24-bit count field inside a sequence word
pub const COUNT_SHIFT: u32 = 8;

/// One step of the count field
pub const INC: u32 = 1 << COUNT_SHIFT;

/// Low status byte
pub const BIT_MASK: u32 = 0xff;

/// High 24 bits
pub const COUNT_MASK: u32 = !BIT_MASK;

/// Largest representable count, used as the ring size
pub const MAX_COUNT: u32 = COUNT_MASK;

// =============================================================================
// L WORD (lock generation) BITS
// =============================================================================

/// Kernel must be entered on release
pub const L_KBIT: u32 = 0x01;

/// Exclusive owner present
pub const L_EBIT: u32 = 0x02;

/// Writers pending
pub const L_WBIT: u32 = 0x04;

/// Prepost pending (aliases the writer bit for mutexes)
pub const L_PBIT: u32 = 0x04;

/// Grant must also re-contend the associated mutex
pub const L_MTX_WAIT: u32 = 0x20;

/// Lock is unlocked
pub const L_UBIT: u32 = 0x40;

/// Overlap grant marker
pub const L_MBIT: u32 = 0x40;

/// Userspace reinitialized the object
pub const L_IBIT: u32 = 0x80;

/// L word value after initialization
pub const RWL_INIT: u32 = L_IBIT;

/// Initial rwlock L word
pub const RWLOCK_INIT: u32 = L_IBIT | L_UBIT;

// =============================================================================
// S WORD (signal generation) BITS
// =============================================================================

/// S word carries a valid value
pub const S_SBIT: u32 = 0x01;

/// Initial state marker
pub const S_IBIT: u32 = 0x02;

/// Writer save bit, set when writers were pending at unlock
pub const S_WSVBIT: u32 = 0x04;

/// Bits that disable overlap grants
pub const S_SAVEMASK: u32 = S_WSVBIT;

/// S word value after initialization
pub const RWS_INIT: u32 = S_SBIT;

/// Condvar: L == S, kernel state cleared
pub const CV_CBIT: u32 = S_SBIT;

/// Condvar: only preposts remain queued
pub const CV_PBIT: u32 = S_IBIT;

/// Condvar: spurious wake caused by reinit
pub const CV_MBIT: u32 = L_MBIT;

/// Condvar error-status extension: wait drained the condvar
pub const CV_CLEARED: u32 = 0x100;

/// Condvar error-status extension: only preposts remain
pub const CV_PREPOST: u32 = 0x200;

// =============================================================================
// OWNER HINTS
// =============================================================================

/// Owner thread id is in flux (userspace was mid-unlock)
pub const TID_SWITCHING: u64 = u64::MAX;

#[inline]
pub const fn is_rwl_wbit_set(word: u32) -> bool {
    word & L_WBIT != 0
}

#[inline]
pub const fn is_rws_sbit_set(word: u32) -> bool {
    word & S_SBIT != 0
}

#[inline]
pub const fn is_rws_savemask_set(word: u32) -> bool {
    word & S_SAVEMASK != 0
}
