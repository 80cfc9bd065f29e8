//! Dynamic symbol count recovery from a `DT_GNU_HASH` table.
//!
//! A module that only carries the GNU hash layout never states how long its
//! `.dynsym` is. The count is the index one past the last symbol of the
//! highest-numbered chain, found by following that chain to its terminator.
//! See <https://flapenguin.me/2017/05/10/elf-lookup-dt-gnu-hash/>.
//!
//! Layout: header, `bloom_count` bloom words (pointer sized), `bucket_count`
//! bucket words, then one chain word per hashed symbol. A chain word with the
//! low bit set ends its chain.

use core::mem::size_of;

use object::elf::GnuHashHeader;
use object::{Bytes, NativeEndian, U32};

/// Number of dynamic symbols described by the GNU hash table at the start of
/// `table`, using the native bloom word size.
///
/// Returns `None` when the table is truncated.
pub fn symbol_count(table: &[u8]) -> Option<u32> {
    symbol_count_with_bloom_word(table, size_of::<usize>())
}

pub fn symbol_count_with_bloom_word(table: &[u8], bloom_word: usize) -> Option<u32> {
    let data = Bytes(table);
    let header = data.read_at::<GnuHashHeader<NativeEndian>>(0).ok()?;
    let bucket_count = header.bucket_count.get(NativeEndian) as usize;
    let symoffset = header.symbol_base.get(NativeEndian);
    let bloom_count = header.bloom_count.get(NativeEndian) as usize;

    let buckets_at = size_of::<GnuHashHeader<NativeEndian>>()
        .checked_add(bloom_count.checked_mul(bloom_word)?)?;
    let buckets = data
        .read_slice_at::<U32<NativeEndian>>(buckets_at, bucket_count)
        .ok()?;

    // The chain that starts at the largest bucket index holds the last symbol.
    let last_symbol = buckets
        .iter()
        .map(|bucket| bucket.get(NativeEndian))
        .max()
        .unwrap_or(0);
    if last_symbol < symoffset {
        return Some(symoffset);
    }

    let chains_at = buckets_at.checked_add(bucket_count.checked_mul(4)?)?;
    let mut count = last_symbol;
    loop {
        let slot = ((count - symoffset) as usize).checked_mul(4)?;
        let entry = data
            .read_at::<U32<NativeEndian>>(chains_at.checked_add(slot)?)
            .ok()?
            .get(NativeEndian);
        count = count.checked_add(1)?;
        if entry & 1 != 0 {
            break;
        }
    }
    Some(count)
}
