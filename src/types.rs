//! Fixed-size records shared by both passes.
//!
//! Bucket files and output shards both store flat runs of 17-byte records:
//! a 16-byte element followed by one tag byte. The tag byte carries two
//! logical fields:
//!
//! - bits 0..7: the index of the seed that routed the element,
//! - bit 7: the chain terminator flag (output shards only).
//!
//! Seed index [`SENTINEL_SEED_INDEX`] is reserved for the placeholder record
//! of an empty chain, so at most [`MAX_HASH_FUNCTIONS`] seeds are allowed.

use serde::{Deserialize, Serialize};

/// Size of an element in bytes.
pub const ELEMENT_SIZE: usize = 16;
/// Size of a seed in bytes.
pub const SEED_SIZE: usize = 16;
/// Size of a tagged record (element + tag byte) in bytes.
pub const RECORD_SIZE: usize = ELEMENT_SIZE + 1;

/// Tag bit marking the last record of a slot chain.
pub const TERMINATOR_FLAG: u8 = 0x80;
/// Tag bits holding the seed index.
pub const SEED_INDEX_MASK: u8 = 0x7F;
/// Seed index reserved for sentinel records.
pub const SENTINEL_SEED_INDEX: u8 = SEED_INDEX_MASK;
/// Largest supported number of hash functions.
pub const MAX_HASH_FUNCTIONS: usize = SENTINEL_SEED_INDEX as usize;

/// Opaque 16-byte identifier.
pub type Element = [u8; ELEMENT_SIZE];

/// 128-bit keying material for one hash function.
pub type Seed = [u8; SEED_SIZE];

/// An element plus the index of the seed that assigned it to its bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaggedElement {
    pub element: Element,
    pub seed_index: u8,
}

impl TaggedElement {
    pub fn new(element: Element, seed_index: u8) -> Self {
        debug_assert!(
            seed_index < SENTINEL_SEED_INDEX,
            "seed index {seed_index} collides with reserved tag bits"
        );
        Self {
            element,
            seed_index,
        }
    }

    /// Bucket-file encoding: element bytes, then the bare seed index.
    #[inline]
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        encode(&self.element, self.seed_index, false)
    }

    /// Decode a bucket-file record. The terminator bit is ignored.
    #[inline]
    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let (element, tag) = split(bytes);
        Self {
            element,
            seed_index: tag & SEED_INDEX_MASK,
        }
    }
}

/// One record of a serialized slot chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainRecord {
    Element {
        tagged: TaggedElement,
        terminator: bool,
    },
    /// Placeholder written for an empty chain. Always terminates its chain.
    Sentinel,
}

impl ChainRecord {
    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        match self {
            ChainRecord::Element { tagged, terminator } => {
                encode(&tagged.element, tagged.seed_index, *terminator)
            }
            ChainRecord::Sentinel => encode(&[0; ELEMENT_SIZE], SENTINEL_SEED_INDEX, true),
        }
    }

    pub fn from_bytes(bytes: &[u8; RECORD_SIZE]) -> Self {
        let (element, tag) = split(bytes);
        let seed_index = tag & SEED_INDEX_MASK;
        if seed_index == SENTINEL_SEED_INDEX {
            return ChainRecord::Sentinel;
        }
        ChainRecord::Element {
            tagged: TaggedElement {
                element,
                seed_index,
            },
            terminator: tag & TERMINATOR_FLAG != 0,
        }
    }

    pub fn is_terminator(&self) -> bool {
        match self {
            ChainRecord::Element { terminator, .. } => *terminator,
            ChainRecord::Sentinel => true,
        }
    }
}

#[inline]
fn encode(element: &Element, seed_index: u8, terminator: bool) -> [u8; RECORD_SIZE] {
    let mut out = [0u8; RECORD_SIZE];
    out[..ELEMENT_SIZE].copy_from_slice(element);
    out[ELEMENT_SIZE] = (seed_index & SEED_INDEX_MASK) | if terminator { TERMINATOR_FLAG } else { 0 };
    out
}

#[inline]
fn split(bytes: &[u8; RECORD_SIZE]) -> (Element, u8) {
    let mut element = [0u8; ELEMENT_SIZE];
    element.copy_from_slice(&bytes[..ELEMENT_SIZE]);
    (element, bytes[ELEMENT_SIZE])
}

/// The elements sharing one final table position, in insertion order.
/// An empty chain is serialized as a single sentinel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotChain {
    pub entries: Vec<TaggedElement>,
}

impl SlotChain {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, element: &Element) -> bool {
        self.entries.iter().any(|t| &t.element == element)
    }

    /// Physical records of this chain, last one flagged as terminator.
    pub fn records(entries: &[TaggedElement]) -> impl Iterator<Item = ChainRecord> + '_ {
        let last = entries.len().saturating_sub(1);
        let sentinel = entries.is_empty().then_some(ChainRecord::Sentinel);
        entries
            .iter()
            .enumerate()
            .map(move |(i, tagged)| ChainRecord::Element {
                tagged: *tagged,
                terminator: i == last,
            })
            .chain(sentinel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(b: u8) -> Element {
        [b; ELEMENT_SIZE]
    }

    #[test]
    fn test_bucket_record_layout() {
        let t = TaggedElement::new(element(7), 3);
        let bytes = t.to_bytes();
        assert_eq!(&bytes[..16], &[7u8; 16]);
        assert_eq!(bytes[16], 3);
        assert_eq!(TaggedElement::from_bytes(&bytes), t);
    }

    #[test]
    fn test_terminator_does_not_clobber_seed_index() {
        let t = TaggedElement::new(element(1), 126);
        let rec = ChainRecord::Element {
            tagged: t,
            terminator: true,
        };
        let bytes = rec.to_bytes();
        assert_eq!(bytes[16], 126 | TERMINATOR_FLAG);
        assert_eq!(ChainRecord::from_bytes(&bytes), rec);
        // The bucket-file decoder strips the flag.
        assert_eq!(TaggedElement::from_bytes(&bytes), t);
    }

    #[test]
    fn test_sentinel_is_distinct_from_zero_element() {
        let zero = ChainRecord::Element {
            tagged: TaggedElement::new([0; 16], 0),
            terminator: true,
        };
        assert_ne!(zero.to_bytes(), ChainRecord::Sentinel.to_bytes());
        assert_eq!(
            ChainRecord::from_bytes(&ChainRecord::Sentinel.to_bytes()),
            ChainRecord::Sentinel
        );
        assert!(ChainRecord::Sentinel.is_terminator());
    }

    #[test]
    fn test_chain_records_flag_only_last() {
        let entries: Vec<_> = (0..3).map(|i| TaggedElement::new(element(i), 0)).collect();
        let flags: Vec<bool> = SlotChain::records(&entries)
            .map(|r| r.is_terminator())
            .collect();
        assert_eq!(flags, vec![false, false, true]);

        let empty: Vec<_> = SlotChain::records(&[]).collect();
        assert_eq!(empty, vec![ChainRecord::Sentinel]);
    }
}
