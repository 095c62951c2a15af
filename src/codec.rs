//! # Codec
//! Packs a `{kind, peer, sequence}` triple into the single 64-bit `wr_id`
//! that rides on every RDMA work request and is handed back on its
//! completion: kind in the high bits, peer in the middle, sequence number
//! in the low bits.

use std::marker::PhantomData;

use crate::error::{Error, Result};

/// A small, finite enumeration of logical traffic classes. Implementors
/// give the codec their highest ordinal so it can compute the number of
/// bits it needs to set aside for `Self`.
pub trait Kind: Copy {
    /// The highest ordinal any variant of `Self` takes on.
    const MAX_ORDINAL: u64;

    /// This variant's ordinal, in `0..=MAX_ORDINAL`.
    fn ordinal(&self) -> u64;

    /// Reconstructs a `Self` from an ordinal produced by [`Kind::ordinal`].
    /// Implementations may assume `ordinal <= MAX_ORDINAL`.
    fn from_ordinal(ordinal: u64) -> Self;
}

/// Number of bits needed to represent `0..=max_value`, i.e. `ceil(log2(max_value + 1))`,
/// with the convention that `0` still needs one bit.
pub fn bits_needed(max_value: u64) -> u32 {
    if max_value == 0 {
        1
    } else {
        64 - max_value.leading_zeros()
    }
}

/// The largest value in `collection`, or `0` if it is empty.
pub fn max_id<I>(collection: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    collection.into_iter().max().unwrap_or(0)
}

/// `max(extra, max_id(collection))`.
pub fn max_id_with<I>(extra: u64, collection: I) -> u64
where
    I: IntoIterator<Item = u64>,
{
    extra.max(max_id(collection))
}

/// Packs and unpacks 64-bit work-request handles for one fixed
/// `(kind_width, peer_width, seq_width)` configuration. Every peer
/// exchanging work requests over the same queue pair must construct their
/// `Packer` with the same `max_peer_id`, since the widths are derived from
/// it (see the Identifier handle format in the external interfaces).
pub struct Packer<K: Kind> {
    kind_width: u32,
    peer_width: u32,
    seq_width: u32,
    _kind: PhantomData<K>,
}

impl<K: Kind> Packer<K> {
    /// Builds a packer sized for this process: enough bits for `K`'s
    /// largest ordinal, and enough bits for `max_peer_id`. The remaining
    /// bits of the 64-bit word are left for the sequence number.
    pub fn new(max_peer_id: u64) -> Result<Self> {
        let kind_width = bits_needed(K::MAX_ORDINAL);
        let peer_width = bits_needed(max_peer_id);

        if kind_width + peer_width >= 64 {
            return Err(Error::overflow(format!(
                "kind width {} + peer width {} leaves no room for a sequence number",
                kind_width, peer_width
            )));
        }

        Ok(Packer {
            kind_width,
            peer_width,
            seq_width: 64 - kind_width - peer_width,
            _kind: PhantomData,
        })
    }

    pub fn kind_width(&self) -> u32 {
        self.kind_width
    }

    pub fn peer_width(&self) -> u32 {
        self.peer_width
    }

    pub fn seq_width(&self) -> u32 {
        self.seq_width
    }

    fn max_for(width: u32) -> u64 {
        if width >= 64 {
            u64::MAX
        } else {
            (1u64 << width) - 1
        }
    }

    /// Places `{kind, peer, seq}` into a single 64-bit handle. Fails with
    /// [`ErrorKind::Overflow`](crate::error::ErrorKind::Overflow) if any
    /// field does not fit in its configured slot.
    pub fn pack(&self, kind: K, peer: u64, seq: u64) -> Result<u64> {
        let kind_ord = kind.ordinal();

        if kind_ord > Self::max_for(self.kind_width) {
            return Err(Error::overflow(format!(
                "kind ordinal {} does not fit in {} bits",
                kind_ord, self.kind_width
            )));
        }
        if peer > Self::max_for(self.peer_width) {
            return Err(Error::overflow(format!(
                "peer id {} does not fit in {} bits",
                peer, self.peer_width
            )));
        }
        if seq > Self::max_for(self.seq_width) {
            return Err(Error::overflow(format!(
                "sequence number {} does not fit in {} bits",
                seq, self.seq_width
            )));
        }

        Ok((kind_ord << (self.peer_width + self.seq_width))
            | (peer << self.seq_width)
            | seq)
    }

    pub fn unpack_kind(&self, handle: u64) -> K {
        let ord = handle >> (self.peer_width + self.seq_width);
        K::from_ordinal(ord & Self::max_for(self.kind_width))
    }

    pub fn unpack_peer(&self, handle: u64) -> u64 {
        (handle >> self.seq_width) & Self::max_for(self.peer_width)
    }

    pub fn unpack_seq(&self, handle: u64) -> u64 {
        handle & Self::max_for(self.seq_width)
    }

    pub fn unpack_all(&self, handle: u64) -> (K, u64, u64) {
        (
            self.unpack_kind(handle),
            self.unpack_peer(handle),
            self.unpack_seq(handle),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum NamedKind {
        Apple,
        Pear,
        Banana,
        Strawberry,
    }

    impl Kind for NamedKind {
        const MAX_ORDINAL: u64 = 3;

        fn ordinal(&self) -> u64 {
            *self as u64
        }

        fn from_ordinal(ordinal: u64) -> Self {
            match ordinal {
                0 => NamedKind::Apple,
                1 => NamedKind::Pear,
                2 => NamedKind::Banana,
                3 => NamedKind::Strawberry,
                _ => panic!("ordinal {} out of range", ordinal),
            }
        }
    }

    #[test]
    fn bits_needed_edge_cases() {
        assert_eq!(bits_needed(0), 1);
        assert_eq!(bits_needed(1), 1);
        assert_eq!(bits_needed(2), 2);
        assert_eq!(bits_needed(3), 2);
        assert_eq!(bits_needed(4), 3);
        assert_eq!(bits_needed(255), 8);
        assert_eq!(bits_needed(256), 9);
    }

    #[test]
    fn max_id_from_vec_and_set() {
        assert_eq!(max_id(vec![5u64, 1, 9, 13, 7]), 13);
        assert_eq!(max_id(vec![5u64, 26, 9, 13, 7]), 26);
        assert_eq!(max_id(Vec::<u64>::new()), 0);
    }

    #[test]
    fn max_id_with_extra() {
        assert_eq!(max_id_with(95, vec![5u64, 1, 9, 13, 7]), 95);
        assert_eq!(max_id_with(10, vec![5u64, 26, 9, 13, 7]), 26);
    }

    #[test]
    fn pack_unpack_round_trip() {
        let packer: Packer<NamedKind> = Packer::new(200).unwrap();
        let handle = packer.pack(NamedKind::Banana, 172, 29).unwrap();
        assert_eq!(packer.unpack_all(handle), (NamedKind::Banana, 172, 29));
    }

    #[test]
    fn pack_overflow_on_peer() {
        let packer: Packer<NamedKind> = Packer::new(7).unwrap(); // peer_width = 3
        assert!(packer.pack(NamedKind::Apple, 8, 0).is_err());
        assert!(packer.pack(NamedKind::Apple, 7, 0).is_ok());
    }

    #[test]
    fn pack_overflow_on_seq() {
        let packer: Packer<NamedKind> = Packer::new(1).unwrap();
        let max_seq = (1u64 << packer.seq_width()) - 1;
        assert!(packer.pack(NamedKind::Apple, 0, max_seq).is_ok());
        assert!(packer.pack(NamedKind::Apple, 0, max_seq + 1).is_err());
    }

    #[test]
    fn pack_overflow_on_kind() {
        #[derive(Debug, Clone, Copy)]
        struct RogueKind(u64);

        impl Kind for RogueKind {
            const MAX_ORDINAL: u64 = 3;

            fn ordinal(&self) -> u64 {
                self.0
            }

            fn from_ordinal(ordinal: u64) -> Self {
                RogueKind(ordinal)
            }
        }

        let packer: Packer<RogueKind> = Packer::new(1).unwrap();
        assert_eq!(packer.kind_width(), 2); // bits_needed(3) == 2
        assert!(packer.pack(RogueKind(3), 0, 0).is_ok());
        // A kind claiming ordinal 4 does not fit in 2 bits, even though
        // RogueKind::MAX_ORDINAL lied about it.
        assert!(packer.pack(RogueKind(4), 0, 0).is_err());
    }

    #[test]
    fn widths_sum_to_64() {
        let packer: Packer<NamedKind> = Packer::new(1000).unwrap();
        assert_eq!(
            packer.kind_width() + packer.peer_width() + packer.seq_width(),
            64
        );
    }
}
