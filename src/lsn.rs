use std::fmt::{self, Display};
use std::str::FromStr;

use crate::errdata;
use crate::error::Error;

/// Log sequence number: a (partition, offset) pair with total order.
/// Partitions correspond to append-only log files; the offset is a byte
/// position within the partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    pub part: u32,
    pub off: u32,
}

impl Lsn {
    /// Sentinel least element.
    pub const NULL: Lsn = Lsn { part: 0, off: 0 };

    pub const fn new(part: u32, off: u32) -> Self {
        Self { part, off }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// The LSN `n` bytes further into the same partition.
    pub fn advance(&self, n: u32) -> Self {
        Self {
            part: self.part,
            off: self.off + n,
        }
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.part, self.off)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (part, off) = s
            .split_once('.')
            .ok_or_else(|| errdata!("malformed lsn {s:?}"))?;
        Ok(Self {
            part: part
                .parse()
                .map_err(|_| errdata!("malformed lsn partition {part:?}"))?,
            off: off
                .parse()
                .map_err(|_| errdata!("malformed lsn offset {off:?}"))?,
        })
    }
}

/// An [`Lsn`] shared between threads without a lock. Packs the pair into a
/// u64 (partition in the high half), which preserves the total order.
pub struct AtomicLsn(std::sync::atomic::AtomicU64);

impl AtomicLsn {
    pub fn new(lsn: Lsn) -> Self {
        Self(std::sync::atomic::AtomicU64::new(Self::pack(lsn)))
    }

    fn pack(lsn: Lsn) -> u64 {
        (lsn.part as u64) << 32 | lsn.off as u64
    }

    pub fn load(&self) -> Lsn {
        let packed = self.0.load(std::sync::atomic::Ordering::Acquire);
        Lsn::new((packed >> 32) as u32, packed as u32)
    }

    pub fn store(&self, lsn: Lsn) {
        self.0
            .store(Self::pack(lsn), std::sync::atomic::Ordering::Release);
    }
}

/// Run numbers assigned by the replacement-selection sorter.
pub type RunNumber = u32;

/// Page number within a volume. The archiver sorts and buckets by this.
pub type PageNum = u32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeId(pub u32);

impl Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies a store (index) within a volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreId {
    pub vol: VolumeId,
    pub store: u32,
}

impl StoreId {
    pub const fn new(vol: VolumeId, store: u32) -> Self {
        Self { vol, store }
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.s{}", self.vol, self.store)
    }
}

/// Full identity of a page: the store it belongs to plus its page number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    pub store: StoreId,
    pub page: PageNum,
}

impl PageId {
    pub const fn new(store: StoreId, page: PageNum) -> Self {
        Self { store, page }
    }

    pub fn is_null(&self) -> bool {
        self.page == 0
    }
}

impl Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.p{}", self.store, self.page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_order_is_partition_major() {
        assert!(Lsn::new(1, 900) < Lsn::new(2, 0));
        assert!(Lsn::new(2, 0) < Lsn::new(2, 1));
        assert!(Lsn::NULL < Lsn::new(1, 0));
    }

    #[test]
    fn lsn_advance_stays_in_partition() {
        let lsn = Lsn::new(3, 100).advance(28);
        assert_eq!(lsn, Lsn::new(3, 128));
    }

    #[test]
    fn lsn_display_parse_roundtrip() {
        let lsn = Lsn::new(12, 34567);
        assert_eq!(lsn.to_string(), "12.34567");
        assert_eq!("12.34567".parse::<Lsn>().unwrap(), lsn);
        assert!("12-34".parse::<Lsn>().is_err());
        assert!("x.34".parse::<Lsn>().is_err());
    }

    #[test]
    fn page_id_orders_by_store_then_page() {
        let store = StoreId::new(VolumeId(1), 1);
        let a = PageId::new(store, 5);
        let b = PageId::new(store, 9);
        assert!(a < b);
        assert!(b < PageId::new(StoreId::new(VolumeId(1), 2), 1));
    }
}
