pub mod archive;
pub mod btree;
pub mod bufpool;
pub mod config;
pub mod error;
pub mod flock;
pub mod log;
pub mod lsn;
pub mod txn;

pub use btree::Btree;
pub use bufpool::{BufferPool, LatchMode};
pub use config::ArchiverConfig;
pub use error::{Error, ErrorKind, Result};
pub use lsn::{Lsn, PageId, PageNum, StoreId, VolumeId};
