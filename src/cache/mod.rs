//! Caching Layers
//!
//! - [`download`]: URI-fetched inputs, keyed by normalized URI
//! - [`call`]: task outputs, keyed by task identity and inputs
//!
//! Both are shared with other processes; [`lock`] provides the advisory
//! locking discipline and [`storage`] the pluggable call cache backends.

pub mod call;
pub mod download;
pub mod downloader;
pub mod lock;
pub mod storage;

pub use call::{call_key, CallCache, CallCacheEntry, FileStamp};
pub use download::{DownloadCache, Localized};
pub use downloader::{CommandDownloader, Downloader, DownloaderRegistry};
pub use lock::{FileLock, LockMode};
pub use storage::{CacheStorage, JsonDirStorage, StorageRegistry};
