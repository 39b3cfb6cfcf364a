//! Archive acquisition: resolve, fetch, verify, extract

pub mod cache;
pub mod catalog;
pub mod checksum;
pub mod extract;
pub mod fetch;
pub mod resolve;
pub mod source;

pub use cache::{ArchiveCache, CacheError, CacheStatus, CompletionMeta};
pub use catalog::SymbolCatalog;
pub use checksum::{IntegrityError, Verification};
pub use extract::{ArchiveExtractor, ExtractError, Rows};
pub use fetch::{ArchiveFetcher, DownloadedArchive, FetchError, Fetched, RetryPolicy};
pub use resolve::{resolve, ResolveError, Selection};
pub use source::{ArchiveSource, HttpSource, SourceError};
