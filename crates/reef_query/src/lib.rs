//! HTTP query plane: map-reduce views, full-text search, SQL-like queries
//! and analytics, all streamed row-by-row through one lazy reader.

pub mod analytics;
pub mod executor;
pub mod n1ql;
pub mod retryability;
pub mod search;
pub mod streaming;
pub mod views;

pub use analytics::AnalyticsRequest;
pub use executor::{QueryClient, QueryExecutor, QueryResult};
pub use n1ql::N1qlRequest;
pub use retryability::is_retryable_http;
pub use search::{SearchRequest, SearchSort};
pub use streaming::{ChunkSource, RowStream};
pub use views::ViewQuery;
