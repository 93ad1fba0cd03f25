//! Storage read API seam.
//!
//! The streaming read service is reached over a transport chosen by the
//! embedding application. Everything in this crate talks to it through
//! [`StorageReadApi`]; [`crate::testing::InMemoryStorage`] implements it
//! without any network.

use async_trait::async_trait;
use bqlink_core::model::{CreateReadSessionRequest, ReadRowsBatch, ReadRowsRequest, ReadSession};
use bqlink_core::Result;
use futures::stream::BoxStream;

/// Stream of encoded row blocks for one stream, starting at the requested offset.
pub type ReadRowsStream = BoxStream<'static, Result<ReadRowsBatch>>;

#[async_trait]
pub trait StorageReadApi: Send + Sync {
    /// Create a read session. The server may return fewer streams than
    /// requested, or none at all for an empty result.
    async fn create_read_session(&self, request: CreateReadSessionRequest) -> Result<ReadSession>;

    /// Open a server stream of row blocks. Errors may surface either from
    /// this call or as items of the returned stream.
    async fn read_rows(&self, request: ReadRowsRequest) -> Result<ReadRowsStream>;
}
