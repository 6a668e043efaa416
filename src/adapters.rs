//! Provider normalization: driver call routing plus the adapters that make PostgreSQL
//! and Oracle behave like the other providers.

pub(crate) mod dispatch;
pub(crate) mod postgres_out;
pub(crate) mod ref_cursor;

use crate::options::DbOptions;
use crate::request::CommandRequest;
use crate::transaction::ambient;
use crate::types::Provider;

/// Provider a request will actually run against.
///
/// An explicit connection wins, then the ambient scope's connection, then the options.
pub(crate) fn resolve_provider(request: &CommandRequest, options: &DbOptions) -> Provider {
    if let Some(external) = &request.connection {
        return external.connection.provider();
    }
    if let Some(frame) = ambient::current() {
        return frame.connection.provider();
    }
    request
        .options
        .as_ref()
        .map_or(options.provider, |opts| opts.provider)
}
