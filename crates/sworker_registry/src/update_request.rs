//! Conditional update requests built from recorded validators.

use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use http::{Method, Request};

use crate::error::Result;
use crate::record::{ContentState, WorkerRecord};

/// Build a GET for `record.url` carrying whichever cache validators were
/// stored with the record's content.
///
/// A stored `ETag` becomes `If-None-Match`, a stored `Last-Modified` becomes
/// `If-Modified-Since`. With neither the request is unconditional. Validators
/// only count once the content is populated; an unfinished record would
/// otherwise get a 304 for bytes the store never received.
pub fn build_update_request(record: &WorkerRecord) -> Result<Request<()>> {
    let mut builder = Request::builder().method(Method::GET).uri(record.url.as_str());

    let validators = match record.content_state() {
        ContentState::Populated => record.headers.as_ref(),
        ContentState::Empty | ContentState::Unfinished => None,
    };
    if let Some(headers) = validators {
        if let Some(etag) = headers.get(ETAG.as_str()) {
            builder = builder.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = headers.get(LAST_MODIFIED.as_str()) {
            builder = builder.header(IF_MODIFIED_SINCE, last_modified);
        }
    }

    Ok(builder.body(())?)
}
