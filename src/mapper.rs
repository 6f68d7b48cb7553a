//! Turns decoded response bodies into typed records.
//!
//! Nothing here interprets the `error` field of a search body; deciding
//! whether a body is a failure is the client's job.

use crate::error::Result;
use crate::types::{QuotaStatus, RateLimitInfo, SearchResult};
use serde_json::Value;

pub fn to_quota_status(body: Value, limits: RateLimitInfo) -> Result<QuotaStatus> {
    let mut status: QuotaStatus = serde_json::from_value(body)?;
    status.limits = limits;
    Ok(status)
}

pub fn to_search_result(body: Value, limits: RateLimitInfo) -> Result<SearchResult> {
    let mut result: SearchResult = serde_json::from_value(body)?;
    result.limits = limits;
    Ok(result)
}
