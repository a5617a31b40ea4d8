//! Version comparison between content payloads.

use crate::content::ContentPayload;

/// Whether `candidate` is strictly newer than `current`.
///
/// Only `last_updated` is compared. Equal timestamps are not newer, so an
/// identical refetch never counts as a change.
pub fn is_newer(candidate: &ContentPayload, current: &ContentPayload) -> bool {
  candidate.last_updated > current.last_updated
}
