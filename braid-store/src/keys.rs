//! Key-path construction for the log-store books.
//!
//! Books share the layout `/thread/<book>/<base32-thread-id>/...`, with
//! log-scoped entries ending in the base32 form of the log id.

use braid_core::{LogId, ThreadId};

use crate::error::StoreError;

pub(crate) fn b32(bytes: &[u8]) -> String {
    let mut encoded = data_encoding::BASE32_NOPAD.encode(bytes);
    encoded.make_ascii_lowercase();
    encoded
}

pub(crate) fn b32_decode(component: &str) -> Result<Vec<u8>, StoreError> {
    let upper = component.to_ascii_uppercase();
    data_encoding::BASE32_NOPAD
        .decode(upper.as_bytes())
        .map_err(|_| StoreError::Core(braid_core::Error::InvalidKey))
}

pub(crate) fn book_prefix(book: &str) -> Vec<u8> {
    format!("/thread/{book}/").into_bytes()
}

pub(crate) fn thread_prefix(book: &str, thread: &ThreadId) -> Vec<u8> {
    format!("/thread/{book}/{thread}/").into_bytes()
}

pub(crate) fn log_key(book: &str, thread: &ThreadId, log: &LogId) -> Vec<u8> {
    let mut key = thread_prefix(book, thread);
    key.extend_from_slice(b32(&log.to_bytes()).as_bytes());
    key
}

/// Parse the thread-id component out of a full book key.
pub(crate) fn thread_component(book: &str, key: &[u8]) -> Option<ThreadId> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(&format!("/thread/{book}/"))?;
    let (thread, _) = rest.split_once('/')?;
    thread.parse().ok()
}

/// Parse the trailing log-id component out of a log-scoped book key.
pub(crate) fn log_component(key: &[u8]) -> Option<LogId> {
    let key = std::str::from_utf8(key).ok()?;
    let component = key.rsplit('/').next()?;
    LogId::from_bytes(&b32_decode(component).ok()?).ok()
}
