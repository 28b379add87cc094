use std::io;

/// Longest query string sent as-is.
pub const MAX_QUERY_LEN: usize = 4096;

// Collectors match on this exact error beacon, so `max` stays at its historical value rather than `MAX_QUERY_LEN`.
const OVERSIZE_MAX: &str = "2036";

/// Fires beacon requests.
///
/// In a page, this is the 1x1 image request. Implementations are free to use any HTTP client, or to record URLs for
/// later delivery.
pub trait BeaconTransport {
    /// Requests `url`.
    ///
    /// # Errors
    ///
    /// If the request could not be made, an error is returned. Beacons are never retried.
    fn fire(&mut self, url: &str) -> io::Result<()>;
}

impl<F> BeaconTransport for F
where
    F: FnMut(&str) -> io::Result<()>,
{
    fn fire(&mut self, url: &str) -> io::Result<()> {
        self(url)
    }
}

/// Builds the query string for a beacon.
///
/// Returns `None` if there is nothing to send. Query strings longer than [`MAX_QUERY_LEN`] are replaced by an error
/// beacon that reports the length, so the collector can count oversized payloads.
pub(crate) fn build_query(params: &[(String, String)]) -> Option<String> {
    if params.is_empty() {
        return None;
    }

    let query = serde_urlencoded::to_string(params).ok()?;
    if query.len() <= MAX_QUERY_LEN {
        return Some(query);
    }

    let len = query.len().to_string();
    serde_urlencoded::to_string([("err", "len"), ("max", OVERSIZE_MAX), ("len", len.as_str())]).ok()
}

/// Appends `query` to the beacon image URL.
pub(crate) fn beacon_url(image: &str, query: &str) -> String {
    let mut url = String::with_capacity(image.len() + 1 + query.len());
    url.push_str(image);
    url.push('?');
    url.push_str(query);
    url
}
