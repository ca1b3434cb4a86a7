use dg_domain::error::Error;

/// Map reqwest failures into the shared error type, preserving the
/// timeout distinction (timeouts are worth telling apart in logs).
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}
