use host_cache::ResolveError;

/// Error detail surfaced by a completed request.
///
/// `error` carries the unsquashed kind (the completion callback receives
/// the squashed form, see [`ResolveError::squash`]); `None` is success.
/// `is_secure_network_error` records that the failure came from a DoH
/// transport, so callers can account secure and insecure failures
/// separately.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveErrorInfo {
    pub error: Option<ResolveError>,
    pub is_secure_network_error: bool,
}

impl ResolveErrorInfo {
    pub fn ok() -> Self {
        ResolveErrorInfo::default()
    }

    pub fn from_error(error: ResolveError) -> Self {
        ResolveErrorInfo {
            error: Some(error),
            is_secure_network_error: false,
        }
    }

    pub fn secure(error: ResolveError) -> Self {
        ResolveErrorInfo {
            error: Some(error),
            is_secure_network_error: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// The result delivered through `start`/`wait`: `Ok` on success, the
    /// squashed error otherwise.
    pub fn squashed(&self) -> Result<(), ResolveError> {
        match self.error {
            None => Ok(()),
            Some(error) => Err(error.squash()),
        }
    }
}
