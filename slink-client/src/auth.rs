/// Supplier of v4 `AUTH` credentials.
///
/// Installed via
/// [`SeedLinkConnection::set_auth`](crate::SeedLinkConnection::set_auth).
/// During v4 negotiation the client calls [`auth_value`] and sends the
/// returned token verbatim as `AUTH <value>`; once the command round-trip
/// finishes (either way) it calls [`auth_finish`] so the provider can
/// zero buffers or release resources.
///
/// [`auth_value`]: AuthProvider::auth_value
/// [`auth_finish`]: AuthProvider::auth_finish
pub trait AuthProvider: Send {
    /// Produce the credential for `server`, or `None` to skip `AUTH`.
    fn auth_value(&mut self, server: &str) -> Option<String>;

    /// Called after the credential has been used.
    fn auth_finish(&mut self, _server: &str) {}
}

/// A fixed credential string.
pub struct StaticAuth(pub String);

impl AuthProvider for StaticAuth {
    fn auth_value(&mut self, _server: &str) -> Option<String> {
        Some(self.0.clone())
    }
}
