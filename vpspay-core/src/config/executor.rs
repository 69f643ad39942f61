//! Outbound executor configuration.

#[derive(Clone)]
pub struct ExecutorConfig {
    /// Hex-encoded secp256k1 private key of the service wallet.
    pub private_key: String,
    pub gas_limit: u64,
}

impl std::fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("private_key", &"<redacted>")
            .field("gas_limit", &self.gas_limit)
            .finish()
    }
}
