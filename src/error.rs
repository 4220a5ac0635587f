/// Reasons an inbound message cannot be turned into an output message.
///
/// Every variant means the message itself is at fault, so redelivering it
/// cannot succeed. The bridge rejects such messages without requeueing them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Inbound message carries no correlation identifier (ce-id)")]
    MissingCorrelationId,

    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("Malformed event envelope: {0}")]
    MalformedEnvelope(String),
}

impl Error {
    /// Returns `true` when `err` wraps one of the malformed-input variants.
    pub fn is_malformed_input(err: &anyhow::Error) -> bool {
        err.downcast_ref::<Error>().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classifies_wrapped_errors() {
        let err: anyhow::Result<()> = Err(Error::MissingCorrelationId).context("announce");
        assert!(Error::is_malformed_input(&err.unwrap_err()));

        let other = anyhow::anyhow!("broker went away");
        assert!(!Error::is_malformed_input(&other));
    }

    #[test]
    fn payload_errors_convert_from_serde() {
        let serde_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = serde_err.into();
        assert!(matches!(err, Error::MalformedPayload(_)));
        assert!(err.to_string().starts_with("Malformed payload"));
    }
}
