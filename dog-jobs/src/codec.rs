//! JSON payload encoding used by typed job definitions.
//!
//! Payloads are opaque bytes to the store; only the executor registered for a
//! tag interprets them.

use serde::{de::DeserializeOwned, Serialize};

use crate::{EngineError, EngineResult, JobError};

/// Encode a payload as JSON bytes
pub fn encode<P: Serialize + ?Sized>(payload: &P) -> EngineResult<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| EngineError::SerializationError(e.to_string()))
}

/// Decode a stored payload for the executor of `job_type`
pub fn decode<P: DeserializeOwned>(job_type: &str, bytes: &[u8]) -> Result<P, JobError> {
    serde_json::from_slice(bytes).map_err(|e| JobError::Payload {
        job_type: job_type.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct DeleteWorkspace {
        workspace_id: u64,
    }

    #[test]
    fn decode_failure_names_the_job_type() {
        let err = decode::<DeleteWorkspace>("delete_workspace", b"{\"oops\":1}").unwrap_err();
        assert!(err.is_payload_error());
        assert!(err.to_string().contains("delete_workspace"));
    }
}
