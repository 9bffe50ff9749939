//! Host/agent exchange.
//!
//! The host writes one encoded `FlashRequest` to the agent's stdin and reads
//! one encoded `FlashResult` from its stdout. Encoding is bincode; field order
//! is the struct declaration order, so never reorder fields.

use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Result;

/// Upper bound on an encoded message. Requests are a few hundred bytes.
pub const MAX_MESSAGE_SIZE: u64 = 1 << 20;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashRequest {
    /// Host time elapsed since the run started, for log timestamps
    pub elapsed_time_when_sent: Duration,
    /// Bearer token for the blob store
    pub token: String,
    pub bucket: String,
    pub directory: String,
    /// Wipe the stateful partition on next boot
    pub clobber_stateful: bool,
    pub clear_tpm_owner: bool,
    /// Also flash the inactive mini-OS partition
    pub update_minios: bool,
}

impl fmt::Debug for FlashRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashRequest")
            .field("elapsed_time_when_sent", &self.elapsed_time_when_sent)
            .field("token", &"<redacted>")
            .field("bucket", &self.bucket)
            .field("directory", &self.directory)
            .field("clobber_stateful", &self.clobber_stateful)
            .field("clear_tpm_owner", &self.clear_tpm_owner)
            .field("update_minios", &self.update_minios)
            .finish()
    }
}

/// Post-install steps the host should retry over SSH.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashResult {
    pub retry_disable_rootfs_verification: bool,
    pub retry_clear_tpm_owner: bool,
}

impl FlashResult {
    pub fn needs_remediation(&self) -> bool {
        self.retry_disable_rootfs_verification || self.retry_clear_tpm_owner
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    read_from(bytes)
}

pub fn write_to<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    bincode::serialize_into(&mut *writer, value)?;
    writer.flush()?;
    Ok(())
}

pub fn read_from<T: DeserializeOwned, R: Read>(reader: R) -> Result<T> {
    Ok(bincode::deserialize_from(reader.take(MAX_MESSAGE_SIZE))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn request() -> FlashRequest {
        FlashRequest {
            elapsed_time_when_sent: Duration::from_millis(12_345),
            token: "ya29.token".to_string(),
            bucket: "chromeos-image-archive".to_string(),
            directory: "octopus-release/R120-15662.0.0".to_string(),
            clobber_stateful: true,
            clear_tpm_owner: false,
            update_minios: true,
        }
    }

    #[test]
    fn test_request_survives_pipe() {
        let mut pipe = Vec::new();
        write_to(&mut pipe, &request()).unwrap();
        let back: FlashRequest = read_from(pipe.as_slice()).unwrap();
        assert_eq!(back, request());
    }

    #[test]
    fn test_result_flags_keep_their_meaning() {
        let result = FlashResult {
            retry_disable_rootfs_verification: false,
            retry_clear_tpm_owner: true,
        };
        let back: FlashResult = decode(&encode(&result).unwrap()).unwrap();
        assert!(back.retry_clear_tpm_owner);
        assert!(!back.retry_disable_rootfs_verification);
        assert!(back.needs_remediation());
        assert!(!FlashResult::default().needs_remediation());
    }

    #[test]
    fn test_truncated_request_is_wire_error() {
        let bytes = encode(&request()).unwrap();
        let err = decode::<FlashRequest>(&bytes[..bytes.len() / 2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Wire);
    }

    #[test]
    fn test_debug_hides_token() {
        assert!(!format!("{:?}", request()).contains("ya29"));
    }
}
