// Copyright 2026 the Cinder authors. MIT license.

use cinder_core::ExtraInfo;
use sha2::Digest;

use crate::error::FetchError;

/// Pinned digest of a server's leaf certificate. The digest length selects
/// the hash function; md5 (16) and sha1 (20) digests are recognized but
/// rejected as insecure, leaving sha256 (32) as the accepted form.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SslFingerprint {
  digest: Vec<u8>,
}

impl SslFingerprint {
  pub fn new(digest: Vec<u8>) -> Result<SslFingerprint, FetchError> {
    match digest.len() {
      16 | 20 => Err(FetchError::InvalidUrl(
        "md5 and sha1 fingerprints are insecure, use sha256".into(),
      )),
      32 => Ok(SslFingerprint { digest }),
      other => Err(FetchError::InvalidUrl(format!(
        "fingerprint has invalid length {other}, expected a sha256 digest"
      ))),
    }
  }

  pub fn digest(&self) -> &[u8] {
    &self.digest
  }

  /// Compares the pinned digest against the connection's peer certificate.
  /// A connection without TLS facts passes vacuously.
  pub fn check(&self, info: &ExtraInfo) -> Result<(), FetchError> {
    let Some(certificate) = &info.peer_certificate else {
      return Ok(());
    };
    let received = sha2::Sha256::digest(certificate);
    if received.as_slice() == self.digest.as_slice() {
      Ok(())
    } else {
      Err(FetchError::FingerprintMismatch)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insecure_digest_lengths_are_rejected() {
    assert!(SslFingerprint::new(vec![0; 16]).is_err());
    assert!(SslFingerprint::new(vec![0; 20]).is_err());
    assert!(SslFingerprint::new(vec![0; 31]).is_err());
    assert!(SslFingerprint::new(vec![0; 32]).is_ok());
  }

  #[test]
  fn check_compares_sha256_of_the_certificate() {
    let certificate = b"not really DER but good enough".to_vec();
    let digest = sha2::Sha256::digest(&certificate).to_vec();
    let fingerprint = SslFingerprint::new(digest).unwrap();

    let mut info = ExtraInfo::default();
    info.peer_certificate = Some(certificate);
    assert!(fingerprint.check(&info).is_ok());

    info.peer_certificate = Some(b"a different certificate".to_vec());
    assert!(matches!(
      fingerprint.check(&info),
      Err(FetchError::FingerprintMismatch)
    ));
  }

  #[test]
  fn plain_connections_pass() {
    let fingerprint = SslFingerprint::new(vec![7; 32]).unwrap();
    assert!(fingerprint.check(&ExtraInfo::default()).is_ok());
  }
}
