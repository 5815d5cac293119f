// Copyright 2018-2026 the Deno authors. MIT license.

use bytes::Bytes;
use x509_parser::prelude::*;

use crate::TlsError;

/// Summary of one certificate presented by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
  pub subject: String,
  pub issuer: String,
  /// Upper-case hex.
  pub serial_number: String,
  pub valid_from: String,
  pub valid_to: String,
  pub der: Bytes,
}

impl PeerCertificate {
  pub fn from_der(der: &[u8]) -> Result<Self, TlsError> {
    let (_, cert) = X509Certificate::from_der(der)
      .map_err(|err| TlsError::Certificate(err.to_string()))?;
    let mut serial_number = cert.serial.to_str_radix(16);
    serial_number.make_ascii_uppercase();
    Ok(Self {
      subject: cert.subject().to_string(),
      issuer: cert.issuer().to_string(),
      serial_number,
      valid_from: cert.validity().not_before.to_string(),
      valid_to: cert.validity().not_after.to_string(),
      der: Bytes::copy_from_slice(der),
    })
  }
}
