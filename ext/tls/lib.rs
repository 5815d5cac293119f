// Copyright 2018-2026 the Deno authors. MIT license.

mod cert;
mod connection;
mod context;
mod engine;

pub use rustls;
pub use rustls_pemfile;
use skiff_core::ErrorCode;
use skiff_core::OsError;

pub use crate::cert::PeerCertificate;
pub use crate::connection::TlsConnection;
pub use crate::context::ClientAuth;
pub use crate::context::EngineMode;
pub use crate::context::NoCertificateVerification;
pub use crate::context::TlsContext;
pub use crate::context::TlsOptions;
pub use crate::context::create_root_cert_store;
pub use crate::context::load_certs;
pub use crate::context::load_crls;
pub use crate::context::load_private_keys;
pub use crate::engine::EngineResult;
pub use crate::engine::EngineStatus;
pub use crate::engine::TlsEngine;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
  #[error("Unable to decode certificate")]
  CertDecode,
  #[error("No certificates found in certificate data")]
  CertNotFound,
  #[error("Unable to decode key")]
  KeyDecode,
  #[error("No keys found in key data")]
  KeyNotFound,
  #[error("Unable to add pem file to certificate store: {0}")]
  CaCert(String),
  #[error("Unable to decode CRL: {0}")]
  Crl(String),
  #[error("no cipher match: {0}")]
  NoCipherMatch(String),
  #[error("no certificate configured for server mode")]
  NoServerCertificate,
  #[error("invalid server name: {0}")]
  ServerName(String),
  #[error("unable to parse certificate: {0}")]
  Certificate(String),
  #[error(
    "Inbound closed before receiving peer's close_notify: possible truncation attack?"
  )]
  Truncated,
  #[error("engine is closed")]
  Closed,
  #[error("{0}")]
  Engine(String),
  #[error(transparent)]
  Rustls(#[from] rustls::Error),
  #[error(transparent)]
  Verifier(#[from] rustls::server::VerifierBuilderError),
}

impl From<TlsError> for OsError {
  fn from(err: TlsError) -> Self {
    OsError::with_message(ErrorCode::Io, err.to_string())
  }
}
