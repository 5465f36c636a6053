//! TLS material: builds the `rustls` client/server configs chirp needs
//! for mutual X.509 authentication, from `Config::cert_chain_pem`.
//!
//! Simplification (documented in `DESIGN.md`): `CERT_CHAIN_PEM` is a
//! single PEM bundle holding this node's own certificate, its private
//! key, and the cluster's trusted CA certificate(s), in that order —
//! the same bundle both presents this node's identity and validates a
//! peer's, which is what "authentication beyond mutual X.509" being a
//! non-goal implies: there is exactly one trust root, shared by every
//! node in the mesh. `DH_PARAMS_PEM` is accepted and validated for
//! config-surface compatibility with the original library, but has no
//! effect on the `rustls` backend, which has no legacy
//! classic-Diffie-Hellman parameter hook and selects its own cipher
//! suites.

use std::io::Cursor;

use async_tls::{TlsAcceptor, TlsConnector};
use rustls::internal::pemfile;
use rustls::{AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};

use crate::config::Config;
use crate::error::*;

/// The `TlsAcceptor`/`TlsConnector` pair a `Protocol` hands to every
/// connection that needs TLS bracketing.
#[derive(Clone)]
pub struct TlsMaterial {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

fn split_bundle(pem: &[u8]) -> Result<(Vec<Certificate>, PrivateKey, Vec<Certificate>)> {
    let mut cursor = Cursor::new(pem);
    let certs = pemfile::certs(&mut cursor)
        .map_err(|_| Error::simple(ErrorKind::TlsError))?;
    if certs.is_empty() {
        return Err(Error::wrapped(ErrorKind::TlsError, "CERT_CHAIN_PEM has no certificates"));
    }

    cursor.set_position(0);
    let mut keys = pemfile::pkcs8_private_keys(&mut cursor)
        .map_err(|_| Error::simple(ErrorKind::TlsError))?;
    if keys.is_empty() {
        cursor.set_position(0);
        keys = pemfile::rsa_private_keys(&mut cursor)
            .map_err(|_| Error::simple(ErrorKind::TlsError))?;
    }
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| Error::wrapped(ErrorKind::TlsError, "CERT_CHAIN_PEM has no private key"))?;

    // own leaf cert is first, remaining entries are the trusted CA chain
    let own_cert = certs[0].clone();
    let ca_chain = certs[1..].to_vec();
    let ca_chain = if ca_chain.is_empty() { vec![own_cert.clone()] } else { ca_chain };
    Ok((vec![own_cert], key, ca_chain))
}

/// Builds the TLS material for `config`. Callers only invoke this when
/// `!config.disable_encryption`; `Config::validate` already ensures
/// `cert_chain_pem`/`dh_params_pem` are present in that case.
pub fn build(config: &Config) -> Result<TlsMaterial> {
    let pem = config
        .cert_chain_pem
        .as_deref()
        .ok_or_else(|| Error::wrapped(ErrorKind::ValueError, "CERT_CHAIN_PEM is required"))?;
    // DH_PARAMS_PEM is validated for presence only; see module doc.
    let _dh = config
        .dh_params_pem
        .as_deref()
        .ok_or_else(|| Error::wrapped(ErrorKind::ValueError, "DH_PARAMS_PEM is required"))?;

    let (own_cert, key, ca_chain) = split_bundle(pem)?;

    let mut root_store = RootCertStore::empty();
    for ca in &ca_chain {
        root_store
            .add(ca)
            .map_err(|_| Error::wrapped(ErrorKind::TlsError, "invalid CA certificate in CERT_CHAIN_PEM"))?;
    }

    let mut server_config = ServerConfig::new(AllowAnyAuthenticatedClient::new(root_store.clone()));
    server_config
        .set_single_cert(own_cert.clone(), key.clone())
        .map_err(|e| Error::wrapped(ErrorKind::TlsError, e.to_string()))?;

    let mut client_config = ClientConfig::new();
    client_config.root_store = root_store;
    client_config
        .set_single_client_cert(own_cert, key)
        .map_err(|e| Error::wrapped(ErrorKind::TlsError, e.to_string()))?;

    Ok(TlsMaterial {
        acceptor: server_config.into(),
        connector: client_config.into(),
    })
}
