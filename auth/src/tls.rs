// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{parse_x509_certificate, X509Certificate};

use crate::{
    AuthError, AuthenticationMetadata, Authenticator, MetadataExtractor, RequestContext,
};

/// Validates the TLS client certificate presented by the peer.
///
/// The leaf certificate must chain to one of the configured CA certificates,
/// carry the client-auth extended key usage, and be valid at the configured
/// wall clock. A JMESPath predicate over a JSON view of the certificate
/// (DNS names, email addresses, URIs, subject, issuer) must yield `true`,
/// and a second expression extracts the authentication metadata from the
/// same view.
pub struct ClientCertificateAuthenticator {
    ca_certificates: Vec<Vec<u8>>,
    validation: MetadataExtractor,
    metadata_extractor: MetadataExtractor,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl ClientCertificateAuthenticator {
    pub fn new(
        ca_certificates: Vec<Vec<u8>>,
        validation: MetadataExtractor,
        metadata_extractor: MetadataExtractor,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        ClientCertificateAuthenticator {
            ca_certificates,
            validation,
            metadata_extractor,
            clock,
        }
    }

    fn verify_chain(&self, leaf: &X509Certificate<'_>) -> Result<(), AuthError> {
        for ca_der in &self.ca_certificates {
            let (_, ca) = match parse_x509_certificate(ca_der) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Err(AuthError::Internal(format!(
                        "Configured CA certificate is malformed: {err}"
                    )))
                }
            };
            if ca.subject() == leaf.issuer()
                && leaf.verify_signature(Some(ca.public_key())).is_ok()
            {
                return Ok(());
            }
        }
        Err(AuthError::Unauthenticated(
            "Client certificate does not chain to a trusted CA".to_owned(),
        ))
    }
}

fn certificate_view(certificate: &X509Certificate<'_>) -> serde_json::Value {
    let mut dns_names: Vec<String> = Vec::new();
    let mut email_addresses: Vec<String> = Vec::new();
    let mut uris: Vec<String> = Vec::new();
    for extension in certificate.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(name) => dns_names.push((*name).to_owned()),
                    GeneralName::RFC822Name(name) => email_addresses.push((*name).to_owned()),
                    GeneralName::URI(name) => uris.push((*name).to_owned()),
                    _ => {}
                }
            }
        }
    }
    json!({
        "dnsNames": dns_names,
        "emailAddresses": email_addresses,
        "uris": uris,
        "subject": certificate.subject().to_string(),
        "issuer": certificate.issuer().to_string(),
    })
}

#[async_trait]
impl Authenticator for ClientCertificateAuthenticator {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let leaf_der = context.peer_certificates.first().ok_or_else(|| {
            AuthError::Unauthenticated(
                "Connection was not established with a client certificate".to_owned(),
            )
        })?;
        let (_, certificate) = parse_x509_certificate(leaf_der).map_err(|err| {
            AuthError::Unauthenticated(format!("Client certificate is malformed: {err}"))
        })?;

        let now = (self.clock)().timestamp();
        let validity = certificate.validity();
        if now < validity.not_before.timestamp() || now > validity.not_after.timestamp() {
            return Err(AuthError::Unauthenticated(
                "Client certificate is not valid at the current time".to_owned(),
            ));
        }

        let client_auth = certificate
            .extended_key_usage()
            .ok()
            .flatten()
            .map(|eku| eku.value.client_auth || eku.value.any)
            .unwrap_or(false);
        if !client_auth {
            return Err(AuthError::Unauthenticated(
                "Client certificate does not permit client authentication".to_owned(),
            ));
        }

        self.verify_chain(&certificate)?;

        let view = certificate_view(&certificate);
        if !self.validation.evaluate_predicate(&view)? {
            return Err(AuthError::Unauthenticated(
                "Client certificate did not match the validation policy".to_owned(),
            ));
        }
        self.metadata_extractor.extract(&view)
    }
}
