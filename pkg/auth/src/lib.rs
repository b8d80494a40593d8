//! Client-certificate identities and their binding to agents.

use x509_parser::prelude::{FromDer, X509Certificate};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no client certificate presented")]
    MissingCertificate,
    #[error("client certificate could not be parsed: {0}")]
    InvalidCertificate(String),
    #[error("client certificate subject is missing {0}")]
    MissingSubjectField(&'static str),
    #[error("certificate identity '{identity}' is not bound to agent '{agent}'")]
    AgentMismatch { identity: String, agent: String },
}

/// `organization/common-name` taken from a certificate subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertificateIdentity {
    pub organization: String,
    pub common_name: String,
}

impl CertificateIdentity {
    pub fn new(organization: &str, common_name: &str) -> Self {
        Self {
            organization: organization.to_string(),
            common_name: common_name.to_string(),
        }
    }

    pub fn as_string(&self) -> String {
        format!("{}/{}", self.organization, self.common_name)
    }

    /// A certificate is bound to exactly one agent: `O` is the namespace, `CN` the name.
    pub fn is_bound_to(&self, namespace: &str, name: &str) -> bool {
        self.organization == namespace && self.common_name == name
    }
}

impl std::fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization, self.common_name)
    }
}

pub fn identity_from_certificate_der(der: &[u8]) -> Result<CertificateIdentity, IdentityError> {
    if der.is_empty() {
        return Err(IdentityError::MissingCertificate);
    }
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|err| IdentityError::InvalidCertificate(err.to_string()))?;
    let subject = cert.subject();

    let organization = subject
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(IdentityError::MissingSubjectField("organization"))?;
    let common_name = subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(IdentityError::MissingSubjectField("common name"))?;

    Ok(CertificateIdentity::new(organization, common_name))
}

pub fn verify_identity_for_agent(
    identity: &CertificateIdentity,
    namespace: &str,
    name: &str,
) -> Result<(), IdentityError> {
    if identity.is_bound_to(namespace, name) {
        return Ok(());
    }
    Err(IdentityError::AgentMismatch {
        identity: identity.as_string(),
        agent: format!("{namespace}/{name}"),
    })
}
