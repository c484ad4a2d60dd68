//! Self-signed CA bootstrap for `--mitm` when no `--mitm-cacert-file`/
//! `--mitm-cakey-file` pair is supplied: generating cert material is
//! explicitly an app-crate concern (the core only ever signs leaves with
//! whatever `CertificateAuthority` it's handed).

use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};

/// A freshly generated CA certificate and private key, PEM-encoded so they
/// round-trip through `forwarder::mitm::CertificateAuthority::from_pem`
/// exactly like a user-supplied pair would.
pub struct GeneratedCa {
	pub cert_pem: String,
	pub key_pem: String,
}

pub fn generate(org: &str) -> anyhow::Result<GeneratedCa> {
	let key = KeyPair::generate()?;
	let mut params = CertificateParams::new(Vec::new())?;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, format!("{org} MITM Root CA"));
	dn.push(DnType::OrganizationName, org);
	params.distinguished_name = dn;
	params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
	params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(3650);

	let cert = params.self_signed(&key)?;
	Ok(GeneratedCa { cert_pem: cert.pem(), key_pem: key.serialize_pem() })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generates_a_loadable_ca() {
		let ca = generate("Forwarder Test").unwrap();
		assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
		forwarder::mitm::CertificateAuthority::from_pem(&ca.cert_pem, &ca.key_pem).unwrap();
	}
}
