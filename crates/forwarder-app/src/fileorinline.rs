//! `--tls-cert-file`/`--mitm-cacert-file`/etc. accept a filesystem path,
//! `-` for stdin, or `data:base64,<b64>` for inline material (spec.md §6).

use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOrInline {
	Path(PathBuf),
	Stdin,
	Inline(Vec<u8>),
}

#[derive(thiserror::Error, Debug)]
#[error("invalid inline base64 data: {0}")]
pub struct InvalidInlineData(#[from] base64::DecodeError);

impl FromStr for FileOrInline {
	type Err = InvalidInlineData;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s == "-" {
			return Ok(FileOrInline::Stdin);
		}
		if let Some(b64) = s.strip_prefix("data:base64,") {
			use base64::Engine;
			let data = base64::engine::general_purpose::STANDARD.decode(b64)?;
			return Ok(FileOrInline::Inline(data));
		}
		Ok(FileOrInline::Path(PathBuf::from(s)))
	}
}

impl FileOrInline {
	pub async fn read_to_string(&self) -> anyhow::Result<String> {
		match self {
			FileOrInline::Path(path) => Ok(fs_err::tokio::read_to_string(path).await?),
			FileOrInline::Inline(data) => Ok(String::from_utf8(data.clone())?),
			FileOrInline::Stdin => {
				let mut buf = String::new();
				std::io::stdin().read_to_string(&mut buf)?;
				Ok(buf)
			},
		}
	}
}
