//! Function deployment packages.
//!
//! Collaborator functions run the `collaborator-runtime` binary on a
//! custom runtime, so a package is a zip holding one executable named
//! `bootstrap`. Entries carry a fixed timestamp so the same binary always
//! yields the same code hash, which lets re-runs skip unchanged uploads.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use crate::error::ProvisionError;

/// Entry point name required by custom runtimes.
pub const BOOTSTRAP: &str = "bootstrap";
pub const CUSTOM_RUNTIME: &str = "provided.al2023";

/// Where the bootstrap executable comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSource {
    /// Executable bytes held in memory
    Inline(Vec<u8>),
    /// Path of a built executable
    Binary(PathBuf),
}

/// A zipped deployment package and its code hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPackage {
    bytes: Vec<u8>,
    code_sha256: String,
}

impl DeploymentPackage {
    pub fn build(source: &PackageSource) -> Result<Self, ProvisionError> {
        let executable = match source {
            PackageSource::Inline(bytes) => bytes.clone(),
            PackageSource::Binary(path) => read_binary(path)?,
        };
        if executable.is_empty() {
            return Err(ProvisionError::Package("bootstrap executable is empty".to_string()));
        }

        let bytes = zip_bootstrap(&executable)?;
        let code_sha256 = code_sha256(&bytes);
        Ok(Self { bytes, code_sha256 })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Base64 SHA-256 of the zip, as the platform reports it.
    pub fn code_sha256(&self) -> &str {
        &self.code_sha256
    }
}

fn read_binary(path: &Path) -> Result<Vec<u8>, ProvisionError> {
    std::fs::read(path).map_err(|e| {
        ProvisionError::Package(format!(
            "cannot read runtime binary {}: {} (build it with `cargo build --release --bin collaborator-runtime`)",
            path.display(),
            e
        ))
    })
}

fn zip_bootstrap(executable: &[u8]) -> Result<Vec<u8>, ProvisionError> {
    let mut buffer = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(0o755);

        zip.start_file(BOOTSTRAP, options)
            .map_err(|e| ProvisionError::Package(format!("zip: {}", e)))?;
        zip.write_all(executable)?;
        zip.finish()
            .map_err(|e| ProvisionError::Package(format!("zip: {}", e)))?;
    }
    Ok(buffer)
}

/// Base64-encoded SHA-256 of a package.
pub fn code_sha256(bytes: &[u8]) -> String {
    BASE64.encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn package_contains_executable_bootstrap() {
        let package =
            DeploymentPackage::build(&PackageSource::Inline(b"#!/bin/sh\n".to_vec())).unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(package.bytes())).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_name(BOOTSTRAP).unwrap();
        assert_eq!(entry.unix_mode().map(|m| m & 0o777), Some(0o755));
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "#!/bin/sh\n");
    }

    #[test]
    fn same_input_gives_same_hash() {
        let a = DeploymentPackage::build(&PackageSource::Inline(vec![1, 2, 3])).unwrap();
        let b = DeploymentPackage::build(&PackageSource::Inline(vec![1, 2, 3])).unwrap();
        let c = DeploymentPackage::build(&PackageSource::Inline(vec![1, 2, 4])).unwrap();
        assert_eq!(a.code_sha256(), b.code_sha256());
        assert_ne!(a.code_sha256(), c.code_sha256());
        assert_eq!(a.code_sha256(), code_sha256(a.bytes()));
    }

    #[test]
    fn binary_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collaborator-runtime");
        std::fs::write(&path, b"ELF").unwrap();
        assert!(DeploymentPackage::build(&PackageSource::Binary(path)).is_ok());

        let missing = DeploymentPackage::build(&PackageSource::Binary(dir.path().join("nope")));
        assert!(matches!(missing, Err(ProvisionError::Package(_))));
    }
}
