//! Thin boundary over the archive codec used for mount transfers.
//!
//! Mount payloads arrive as gzip-compressed tarballs, both over the tunnel
//! and from the platform download endpoint.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

pub fn unpack(reader: impl Read, target: &Path) -> Result<()> {
    fs::create_dir_all(target)
        .with_context(|| format!("create target directory {}", target.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive
        .unpack(target)
        .with_context(|| format!("unpack archive into {}", target.display()))?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    /// Builds a single-file tar.gz archive in memory.
    pub fn archive_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, contents).unwrap();
        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap()
    }
}
