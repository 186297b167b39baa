//! On-disk spooling of fragments
//!
//! Fragments are staged in anonymous temporary files so an object never has
//! to fit in memory: upload encodes window by window into one spool file per
//! fragment, download fetches each fragment into its own spool file before
//! decoding.

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, Write};
use std::path::Path;

use crate::error::{Error, Result};

/// Fresh unlinked temporary file, in `dir` when given
pub(crate) fn spool_file(dir: Option<&Path>) -> Result<File> {
    let file = match dir {
        Some(dir) => tempfile::tempfile_in(dir)?,
        None => tempfile::tempfile()?,
    };
    Ok(file)
}

/// Hex BLAKE3 digest of everything left in `reader`
pub(crate) fn checksum_of<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    io::copy(reader, &mut hasher)?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// A fully written fragment, rewound for reading
#[derive(Debug)]
pub(crate) struct SpooledFragment {
    pub file: File,
    pub size: u64,
    pub checksum: String,
}

/// Spool writer that hashes the fragment as it is written
pub(crate) struct FragmentWriter {
    file: BufWriter<File>,
    hasher: blake3::Hasher,
    size: u64,
}

impl FragmentWriter {
    pub(crate) fn new(file: File) -> Self {
        Self {
            file: BufWriter::new(file),
            hasher: blake3::Hasher::new(),
            size: 0,
        }
    }

    pub(crate) fn finish(self) -> Result<SpooledFragment> {
        let mut file = self
            .file
            .into_inner()
            .map_err(|e| Error::Io(e.into_error()))?;
        file.rewind()?;
        Ok(SpooledFragment {
            file,
            size: self.size,
            checksum: self.hasher.finalize().to_hex().to_string(),
        })
    }
}

impl Write for FragmentWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fragment_writer_hashes_what_it_writes() {
        let mut writer = FragmentWriter::new(spool_file(None).unwrap());
        writer.write_all(b"first window,").unwrap();
        writer.write_all(b" second window").unwrap();

        let mut spooled = writer.finish().unwrap();
        assert_eq!(spooled.size, 27);
        assert_eq!(
            spooled.checksum,
            blake3::hash(b"first window, second window").to_hex().to_string()
        );

        let mut contents = Vec::new();
        spooled.file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"first window, second window");
    }

    #[test]
    fn test_spool_in_directory_leaves_no_files() {
        let tmp = TempDir::new().unwrap();
        let mut file = spool_file(Some(tmp.path())).unwrap();
        file.write_all(b"staged").unwrap();
        file.rewind().unwrap();

        assert_eq!(checksum_of(&mut file).unwrap(), blake3::hash(b"staged").to_hex().to_string());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_spool_in_missing_directory_fails() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            spool_file(Some(&tmp.path().join("missing"))),
            Err(Error::Io(_))
        ));
    }
}
