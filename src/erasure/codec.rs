//! Streaming adapter around [`CodingScheme`]
//!
//! Objects are padded and split into `k` equal data fragments, then coded.
//! Objects larger than the window size are coded window by window, and each
//! window's fragment output is appended to the same per-fragment channel.

use std::io::{Read, Write};
use std::sync::Arc;

use super::scheme::CodingScheme;
use crate::error::{Error, Result};

/// Default window: 4 MiB of object data per coding pass
pub const DEFAULT_WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Output of a whole-object encode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFragments {
    pub data: Vec<Vec<u8>>,
    pub coding: Vec<Vec<u8>>,
    pub fragment_size: usize,
}

impl EncodedFragments {
    /// All fragments, data first
    pub fn into_fragments(self) -> Vec<Vec<u8>> {
        let mut all = self.data;
        all.extend(self.coding);
        all
    }
}

/// Byte-stream encoder/decoder for a coding scheme
#[derive(Debug, Clone)]
pub struct StreamingCodec {
    scheme: Arc<CodingScheme>,
    window_size: usize,
}

impl StreamingCodec {
    pub fn new(scheme: Arc<CodingScheme>, window_size: usize) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::CodingConfiguration(
                "window size must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            scheme,
            window_size,
        })
    }

    pub fn scheme(&self) -> &CodingScheme {
        &self.scheme
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Per-fragment size for `total_size` bytes coded in one pass:
    /// `ceil(total / k)` rounded up to the scheme alignment
    pub fn fragment_size(&self, total_size: u64) -> usize {
        let k = self.scheme.k() as u64;
        let alignment = self.scheme.alignment() as u64;
        let per_fragment = total_size.div_ceil(k);
        (per_fragment.div_ceil(alignment) * alignment) as usize
    }

    /// Length of each fragment channel after a windowed encode
    pub fn encoded_fragment_len(&self, total_size: u64) -> u64 {
        self.windows(total_size)
            .map(|len| self.fragment_size(len as u64) as u64)
            .sum()
    }

    /// Encode exactly `total_size` bytes from `input` in one pass
    pub fn encode<R: Read>(&self, input: &mut R, total_size: u64) -> Result<EncodedFragments> {
        let k = self.scheme.k();
        let fragment_size = self.fragment_size(total_size);

        let mut buffer = vec![0u8; fragment_size * k];
        input.read_exact(&mut buffer[..total_size as usize])?;

        let mut fragments: Vec<Vec<u8>> = if fragment_size == 0 {
            vec![Vec::new(); k]
        } else {
            buffer.chunks(fragment_size).map(|c| c.to_vec()).collect()
        };
        fragments.extend((0..self.scheme.m()).map(|_| vec![0u8; fragment_size]));

        self.scheme.encode(&mut fragments)?;

        let coding = fragments.split_off(k);
        Ok(EncodedFragments {
            data: fragments,
            coding,
            fragment_size,
        })
    }

    /// Encode window by window, appending each window's fragments to the
    /// matching sink (`k + m` sinks, data first).
    ///
    /// Returns the number of bytes written to each sink.
    pub fn encode_windowed<R: Read, W: Write>(
        &self,
        input: &mut R,
        total_size: u64,
        sinks: &mut [W],
    ) -> Result<u64> {
        if sinks.len() != self.scheme.total() {
            return Err(Error::Encode(format!(
                "Expected {} fragment sinks, got {}",
                self.scheme.total(),
                sinks.len()
            )));
        }

        let mut written = 0u64;
        for window in self.windows(total_size) {
            let encoded = self.encode(input, window as u64)?;
            written += encoded.fragment_size as u64;
            for (sink, fragment) in sinks.iter_mut().zip(encoded.into_fragments()) {
                sink.write_all(&fragment)?;
            }
        }

        Ok(written)
    }

    /// Decode one pass of fragments and write `original_size` bytes.
    ///
    /// `fragments` holds `k + m` entries, data first; at most `m` may be
    /// `None`.
    pub fn decode<W: Write>(
        &self,
        mut fragments: Vec<Option<Vec<u8>>>,
        original_size: u64,
        output: &mut W,
    ) -> Result<()> {
        let k = self.scheme.k();
        if fragments.len() != self.scheme.total() {
            return Err(Error::Decode(format!(
                "Expected {} fragments, got {}",
                self.scheme.total(),
                fragments.len()
            )));
        }

        // Only erased data fragments need reconstruction
        if fragments[..k].iter().any(|f| f.is_none()) {
            self.scheme.decode(&mut fragments)?;
        }

        let mut remaining = original_size as usize;
        for fragment in fragments.iter().take(k) {
            if remaining == 0 {
                break;
            }
            let fragment = fragment
                .as_ref()
                .ok_or_else(|| Error::Decode("Data fragment missing after decode".to_string()))?;
            let take = remaining.min(fragment.len());
            output.write_all(&fragment[..take])?;
            remaining -= take;
        }

        if remaining > 0 {
            return Err(Error::Decode(format!(
                "Fragments hold {} fewer bytes than the original size",
                remaining
            )));
        }
        Ok(())
    }

    /// Decode a windowed encoding, reading each window's fragments from the
    /// present sources. A `None` source is an erased fragment.
    pub fn decode_windowed<R: Read, W: Write>(
        &self,
        sources: &mut [Option<R>],
        original_size: u64,
        output: &mut W,
    ) -> Result<()> {
        if sources.len() != self.scheme.total() {
            return Err(Error::Decode(format!(
                "Expected {} fragment sources, got {}",
                self.scheme.total(),
                sources.len()
            )));
        }

        let available = sources.iter().filter(|s| s.is_some()).count();
        if available < self.scheme.k() {
            return Err(Error::ReconstructionFailure {
                available,
                required: self.scheme.k(),
            });
        }

        for window in self.windows(original_size) {
            let fragment_size = self.fragment_size(window as u64);
            let mut fragments = Vec::with_capacity(sources.len());
            for source in sources.iter_mut() {
                match source {
                    Some(reader) => {
                        let mut buf = vec![0u8; fragment_size];
                        reader.read_exact(&mut buf)?;
                        fragments.push(Some(buf));
                    }
                    None => fragments.push(None),
                }
            }
            self.decode(fragments, window as u64, output)?;
        }

        Ok(())
    }

    /// Window lengths covering `total_size`; a zero-length object is one
    /// empty window
    fn windows(&self, total_size: u64) -> impl Iterator<Item = usize> {
        let window_size = self.window_size as u64;
        let count = total_size.div_ceil(window_size).max(1);
        (0..count).map(move |i| {
            let start = i * window_size;
            (total_size - start).min(window_size) as usize
        })
    }
}
