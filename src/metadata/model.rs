//! Placement records
//!
//! Every upload attempt produces one [`UploadRecord`] holding fresh
//! [`SliceMetadata`] for each of its `k + m` fragments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a fragment carries object data or parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentKind {
    Data,
    Coding,
}

/// Where one fragment of one upload attempt lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceMetadata {
    /// Globally unique; also the blob id on the backend
    pub id: String,
    pub object_id: String,
    pub kind: FragmentKind,
    /// Position within its kind: `[0, k)` or `[0, m)`
    pub index: usize,
    pub size: u64,
    /// Set once placement succeeds
    pub backend_id: Option<String>,
    /// BLAKE3 digest of the fragment, hex encoded
    pub checksum: String,
}

impl SliceMetadata {
    /// Fresh metadata for a fragment about to be placed
    pub fn new(
        object_id: impl Into<String>,
        kind: FragmentKind,
        index: usize,
        fragment: &[u8],
    ) -> Self {
        Self::with_checksum(
            object_id,
            kind,
            index,
            fragment.len() as u64,
            blake3::hash(fragment).to_hex().to_string(),
        )
    }

    /// Fresh metadata for a fragment hashed while it was written
    pub fn with_checksum(
        object_id: impl Into<String>,
        kind: FragmentKind,
        index: usize,
        size: u64,
        checksum: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object_id: object_id.into(),
            kind,
            index,
            size,
            backend_id: None,
            checksum,
        }
    }

    pub fn is_placed(&self) -> bool {
        self.backend_id.is_some()
    }

    /// Whether `data` matches the recorded checksum
    pub fn verify(&self, data: &[u8]) -> bool {
        blake3::hash(data).to_hex().as_str() == self.checksum
    }
}

/// One placement epoch of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    pub object_id: String,
    /// Original object size in bytes
    pub data_size: u64,
    /// Length of every fragment
    pub fragment_size: u64,
    pub data_slices: Vec<SliceMetadata>,
    pub coding_slices: Vec<SliceMetadata>,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl UploadRecord {
    pub fn new(
        object_id: impl Into<String>,
        data_size: u64,
        fragment_size: u64,
        data_slices: Vec<SliceMetadata>,
        coding_slices: Vec<SliceMetadata>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            object_id: object_id.into(),
            data_size,
            fragment_size,
            data_slices,
            coding_slices,
            success: false,
            timestamp: Utc::now(),
        }
    }

    /// All slices, data first
    pub fn slices(&self) -> impl Iterator<Item = &SliceMetadata> {
        self.data_slices.iter().chain(self.coding_slices.iter())
    }

    pub fn slices_mut(&mut self) -> impl Iterator<Item = &mut SliceMetadata> {
        self.data_slices
            .iter_mut()
            .chain(self.coding_slices.iter_mut())
    }

    /// Slices that have a backend
    pub fn placed_slices(&self) -> impl Iterator<Item = &SliceMetadata> {
        self.slices().filter(|s| s.is_placed())
    }

    pub fn placed_count(&self) -> usize {
        self.placed_slices().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_ids_are_unique() {
        let a = SliceMetadata::new("obj", FragmentKind::Data, 0, b"abc");
        let b = SliceMetadata::new("obj", FragmentKind::Data, 0, b"abc");
        assert_ne!(a.id, b.id);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(a.size, 3);
        assert!(!a.is_placed());
    }

    #[test]
    fn test_verify_checksum() {
        let slice = SliceMetadata::new("obj", FragmentKind::Coding, 1, b"parity");
        assert!(slice.verify(b"parity"));
        assert!(!slice.verify(b"parit"));
    }

    #[test]
    fn test_record_slices() {
        let mut data = vec![
            SliceMetadata::new("obj", FragmentKind::Data, 0, b"a"),
            SliceMetadata::new("obj", FragmentKind::Data, 1, b"b"),
        ];
        data[1].backend_id = Some("b1".to_string());
        let coding = vec![SliceMetadata::new("obj", FragmentKind::Coding, 0, b"c")];

        let mut record = UploadRecord::new("obj", 2, 1, data, coding);
        assert!(!record.success);
        assert_eq!(record.slices().count(), 3);
        assert_eq!(record.placed_count(), 1);

        for slice in record.slices_mut() {
            slice.backend_id = Some("b0".to_string());
        }
        assert_eq!(record.placed_count(), 3);
    }
}
