//! Stub loader image.
//!
//! The stub is a small program uploaded to the chip's RAM that replaces the
//! ROM loader with a faster one. The crate does not ship stub binaries; the
//! caller supplies the image, typically extracted from the vendor's flasher
//! stub files.

// =============================================================================
// Public Interface
// =============================================================================

/// A RAM segment of the stub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

/// The text and data segments of a stub loader plus its entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StubImage {
    pub entry: u32,
    pub text: Segment,
    pub data: Option<Segment>,
}

impl StubImage {
    pub fn new(entry: u32, text_start: u32, text: Vec<u8>) -> Self {
        StubImage {
            entry,
            text: Segment {
                address: text_start,
                data: text,
            },
            data: None,
        }
    }

    pub fn with_data(mut self, data_start: u32, data: Vec<u8>) -> Self {
        self.data = Some(Segment {
            address: data_start,
            data,
        });
        self
    }

    /// The non-empty segments, in upload order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        std::iter::once(&self.text)
            .chain(self.data.iter())
            .filter(|segment| !segment.data.is_empty())
    }

    /// Total number of bytes uploaded.
    pub fn len(&self) -> usize {
        self.segments().map(|segment| segment.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[test]
fn segments_in_upload_order() {
    let stub = StubImage::new(0x4038_0000, 0x4038_0000, vec![1, 2, 3]).with_data(0x3fc9_0000, vec![4]);
    let addresses: Vec<u32> = stub.segments().map(|s| s.address).collect();
    assert_eq!(addresses, vec![0x4038_0000, 0x3fc9_0000]);
    assert_eq!(stub.len(), 4);
}

#[test]
fn empty_segments_are_skipped() {
    let stub = StubImage::new(0x4038_0000, 0x4038_0000, vec![1]).with_data(0x3fc9_0000, vec![]);
    assert_eq!(stub.segments().count(), 1);
    assert!(!stub.is_empty());
}
