//! Encrypted media frame layout.
//!
//! On the wire an encrypted frame is laid out as:
//!
//! ```text
//! [ unencrypted prefix | ciphertext | tag (8) | LEB128 nonce |
//!   unencrypted ranges | supp_size (u8) | magic (0xFAFA) ]
//! ```
//!
//! The unencrypted prefix is chosen per codec so packetizer-visible headers
//! survive encryption; the range table records where those bytes sit in the
//! original frame. `supp_size` counts the nonce, the range table, its own
//! byte, and the magic marker, so a receiver can locate the trailer without
//! knowing the codec. The tag sits immediately before the nonce.
//!
//! [`OutboundFrameProcessor`] and [`InboundFrameProcessor`] are pooled by
//! the encryptor/decryptor and reused across frames; all their buffers are
//! retained between [`reset`](OutboundFrameProcessor::reset) calls.

use crate::{
    codecs::{self, Codec},
    errors::ProtocolError,
    leb128::{leb128_size, read_leb128, write_leb128},
};

/// Magic marker terminating every encrypted frame.
pub const MAGIC_MARKER: u16 = 0xFAFA;

/// Truncated AEAD tag size carried in the frame trailer.
pub const FRAME_TAG_BYTES: usize = 8;

/// Fixed bytes counted by `supp_size`: the `supp_size` byte itself plus the
/// two magic marker bytes. The nonce and range table sizes are added per
/// frame.
pub const SUPPLEMENTAL_OVERHEAD: usize = 1 + 2;

/// Headroom the encryptor adds when sizing output buffers.
pub const TRANSFORM_PADDING: usize = 64;

/// A run of unencrypted bytes within the original frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// Byte offset in the original frame.
    pub offset: usize,
    /// Length of the run.
    pub size: usize,
}

/// Serialized size of a range table, in bytes.
pub fn unencrypted_ranges_size(ranges: &[Range]) -> usize {
    ranges
        .iter()
        .map(|r| leb128_size(r.offset as u64) + leb128_size(r.size as u64))
        .sum()
}

/// Serialize a range table as LEB128 (offset, size) pairs.
///
/// Returns the number of bytes written.
pub fn serialize_unencrypted_ranges(
    ranges: &[Range],
    buf: &mut [u8],
) -> Result<usize, ProtocolError> {
    let mut at = 0;
    for range in ranges {
        at += write_leb128(range.offset as u64, &mut buf[at..])?;
        at += write_leb128(range.size as u64, &mut buf[at..])?;
    }
    Ok(at)
}

/// Parse a range table, consuming the entire buffer.
pub fn deserialize_unencrypted_ranges(buf: &[u8]) -> Result<Vec<Range>, ProtocolError> {
    let mut ranges = Vec::new();
    let mut at = 0;
    while at < buf.len() {
        let (offset, used) = read_leb128(&buf[at..])?;
        at += used;
        let (size, used) = read_leb128(&buf[at..])?;
        at += used;
        ranges.push(Range { offset: offset as usize, size: size as usize });
    }
    Ok(ranges)
}

/// Check that a range table is sorted, non-overlapping, and within bounds.
pub fn validate_unencrypted_ranges(ranges: &[Range], frame_size: usize) -> bool {
    let mut previous_end = 0usize;
    for range in ranges {
        if range.offset < previous_end {
            return false;
        }
        let Some(end) = range.offset.checked_add(range.size) else {
            return false;
        };
        if end > frame_size {
            return false;
        }
        previous_end = end;
    }
    true
}

/// Splits an outbound frame into unencrypted header bytes and plaintext,
/// then reassembles the encrypted frame in original byte order.
#[derive(Debug, Default)]
pub struct OutboundFrameProcessor {
    codec: Codec,
    frame_index: usize,
    unencrypted_bytes: Vec<u8>,
    plaintext_bytes: Vec<u8>,
    ciphertext_bytes: Vec<u8>,
    unencrypted_ranges: Vec<Range>,
}

impl OutboundFrameProcessor {
    /// Create an empty processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state, retaining buffer capacity.
    pub fn reset(&mut self) {
        self.codec = Codec::Unknown;
        self.frame_index = 0;
        self.unencrypted_bytes.clear();
        self.plaintext_bytes.clear();
        self.ciphertext_bytes.clear();
        self.unencrypted_ranges.clear();
    }

    /// Split `frame` according to the codec's unencrypted-header rules.
    ///
    /// After this call the plaintext buffer holds the bytes to encrypt, the
    /// unencrypted buffer holds the header bytes in order, and the
    /// ciphertext buffer is zeroed scratch of plaintext length.
    pub fn process_frame(&mut self, frame: &[u8], codec: Codec) {
        self.reset();
        self.codec = codec;
        codecs::split_frame(self, frame, codec);
        self.ciphertext_bytes.resize(self.plaintext_bytes.len(), 0);
    }

    /// Codec this frame was split for.
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Header bytes excluded from encryption, in original order.
    pub fn unencrypted_bytes(&self) -> &[u8] {
        &self.unencrypted_bytes
    }

    /// Bytes to be encrypted.
    pub fn plaintext_bytes(&self) -> &[u8] {
        &self.plaintext_bytes
    }

    /// Output scratch for the ciphertext, same length as the plaintext.
    pub fn ciphertext_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.ciphertext_bytes
    }

    /// The unencrypted-range table.
    pub fn unencrypted_ranges(&self) -> &[Range] {
        &self.unencrypted_ranges
    }

    /// Total reconstructed frame size (header bytes + ciphertext).
    pub fn reconstructed_size(&self) -> usize {
        self.unencrypted_bytes.len() + self.ciphertext_bytes.len()
    }

    /// Append bytes that stay unencrypted, extending the range table.
    pub fn add_unencrypted_bytes(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        match self.unencrypted_ranges.last_mut() {
            // Contiguous with the previous unencrypted run.
            Some(last) if last.offset + last.size == self.frame_index => {
                last.size += bytes.len();
            },
            _ => {
                self.unencrypted_ranges.push(Range { offset: self.frame_index, size: bytes.len() });
            },
        }
        self.unencrypted_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    /// Append bytes that will be encrypted.
    pub fn add_encrypted_bytes(&mut self, bytes: &[u8]) {
        self.plaintext_bytes.extend_from_slice(bytes);
        self.frame_index += bytes.len();
    }

    /// Interleave the unencrypted bytes and the ciphertext back into the
    /// original frame order. Returns the number of bytes written.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        let total = self.reconstructed_size();
        debug_assert!(out.len() >= total, "reconstruct buffer too small");

        let mut unencrypted_at = 0;
        let mut ciphertext_at = 0;
        let mut write_at = 0;

        for range in &self.unencrypted_ranges {
            let gap = range.offset - write_at;
            out[write_at..write_at + gap]
                .copy_from_slice(&self.ciphertext_bytes[ciphertext_at..ciphertext_at + gap]);
            ciphertext_at += gap;
            write_at += gap;

            out[write_at..write_at + range.size]
                .copy_from_slice(&self.unencrypted_bytes[unencrypted_at..unencrypted_at + range.size]);
            unencrypted_at += range.size;
            write_at += range.size;
        }

        let tail = self.ciphertext_bytes.len() - ciphertext_at;
        out[write_at..write_at + tail].copy_from_slice(&self.ciphertext_bytes[ciphertext_at..]);
        write_at += tail;

        write_at
    }
}

/// Parses an inbound wire frame into its components.
///
/// A frame whose tail does not carry the magic marker is flagged as
/// non-encrypted; the decryptor decides whether passthrough applies.
#[derive(Debug, Default)]
pub struct InboundFrameProcessor {
    is_encrypted: bool,
    original_size: usize,
    tag: [u8; FRAME_TAG_BYTES],
    truncated_nonce: u32,
    unencrypted_ranges: Vec<Range>,
    authenticated: Vec<u8>,
    ciphertext: Vec<u8>,
    plaintext: Vec<u8>,
}

impl InboundFrameProcessor {
    /// Create an empty processor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all state, retaining buffer capacity.
    pub fn clear(&mut self) {
        self.is_encrypted = false;
        self.original_size = 0;
        self.tag = [0; FRAME_TAG_BYTES];
        self.truncated_nonce = 0;
        self.unencrypted_ranges.clear();
        self.authenticated.clear();
        self.ciphertext.clear();
        self.plaintext.clear();
    }

    /// Parse a wire frame.
    ///
    /// A missing magic marker leaves the processor in the non-encrypted
    /// state and is not an error. A present marker with an inconsistent
    /// trailer is.
    pub fn parse_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        self.clear();
        self.original_size = frame.len();

        let len = frame.len();
        if len < SUPPLEMENTAL_OVERHEAD + FRAME_TAG_BYTES {
            return Ok(());
        }
        let marker = u16::from_be_bytes([frame[len - 2], frame[len - 1]]);
        if marker != MAGIC_MARKER {
            return Ok(());
        }

        let supplemental = frame[len - SUPPLEMENTAL_OVERHEAD] as usize;
        if supplemental < SUPPLEMENTAL_OVERHEAD
            || supplemental + FRAME_TAG_BYTES > len
        {
            return Err(ProtocolError::InvalidSupplementalSize { supplemental, frame: len });
        }

        // supp_size counts [nonce | ranges | supp_size byte | magic]; the
        // tag sits immediately before that region.
        let trailer_start = len - supplemental;
        let varint_region = &frame[trailer_start..len - SUPPLEMENTAL_OVERHEAD];

        let (nonce, nonce_size) = read_leb128(varint_region)?;
        let truncated_nonce = u32::try_from(nonce).map_err(|_| ProtocolError::MalformedVarint)?;

        let ranges = deserialize_unencrypted_ranges(&varint_region[nonce_size..])?;

        let body_end = trailer_start - FRAME_TAG_BYTES;
        let body = &frame[..body_end];
        if !validate_unencrypted_ranges(&ranges, body.len()) {
            return Err(ProtocolError::InvalidRanges { reason: "ranges exceed frame body" });
        }

        self.tag.copy_from_slice(&frame[body_end..trailer_start]);
        self.truncated_nonce = truncated_nonce;

        // Separate the interleaved body into contiguous authenticated-data
        // and ciphertext buffers.
        let mut at = 0;
        for range in &ranges {
            self.ciphertext.extend_from_slice(&body[at..range.offset]);
            self.authenticated.extend_from_slice(&body[range.offset..range.offset + range.size]);
            at = range.offset + range.size;
        }
        self.ciphertext.extend_from_slice(&body[at..]);

        self.plaintext.resize(self.ciphertext.len(), 0);
        self.unencrypted_ranges = ranges;
        self.is_encrypted = true;
        Ok(())
    }

    /// Whether the frame carried the encrypted-frame trailer.
    pub fn is_encrypted(&self) -> bool {
        self.is_encrypted
    }

    /// Size of the wire frame this processor last parsed.
    pub fn size(&self) -> usize {
        self.original_size
    }

    /// The truncated 8-byte AEAD tag.
    pub fn tag(&self) -> &[u8; FRAME_TAG_BYTES] {
        &self.tag
    }

    /// The truncated nonce recovered from the trailer.
    pub fn truncated_nonce(&self) -> u32 {
        self.truncated_nonce
    }

    /// Unencrypted bytes in original order; the AEAD additional data.
    pub fn authenticated_data(&self) -> &[u8] {
        &self.authenticated
    }

    /// Contiguous ciphertext bytes.
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Plaintext scratch buffer, same length as the ciphertext.
    pub fn plaintext_mut(&mut self) -> &mut [u8] {
        &mut self.plaintext
    }

    /// Interleave the authenticated bytes and the decrypted plaintext back
    /// into original frame order. Returns the number of bytes written.
    pub fn reconstruct_frame(&self, out: &mut [u8]) -> usize {
        let total = self.authenticated.len() + self.plaintext.len();
        debug_assert!(out.len() >= total, "reconstruct buffer too small");

        let mut authenticated_at = 0;
        let mut plaintext_at = 0;
        let mut write_at = 0;

        for range in &self.unencrypted_ranges {
            let gap = range.offset - write_at;
            out[write_at..write_at + gap]
                .copy_from_slice(&self.plaintext[plaintext_at..plaintext_at + gap]);
            plaintext_at += gap;
            write_at += gap;

            out[write_at..write_at + range.size].copy_from_slice(
                &self.authenticated[authenticated_at..authenticated_at + range.size],
            );
            authenticated_at += range.size;
            write_at += range.size;
        }

        let tail = self.plaintext.len() - plaintext_at;
        out[write_at..write_at + tail].copy_from_slice(&self.plaintext[plaintext_at..]);
        write_at += tail;

        write_at
    }
}
