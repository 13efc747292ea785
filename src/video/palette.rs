//! VIC-II palette and packed-pixel decoding
//!
//! Each packed byte holds two 4-bit palette indices: the low nibble is the
//! left pixel, the high nibble the right one. Decoding goes through a
//! 256-entry table keyed by the whole byte so a scanline costs one lookup
//! per pixel pair.

use std::sync::OnceLock;

use crate::protocol::packet::{BYTES_PER_LINE, PIXELS_PER_LINE};

/// Bytes per decoded RGBA pixel
pub const RGBA_BYTES_PER_PIXEL: usize = 4;

/// Bytes per decoded RGBA scanline
pub const RGBA_BYTES_PER_LINE: usize = PIXELS_PER_LINE as usize * RGBA_BYTES_PER_PIXEL;

/// The 16 VIC-II colours
///
/// Words are packed as `0xAABBGGRR`, so their little-endian bytes are
/// R, G, B, A and can be copied straight into an RGBA buffer.
pub const VIC_PALETTE: [u32; 16] = [
    0xFF000000, // 0  black
    0xFFEFEFEF, // 1  white
    0xFF342F8D, // 2  red
    0xFFCDD46A, // 3  cyan
    0xFFA43598, // 4  purple
    0xFF42B44C, // 5  green
    0xFFB1292C, // 6  blue
    0xFF5DEFEF, // 7  yellow
    0xFF204E98, // 8  orange
    0xFF00385B, // 9  brown
    0xFF6D67D1, // 10 light red
    0xFF4A4A4A, // 11 dark grey
    0xFF7B7B7B, // 12 grey
    0xFF93EF9F, // 13 light green
    0xFFEF6A6D, // 14 light blue
    0xFFB2B2B2, // 15 light grey
];

/// Pixel-pair lookup table
pub struct PairLut {
    pairs: [[u8; 2 * RGBA_BYTES_PER_PIXEL]; 256],
    words: [(u32, u32); 256],
}

impl PairLut {
    /// Build a table for an arbitrary palette
    pub fn new(palette: &[u32; 16]) -> Self {
        let mut pairs = [[0u8; 2 * RGBA_BYTES_PER_PIXEL]; 256];
        let mut words = [(0u32, 0u32); 256];

        for (byte, (pair, word)) in pairs.iter_mut().zip(words.iter_mut()).enumerate() {
            let left = palette[byte & 0x0F];
            let right = palette[(byte >> 4) & 0x0F];
            pair[..4].copy_from_slice(&left.to_le_bytes());
            pair[4..].copy_from_slice(&right.to_le_bytes());
            *word = (left, right);
        }

        Self { pairs, words }
    }

    /// Palette words for the (left, right) pixels of a packed byte
    #[inline]
    pub fn decode_pair(&self, byte: u8) -> (u32, u32) {
        self.words[byte as usize]
    }

    /// Decode packed indices into RGBA bytes
    ///
    /// Decodes `min(src.len(), dst.len() / 8)` bytes.
    #[inline]
    pub fn decode_into(&self, src: &[u8], dst: &mut [u8]) {
        for (byte, out) in src.iter().zip(dst.chunks_exact_mut(2 * RGBA_BYTES_PER_PIXEL)) {
            out.copy_from_slice(&self.pairs[*byte as usize]);
        }
    }

    /// Decode one 192-byte scanline into 384 RGBA pixels
    #[inline]
    pub fn decode_line(&self, src: &[u8], dst: &mut [u8]) {
        debug_assert!(src.len() >= BYTES_PER_LINE);
        debug_assert!(dst.len() >= RGBA_BYTES_PER_LINE);
        self.decode_into(&src[..BYTES_PER_LINE], &mut dst[..RGBA_BYTES_PER_LINE]);
    }
}

static LUT: OnceLock<PairLut> = OnceLock::new();

/// Process-wide table for [`VIC_PALETTE`], built on first use
pub fn lut() -> &'static PairLut {
    LUT.get_or_init(|| PairLut::new(&VIC_PALETTE))
}

/// Decode a packed byte with the VIC palette
pub fn decode_pair(byte: u8) -> (u32, u32) {
    lut().decode_pair(byte)
}
