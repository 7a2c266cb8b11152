//! Polygon and tile handles
//!
//! A handle packs `salt | tile index | poly index` into one `u64`. The salt is
//! a generation counter owned by the tile slot: removing a tile bumps it, which
//! makes every handle issued for the old contents detectably stale.

use std::fmt;

use crate::config::HandleBits;

/// Opaque reference to a polygon (or, with poly index 0, to a tile)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct PolyRef(u64);

impl PolyRef {
    /// The null reference; never issued for a live polygon
    pub const NULL: PolyRef = PolyRef(0);

    /// Rebuilds a reference from a raw value previously obtained with [`PolyRef::raw`]
    pub const fn from_raw(raw: u64) -> Self {
        PolyRef(raw)
    }

    /// Raw packed value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true for any non-null reference. This does not check liveness.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Returns true for the null reference
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for PolyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Packs and unpacks handles for one bit layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleCodec {
    salt_bits: u32,
    tile_bits: u32,
    poly_bits: u32,
}

impl Default for HandleCodec {
    fn default() -> Self {
        Self::new(HandleBits::default())
    }
}

#[inline]
fn mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

impl HandleCodec {
    /// Creates a codec for the given layout. The layout is expected to be
    /// validated already (see [`HandleBits::validate`]).
    pub fn new(bits: HandleBits) -> Self {
        debug_assert!(bits.validate().is_ok());
        Self {
            salt_bits: bits.salt,
            tile_bits: bits.tile,
            poly_bits: bits.poly,
        }
    }

    /// Bit widths of this codec
    pub fn bits(&self) -> HandleBits {
        HandleBits {
            salt: self.salt_bits,
            tile: self.tile_bits,
            poly: self.poly_bits,
        }
    }

    /// Mask applied to salt values
    pub fn salt_mask(&self) -> u32 {
        mask(self.salt_bits) as u32
    }

    /// Packs salt, tile index and poly index
    #[inline]
    pub fn encode(&self, salt: u32, tile: u32, poly: u32) -> PolyRef {
        let salt = u64::from(salt) & mask(self.salt_bits);
        let tile = u64::from(tile) & mask(self.tile_bits);
        let poly = u64::from(poly) & mask(self.poly_bits);
        PolyRef(
            (salt << (self.poly_bits + self.tile_bits)) | (tile << self.poly_bits) | poly,
        )
    }

    /// Unpacks a reference into (salt, tile index, poly index)
    #[inline]
    pub fn decode(&self, reference: PolyRef) -> (u32, u32, u32) {
        (
            self.decode_salt(reference),
            self.decode_tile(reference),
            self.decode_poly(reference),
        )
    }

    /// Extracts the salt
    #[inline]
    pub fn decode_salt(&self, reference: PolyRef) -> u32 {
        ((reference.0 >> (self.poly_bits + self.tile_bits)) & mask(self.salt_bits)) as u32
    }

    /// Extracts the tile index
    #[inline]
    pub fn decode_tile(&self, reference: PolyRef) -> u32 {
        ((reference.0 >> self.poly_bits) & mask(self.tile_bits)) as u32
    }

    /// Extracts the polygon index
    #[inline]
    pub fn decode_poly(&self, reference: PolyRef) -> u32 {
        (reference.0 & mask(self.poly_bits)) as u32
    }
}
