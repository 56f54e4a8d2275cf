//! Track and sector layout of 1541 disk images.

use std::fmt;

use crate::error::{IecError, Result};

/// Every block on a CBM disk is 256 bytes.
pub const BLOCK_SIZE: usize = 256;

/// Payload bytes per block: the first two bytes hold the chain link.
pub const DATA_SIZE: usize = BLOCK_SIZE - 2;

/// A track and sector address.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, PartialOrd, Ord)]
pub struct Location(pub u8, pub u8);

impl Location {
    #[inline]
    pub fn new(track: u8, sector: u8) -> Location {
        Location(track, sector)
    }

    pub fn from_bytes(bytes: &[u8]) -> Location {
        Location(bytes[0], bytes[1])
    }

    pub fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = self.0;
        bytes[1] = self.1;
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.0, self.1)
    }
}

pub struct Track {
    pub sectors: u8,
    /// Cumulative block count of all preceding tracks.
    pub block_offset: u16,
}

// 35-track zone layout of the 1541: 21 sectors on tracks 1-17, 19 on
// 18-24, 18 on 25-30, 17 on 31-35.
#[rustfmt::skip]
static TRACKS: [Track; 36] = [
    Track { sectors: 0,  block_offset: 0,     }, // there is no track 0
    Track { sectors: 21, block_offset: 0x000, }, // 1
    Track { sectors: 21, block_offset: 0x015, }, // 2
    Track { sectors: 21, block_offset: 0x02A, }, // 3
    Track { sectors: 21, block_offset: 0x03F, }, // 4
    Track { sectors: 21, block_offset: 0x054, }, // 5
    Track { sectors: 21, block_offset: 0x069, }, // 6
    Track { sectors: 21, block_offset: 0x07E, }, // 7
    Track { sectors: 21, block_offset: 0x093, }, // 8
    Track { sectors: 21, block_offset: 0x0A8, }, // 9
    Track { sectors: 21, block_offset: 0x0BD, }, // 10
    Track { sectors: 21, block_offset: 0x0D2, }, // 11
    Track { sectors: 21, block_offset: 0x0E7, }, // 12
    Track { sectors: 21, block_offset: 0x0FC, }, // 13
    Track { sectors: 21, block_offset: 0x111, }, // 14
    Track { sectors: 21, block_offset: 0x126, }, // 15
    Track { sectors: 21, block_offset: 0x13B, }, // 16
    Track { sectors: 21, block_offset: 0x150, }, // 17
    Track { sectors: 19, block_offset: 0x165, }, // 18
    Track { sectors: 19, block_offset: 0x178, }, // 19
    Track { sectors: 19, block_offset: 0x18B, }, // 20
    Track { sectors: 19, block_offset: 0x19E, }, // 21
    Track { sectors: 19, block_offset: 0x1B1, }, // 22
    Track { sectors: 19, block_offset: 0x1C4, }, // 23
    Track { sectors: 19, block_offset: 0x1D7, }, // 24
    Track { sectors: 18, block_offset: 0x1EA, }, // 25
    Track { sectors: 18, block_offset: 0x1FC, }, // 26
    Track { sectors: 18, block_offset: 0x20E, }, // 27
    Track { sectors: 18, block_offset: 0x220, }, // 28
    Track { sectors: 18, block_offset: 0x232, }, // 29
    Track { sectors: 18, block_offset: 0x244, }, // 30
    Track { sectors: 17, block_offset: 0x256, }, // 31
    Track { sectors: 17, block_offset: 0x267, }, // 32
    Track { sectors: 17, block_offset: 0x278, }, // 33
    Track { sectors: 17, block_offset: 0x289, }, // 34
    Track { sectors: 17, block_offset: 0x29A, }, // 35
];

/// Layout parameters of a recognized disk image variant.
pub struct Geometry {
    pub first_track: u8,
    pub last_track: u8,
    pub directory_track: u8,
    pub first_directory_sector: u8,
    /// Interleave applied when chaining data blocks.
    pub interleave: u8,
    /// Interleave applied when chaining directory blocks.
    pub directory_interleave: u8,
    /// Whether file data may spill onto the directory track when all
    /// other tracks are full.
    pub data_to_dir_track: bool,
    /// A per-sector error table is appended to the image.  Recognized
    /// but otherwise ignored.
    pub with_error_table: bool,
    size: usize,
}

/// 35 tracks, no error information: 174848 bytes.
static GEOMETRY_35: Geometry = Geometry {
    first_track: 1,
    last_track: 35,
    directory_track: 18,
    first_directory_sector: 1,
    interleave: 10,
    directory_interleave: 3,
    data_to_dir_track: false,
    with_error_table: false,
    size: 174848,
};

/// 35 tracks with 683 error bytes: 175531 bytes.
static GEOMETRY_35_ERRORS: Geometry = Geometry {
    first_track: 1,
    last_track: 35,
    directory_track: 18,
    first_directory_sector: 1,
    interleave: 10,
    directory_interleave: 3,
    data_to_dir_track: false,
    with_error_table: true,
    size: 175531,
};

static GEOMETRIES: [&Geometry; 2] = [&GEOMETRY_35, &GEOMETRY_35_ERRORS];

impl Geometry {
    /// Look a geometry up by exact image size.
    pub fn find_by_size(size: usize) -> Result<&'static Geometry> {
        GEOMETRIES
            .iter()
            .find(|g| g.size == size)
            .cloned()
            .ok_or(IecError::UnknownDiskImage)
    }

    /// The geometry used for freshly created images.
    pub fn native() -> &'static Geometry {
        &GEOMETRY_35
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn sectors_in_track(&self, track: u8) -> u8 {
        TRACKS[track as usize].sectors
    }

    pub fn valid_location(&self, location: Location) -> bool {
        let Location(track, sector) = location;
        track >= self.first_track
            && track <= self.last_track
            && sector < self.sectors_in_track(track)
    }

    /// Byte offset of a block within the image.
    pub fn block_offset(&self, location: Location) -> Result<usize> {
        if !self.valid_location(location) {
            return Err(IecError::IllegalTrackSector);
        }
        let track = &TRACKS[location.0 as usize];
        Ok(BLOCK_SIZE * (track.block_offset as usize + location.1 as usize))
    }

    pub fn first_directory_location(&self) -> Location {
        Location(self.directory_track, self.first_directory_sector)
    }

    /// Data blocks on a freshly formatted disk ("blocks free" on a
    /// blank 1541 disk: 664).
    pub fn total_data_blocks(&self) -> usize {
        (self.first_track..=self.last_track)
            .filter(|&t| t != self.directory_track)
            .map(|t| self.sectors_in_track(t) as usize)
            .sum()
    }
}
