//! 1541 (D64) disk image access.
//!
//! A disk image is a contiguous byte vector of a recognized size,
//! addressed as 256-byte blocks through a [`Geometry`].  The Block
//! Availability Map lives on (18,0) and the directory chain starts at
//! (18,1).  Two image variants are recognized: the plain 35-track image
//! (174848 bytes) and the same with a per-sector error table appended
//! (175531 bytes); the error table is ignored.
//!
//! Files are singly linked chains of blocks: the first two bytes of
//! every block address the next one, and a zero link track marks the
//! tail, whose link sector holds the index of the last used byte.
//! Block allocation follows the CBM DOS "next available track and
//! sector" scheme: files grow away from the directory track with a
//! sector interleave, and the directory track itself never holds file
//! data on this format.

pub mod bam;
pub mod directory;
pub mod geometry;

mod image;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::disk::directory::{DirEntry, EntrySlot, FileType, ENTRIES_PER_BLOCK, ENTRY_SIZE};
use crate::error::{IecError, Result};
use crate::petscii::{Petscii, PADDING_BYTE};

pub use crate::disk::geometry::{Geometry, Location, BLOCK_SIZE, DATA_SIZE};
pub use crate::disk::image::Image;

// Header block (18,0) field offsets.
const HEADER_FIRST_DIRECTORY_OFFSET: usize = 0x00;
const HEADER_FORMAT_TYPE_OFFSET: usize = 0x02;
const HEADER_NAME_OFFSET: usize = 0x90;
const HEADER_ID_OFFSET: usize = 0xA2;
const HEADER_DOS_VERSION_OFFSET: usize = 0xA5;
const HEADER_DIRECTORY_FORMAT_OFFSET: usize = 0xA6;
const HEADER_PADDING_OFFSETS: [usize; 7] = [0xA0, 0xA1, 0xA4, 0xA7, 0xA8, 0xA9, 0xAA];

/// Disk name length in the header.
pub const DISK_NAME_SIZE: usize = 16;

/// The header region shown on a directory listing's first line: the
/// disk name, its id, and the DOS type, exactly as stored.
pub const NAME_ID_SIZE: usize = 27;

/// A mounted disk image.
pub struct DiskImage {
    image: Image,
    geometry: &'static Geometry,
    path: Option<PathBuf>,
    dirty: bool,
}

impl DiskImage {
    /// Mount an image file read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<DiskImage> {
        let path = path.as_ref();
        let image = Image::open_read_write(path)?;
        let mut disk = Self::from_image(image)?;
        disk.path = Some(path.to_path_buf());
        debug!("mounted {:?}", path);
        Ok(disk)
    }

    /// Mount an image file read-only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<DiskImage> {
        let path = path.as_ref();
        let image = Image::open_read_only(path)?;
        let mut disk = Self::from_image(image)?;
        disk.path = Some(path.to_path_buf());
        Ok(disk)
    }

    /// Mount a fresh, unformatted in-memory image.
    pub fn open_memory() -> DiskImage {
        DiskImage {
            image: Image::open_memory(Geometry::native().size()),
            geometry: Geometry::native(),
            path: None,
            dirty: false,
        }
    }

    /// Mount any backing storage whose size matches a known geometry.
    pub fn from_image(image: Image) -> Result<DiskImage> {
        let geometry = Geometry::find_by_size(image.len())?;
        Ok(DiskImage {
            image,
            geometry,
            path: None,
            dirty: false,
        })
    }

    pub fn geometry(&self) -> &'static Geometry {
        self.geometry
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref().map(|p| p.as_path())
    }

    /// Write any pending changes back to the underlying file.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.image.flush()?;
            self.dirty = false;
        }
        Ok(())
    }

    // ----- block access -----

    pub fn block(&self, location: Location) -> Result<&[u8]> {
        let offset = self.geometry.block_offset(location)?;
        self.image.slice(offset, BLOCK_SIZE)
    }

    pub fn block_mut(&mut self, location: Location) -> Result<&mut [u8]> {
        let offset = self.geometry.block_offset(location)?;
        self.dirty = true;
        self.image.slice_mut(offset, BLOCK_SIZE)
    }

    fn bam_location(&self) -> Location {
        Location(self.geometry.directory_track, 0)
    }

    // ----- allocation -----

    /// Free blocks as counted by the BAM, excluding the directory
    /// track.  This matches the "blocks free" line of a listing.
    pub fn blocks_free(&self) -> Result<usize> {
        let geometry = self.geometry;
        let block = self.block(self.bam_location())?;
        let mut free = 0usize;
        for track in geometry.first_track..=geometry.last_track {
            if !geometry.data_to_dir_track && track == geometry.directory_track {
                continue;
            }
            free += bam::free_count(block, track) as usize;
        }
        Ok(free)
    }

    pub fn block_is_allocated(&self, location: Location) -> bool {
        if !self.geometry.valid_location(location) {
            return true;
        }
        match self.block(self.bam_location()) {
            Ok(block) => !bam::is_free(block, location),
            Err(_) => true,
        }
    }

    pub fn set_block_allocation(&mut self, location: Location, allocated: bool) -> Result<()> {
        if !self.geometry.valid_location(location) {
            warn!("allocation request outside geometry: {}", location);
            return Ok(());
        }
        let bam_location = self.bam_location();
        let block = self.block_mut(bam_location)?;
        bam::set_allocation(block, location, allocated);
        Ok(())
    }

    fn track_is_full(&self, track: u8) -> bool {
        if track < self.geometry.first_track || track > self.geometry.last_track {
            return true;
        }
        match self.block(self.bam_location()) {
            Ok(block) => !bam::has_availability(block, track),
            Err(_) => true,
        }
    }

    /// First free block for a new file: tracks are probed at growing
    /// distance from the directory track, alternating below and above,
    /// then scanned from sector zero.
    pub fn find_first_free_block(&self) -> Result<Location> {
        let geometry = self.geometry;
        let directory = geometry.directory_track;
        let max_distance = ::std::cmp::max(
            directory - geometry.first_track,
            geometry.last_track + 1 - directory,
        );

        let mut found = None;
        'search: for distance in 1..=max_distance {
            if distance <= directory {
                let track = directory - distance;
                if track >= geometry.first_track && !self.track_is_full(track) {
                    found = Some(track);
                    break 'search;
                }
            }
            let track = directory + distance;
            if track <= geometry.last_track && !self.track_is_full(track) {
                found = Some(track);
                break 'search;
            }
        }
        if found.is_none() && geometry.data_to_dir_track && !self.track_is_full(directory) {
            found = Some(directory);
        }

        let track = found.ok_or(IecError::NoSpaceLeftOnDevice)?;
        let block = self.block(self.bam_location())?;
        for sector in 0..geometry.sectors_in_track(track) {
            if bam::is_free(block, Location(track, sector)) {
                return Ok(Location(track, sector));
            }
        }
        // The free count promised availability the bitmap lacks.
        Err(IecError::DiskImageError)
    }

    /// Next free block after `previous`, applying the interleave.  The
    /// scan covers the starting disk half outward, the other half, and
    /// the starting half once more; the directory track is used only
    /// when the geometry allows file data there.
    pub fn find_next_free_block(&self, previous: Location, interleave: u8) -> Result<Location> {
        let geometry = self.geometry;
        let directory = geometry.directory_track;
        let Location(mut track, start_sector) = previous;
        if track < geometry.first_track || track > geometry.last_track {
            return Err(IecError::IllegalTrackSector);
        }

        let mut sector = i16::from(start_sector);
        let mut tries = 3;
        loop {
            if !self.track_is_full(track) {
                sector += i16::from(interleave);
                let sectors_per_track = i16::from(geometry.sectors_in_track(track));
                while sector >= sectors_per_track {
                    sector -= sectors_per_track;
                    if sector > 0 {
                        sector -= 1;
                    }
                }

                let block = self.block(self.bam_location())?;
                let first_candidate = sector;
                loop {
                    if bam::is_free(block, Location(track, sector as u8)) {
                        return Ok(Location(track, sector as u8));
                    }
                    sector += 1;
                    if sector >= sectors_per_track {
                        sector = 0;
                    }
                    if sector == first_candidate {
                        return Err(IecError::DiskImageError);
                    }
                }
            }

            // Track full: advance away from the directory track, then
            // make passes over the other half and the original half.
            if track == directory {
                tries = 0;
            } else if track < directory {
                track -= 1;
                if track < geometry.first_track {
                    track = directory + 1;
                    sector = 0;
                    tries -= 1;
                    if track > geometry.last_track {
                        tries = 0;
                    }
                }
            } else {
                track += 1;
                if track > geometry.last_track {
                    track = directory - 1;
                    sector = 0;
                    tries -= 1;
                    if track < geometry.first_track {
                        tries = 0;
                    }
                }
            }

            if tries == 0 {
                if geometry.data_to_dir_track && track != directory {
                    track = directory;
                    tries = 1;
                    continue;
                }
                return Err(IecError::NoSpaceLeftOnDevice);
            }
        }
    }

    // ----- directory -----

    /// The directory chain's block locations, with loop detection.
    fn directory_blocks(&self) -> Result<Vec<Location>> {
        let mut locations = vec![];
        let mut visited = HashSet::new();
        let mut location = self.geometry.first_directory_location();
        loop {
            if !visited.insert(location) {
                return Err(IecError::DiskImageError);
            }
            let block = self.block(location)?;
            let link = Location(block[0], block[1]);
            locations.push(location);
            if link.0 == 0 {
                return Ok(locations);
            }
            location = link;
        }
    }

    /// All occupied directory entries, in chain order.
    pub fn directory(&self) -> Result<Vec<DirEntry>> {
        let mut entries = vec![];
        for location in self.directory_blocks()? {
            let block = self.block(location)?;
            for index in 0..ENTRIES_PER_BLOCK {
                let bytes = &block[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE];
                if bytes[2] == 0 {
                    continue;
                }
                entries.push(DirEntry::from_bytes(bytes, EntrySlot { location, index }));
            }
        }
        Ok(entries)
    }

    /// Locate the first directory entry matching a (possibly wildcard)
    /// name.
    pub fn find_entry(&self, pattern: &Petscii) -> Result<DirEntry> {
        for entry in self.directory()? {
            if directory::match_name(pattern.as_bytes(), &entry.raw_name) {
                return Ok(entry);
            }
        }
        Err(IecError::FileNotFound)
    }

    /// The next vacant entry slot, extending the directory chain with a
    /// fresh zero-filled block when every slot is taken.
    fn next_free_entry_slot(&mut self) -> Result<EntrySlot> {
        let blocks = self.directory_blocks()?;
        for &location in &blocks {
            let block = self.block(location)?;
            for index in 0..ENTRIES_PER_BLOCK {
                if block[index * ENTRY_SIZE + 2] == 0 {
                    return Ok(EntrySlot { location, index });
                }
            }
        }

        let last = match blocks.last() {
            Some(&location) => location,
            None => return Err(IecError::DiskImageError),
        };
        let fresh = self
            .find_next_free_block(last, self.geometry.directory_interleave)
            .map_err(|_| IecError::NoSpaceLeftOnDevice)?;
        self.set_block_allocation(fresh, true)?;
        {
            let block = self.block_mut(fresh)?;
            for byte in block.iter_mut() {
                *byte = 0;
            }
            block[1] = 0xFF;
        }
        {
            let block = self.block_mut(last)?;
            fresh.write_bytes(block);
        }
        Ok(EntrySlot {
            location: fresh,
            index: 0,
        })
    }

    fn store_entry(&mut self, entry: &DirEntry) -> Result<()> {
        let offset = entry.slot.offset();
        let block = self.block_mut(entry.slot.location)?;
        entry.to_bytes(&mut block[offset..offset + ENTRY_SIZE]);
        Ok(())
    }

    // ----- files -----

    /// The locations of a file chain, with loop detection.
    fn chain_locations(&self, start: Location) -> Result<Vec<Location>> {
        let mut locations = vec![];
        let mut visited = HashSet::new();
        let mut location = start;
        loop {
            if !visited.insert(location) {
                return Err(IecError::DiskImageError);
            }
            let block = self.block(location)?;
            locations.push(location);
            if block[0] == 0 {
                return Ok(locations);
            }
            location = Location(block[0], block[1]);
        }
    }

    /// Read a whole file by (wildcard) name.
    pub fn read_file(&self, pattern: &Petscii) -> Result<Vec<u8>> {
        let entry = self.find_entry(pattern)?;
        let mut data = vec![];
        let mut visited = HashSet::new();
        let mut location = entry.first_sector;
        loop {
            if !visited.insert(location) {
                return Err(IecError::DiskImageError);
            }
            let block = self.block(location)?;
            if block[0] != 0 {
                data.extend_from_slice(&block[2..]);
                location = Location(block[0], block[1]);
            } else {
                // The tail link sector indexes the last used byte.
                let last = block[1] as usize;
                if last < 1 {
                    return Err(IecError::DiskImageError);
                }
                data.extend_from_slice(&block[2..=last]);
                return Ok(data);
            }
        }
    }

    /// Write a whole file.  The entry takes the first vacant slot (or a
    /// fresh directory block); data blocks chain with the geometry's
    /// interleave, growing away from the directory track.
    pub fn write_file(&mut self, name: &Petscii, data: &[u8]) -> Result<()> {
        if self.find_entry(name).is_ok() {
            return Err(IecError::FileExists);
        }

        // A real 1541 starts saving and aborts on a full disk; here the
        // block count is known up front.
        let blocks_needed = (data.len() + DATA_SIZE - 1) / DATA_SIZE;
        if blocks_needed > self.blocks_free()? {
            return Err(IecError::NoSpaceLeftOnDevice);
        }

        let geometry = self.geometry;
        let slot = self.next_free_entry_slot()?;
        let first = self.find_next_free_block(
            Location(geometry.directory_track - 1, 0),
            geometry.interleave,
        )?;
        self.set_block_allocation(first, true)?;

        // The entry stays open (a "splat file") until the data is down.
        let mut entry = DirEntry {
            slot,
            file_type: FileType::PRG,
            closed: false,
            locked: false,
            first_sector: first,
            raw_name: DirEntry::pack_name(name),
            file_size: 0,
        };
        self.store_entry(&entry)?;

        let mut location = first;
        let mut blocks_written = 0u16;
        let mut chunks = data.chunks(DATA_SIZE).peekable();
        loop {
            let chunk: &[u8] = chunks.next().unwrap_or(&[]);
            blocks_written += 1;
            if chunks.peek().is_some() {
                let next = self.find_next_free_block(location, geometry.interleave)?;
                self.set_block_allocation(next, true)?;
                let block = self.block_mut(location)?;
                next.write_bytes(block);
                block[2..2 + chunk.len()].copy_from_slice(chunk);
                location = next;
            } else {
                let block = self.block_mut(location)?;
                block[0] = 0;
                block[1] = (1 + chunk.len()) as u8;
                block[2..2 + chunk.len()].copy_from_slice(chunk);
                break;
            }
        }

        entry.closed = true;
        entry.file_size = blocks_written;
        self.store_entry(&entry)?;
        Ok(())
    }

    /// Scratch every file matching the pattern; returns how many.
    pub fn scratch(&mut self, pattern: &Petscii) -> Result<usize> {
        let mut scratched = 0;
        let victims: Vec<DirEntry> = self
            .directory()?
            .into_iter()
            .filter(|e| directory::match_name(pattern.as_bytes(), &e.raw_name))
            .collect();
        for entry in victims {
            // Visit the whole chain before freeing anything.
            let chain = self.chain_locations(entry.first_sector)?;
            for location in chain {
                self.set_block_allocation(location, false)?;
            }
            let offset = entry.slot.offset();
            let block = self.block_mut(entry.slot.location)?;
            block[offset + 2] = 0;
            scratched += 1;
        }
        Ok(scratched)
    }

    /// Format the image: zero all sectors, write a fresh header and
    /// BAM, and start an empty directory chain.
    pub fn format(&mut self, name: &Petscii, id: &[u8]) -> Result<()> {
        let geometry = self.geometry;

        for track in geometry.first_track..=geometry.last_track {
            for sector in 0..geometry.sectors_in_track(track) {
                let block = self.block_mut(Location(track, sector))?;
                for byte in block.iter_mut() {
                    *byte = 0;
                }
            }
        }

        {
            // The first directory sector: last in chain, used in full.
            let block = self.block_mut(geometry.first_directory_location())?;
            block[0] = 0x00;
            block[1] = 0xFF;
        }

        let first_directory = geometry.first_directory_location();
        let bam_location = self.bam_location();
        {
            let block = self.block_mut(bam_location)?;
            first_directory.write_bytes(&mut block[HEADER_FIRST_DIRECTORY_OFFSET..]);
            block[HEADER_FORMAT_TYPE_OFFSET] = b'A';

            let name_bytes = name.as_bytes();
            let len = name_bytes.len().min(DISK_NAME_SIZE);
            for (i, byte) in block[HEADER_NAME_OFFSET..HEADER_NAME_OFFSET + DISK_NAME_SIZE]
                .iter_mut()
                .enumerate()
            {
                *byte = if i < len { name_bytes[i] } else { PADDING_BYTE };
            }
            block[HEADER_ID_OFFSET] = id.first().cloned().unwrap_or(PADDING_BYTE);
            block[HEADER_ID_OFFSET + 1] = id.get(1).cloned().unwrap_or(PADDING_BYTE);
            block[HEADER_DOS_VERSION_OFFSET] = b'2';
            block[HEADER_DIRECTORY_FORMAT_OFFSET] = b'A';
            for &offset in HEADER_PADDING_OFFSETS.iter() {
                block[offset] = PADDING_BYTE;
            }

            for track in geometry.first_track..=geometry.last_track {
                bam::init_track(block, track, geometry.sectors_in_track(track));
            }
            bam::set_allocation(block, bam_location, true);
            bam::set_allocation(block, first_directory, true);
        }
        Ok(())
    }

    /// The raw header region rendered on a listing's first line.
    pub fn name_id(&self) -> Result<[u8; NAME_ID_SIZE]> {
        let block = self.block(self.bam_location())?;
        let mut name_id = [0u8; NAME_ID_SIZE];
        name_id.copy_from_slice(&block[HEADER_NAME_OFFSET..HEADER_NAME_OFFSET + NAME_ID_SIZE]);
        Ok(name_id)
    }

    /// The disk name from the header.
    pub fn name(&self) -> Result<Petscii> {
        let block = self.block(self.bam_location())?;
        Ok(Petscii::from_padded_bytes(
            &block[HEADER_NAME_OFFSET..HEADER_NAME_OFFSET + DISK_NAME_SIZE],
            PADDING_BYTE,
        ))
    }
}

impl Drop for DiskImage {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted() -> DiskImage {
        let mut disk = DiskImage::open_memory();
        disk.format(&"test".into(), b"t1").unwrap();
        disk
    }

    #[test]
    fn test_format_leaves_full_disk_free() {
        let disk = formatted();
        assert_eq!(disk.blocks_free().unwrap(), 664);
        assert!(disk.directory().unwrap().is_empty());
        assert!(disk.block_is_allocated(Location(18, 0)));
        assert!(disk.block_is_allocated(Location(18, 1)));
        assert!(!disk.block_is_allocated(Location(17, 0)));
        assert_eq!(disk.name().unwrap(), "test".into());
    }

    #[test]
    fn test_error_table_image_recognized() {
        let disk = DiskImage::from_image(Image::open_memory(175531)).unwrap();
        assert!(disk.geometry().with_error_table);
        assert_eq!(
            DiskImage::from_image(Image::open_memory(175000)).err(),
            Some(IecError::UnknownDiskImage)
        );
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut disk = formatted();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        disk.write_file(&"hello".into(), &data).unwrap();

        assert_eq!(disk.read_file(&"hello".into()).unwrap(), data);
        // 1000 bytes occupy four blocks.
        assert_eq!(disk.blocks_free().unwrap(), 664 - 4);

        let entry = disk.find_entry(&"hello".into()).unwrap();
        assert_eq!(entry.file_size, 4);
        assert_eq!(entry.file_type, FileType::PRG);
        assert!(entry.closed);
    }

    #[test]
    fn test_block_sized_file() {
        let mut disk = formatted();
        let data = vec![0x55u8; DATA_SIZE];
        disk.write_file(&"exact".into(), &data).unwrap();
        assert_eq!(disk.read_file(&"exact".into()).unwrap(), data);
        assert_eq!(disk.blocks_free().unwrap(), 663);
    }

    #[test]
    fn test_empty_file() {
        let mut disk = formatted();
        disk.write_file(&"empty".into(), &[]).unwrap();
        assert_eq!(disk.read_file(&"empty".into()).unwrap(), vec![]);
        assert_eq!(disk.blocks_free().unwrap(), 663);
        assert_eq!(disk.find_entry(&"empty".into()).unwrap().file_size, 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut disk = formatted();
        disk.write_file(&"twice".into(), b"one").unwrap();
        assert_eq!(
            disk.write_file(&"twice".into(), b"two").err(),
            Some(IecError::FileExists)
        );
    }

    #[test]
    fn test_wildcard_read_returns_first_match() {
        let mut disk = formatted();
        disk.write_file(&"abc".into(), b"first").unwrap();
        disk.write_file(&"abcd".into(), b"second").unwrap();
        disk.write_file(&"xyz".into(), b"third").unwrap();

        assert_eq!(disk.read_file(&"a*".into()).unwrap(), b"first");
        assert_eq!(disk.read_file(&"a?cd".into()).unwrap(), b"second");
        assert_eq!(
            disk.read_file(&"nothere".into()).err(),
            Some(IecError::FileNotFound)
        );
    }

    #[test]
    fn test_scratch_reuses_slot_and_frees_blocks() {
        let mut disk = formatted();
        disk.write_file(&"first".into(), &[1u8; 600]).unwrap();
        disk.write_file(&"second".into(), b"keep").unwrap();
        let free_before = disk.blocks_free().unwrap();

        assert_eq!(disk.scratch(&"first".into()).unwrap(), 1);
        assert_eq!(disk.blocks_free().unwrap(), free_before + 3);
        assert!(disk.find_entry(&"first".into()).is_err());

        // The vacated slot is the next one handed out.
        disk.write_file(&"third".into(), b"new").unwrap();
        let entries = disk.directory().unwrap();
        assert_eq!(entries[0].filename(), "third".into());
        assert_eq!(entries[1].filename(), "second".into());
    }

    #[test]
    fn test_directory_chain_extension() {
        let mut disk = formatted();
        // Eight entries fill the first directory block.
        for i in 0..9 {
            let name: Petscii = format!("file{}", i).into();
            disk.write_file(&name, b"x").unwrap();
        }
        let entries = disk.directory().unwrap();
        assert_eq!(entries.len(), 9);
        assert_eq!(entries[7].slot.location, Location(18, 1));
        // The ninth entry lives on a fresh directory block, reached
        // with the directory interleave.
        assert_eq!(entries[8].slot.location, Location(18, 4));
        assert_eq!(entries[8].slot.index, 0);
        assert!(disk.block_is_allocated(Location(18, 4)));
        // Directory blocks never count against "blocks free".
        assert_eq!(disk.blocks_free().unwrap(), 664 - 9);
    }

    #[test]
    fn test_interleave_allocation_order() {
        let disk = formatted();
        // First file block: track 17, interleave 10 from sector 0.
        let first = disk
            .find_next_free_block(Location(17, 0), disk.geometry().interleave)
            .unwrap();
        assert_eq!(first, Location(17, 10));
    }

    #[test]
    fn test_disk_full() {
        let mut disk = formatted();
        let too_big = vec![0u8; 665 * DATA_SIZE];
        assert_eq!(
            disk.write_file(&"huge".into(), &too_big).err(),
            Some(IecError::NoSpaceLeftOnDevice)
        );
        // An exact fit is accepted.
        let exact = vec![0u8; 664 * DATA_SIZE];
        disk.write_file(&"full".into(), &exact).unwrap();
        assert_eq!(disk.blocks_free().unwrap(), 0);
        assert_eq!(disk.read_file(&"full".into()).unwrap(), exact);
    }

    #[test]
    fn test_name_id_region() {
        let disk = formatted();
        let name_id = disk.name_id().unwrap();
        assert_eq!(&name_id[..4], b"test");
        assert_eq!(name_id[4], PADDING_BYTE);
        assert_eq!(&name_id[18..20], b"t1");
        assert_eq!(name_id[21], b'2');
        assert_eq!(name_id[22], b'A');
    }
}
