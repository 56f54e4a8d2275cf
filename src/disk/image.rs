use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap::{Mmap, MmapMut, MmapOptions};

use crate::error::{IecError, Result};

/// Backing storage for a disk image: a memory-mapped file or an
/// in-memory array.
pub enum Image {
    ReadOnlyMap(Mmap),
    ReadWriteMap(MmapMut),
    Memory(Box<[u8]>),
}

impl Image {
    pub fn open_memory(length: usize) -> Image {
        Image::Memory(vec![0; length].into_boxed_slice())
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Image> {
        let file = File::open(path).map_err(|_| IecError::FileNotFound)?;
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|_| IecError::FileReadError)?
        };
        Ok(Image::ReadOnlyMap(mmap))
    }

    pub fn open_read_write<P: AsRef<Path>>(path: P) -> Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|_| IecError::FileNotFound)?;
        let mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|_| IecError::FileReadError)?
        };
        Ok(Image::ReadWriteMap(mmap))
    }

    /// Create a zero-filled image file of the given length.
    pub fn create<P: AsRef<Path>>(path: P, length: usize) -> Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|_| IecError::FileExists)?;
        file.set_len(length as u64)
            .map_err(|_| IecError::FileWriteError)?;
        let mmap = unsafe {
            MmapOptions::new()
                .map_mut(&file)
                .map_err(|_| IecError::FileWriteError)?
        };
        Ok(Image::ReadWriteMap(mmap))
    }

    pub fn len(&self) -> usize {
        match self {
            Image::ReadOnlyMap(mmap) => mmap.len(),
            Image::ReadWriteMap(mmap) => mmap.len(),
            Image::Memory(array) => array.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_bounds(&self, end: usize) -> Result<()> {
        if end > self.len() {
            Err(IecError::IllegalTrackSector)
        } else {
            Ok(())
        }
    }

    pub fn slice(&self, offset: usize, length: usize) -> Result<&[u8]> {
        self.check_bounds(offset + length)?;
        Ok(match self {
            Image::ReadOnlyMap(mmap) => &mmap[offset..offset + length],
            Image::ReadWriteMap(mmap) => &mmap[offset..offset + length],
            Image::Memory(array) => &array[offset..offset + length],
        })
    }

    pub fn slice_mut(&mut self, offset: usize, length: usize) -> Result<&mut [u8]> {
        self.check_bounds(offset + length)?;
        match self {
            Image::ReadOnlyMap(_) => Err(IecError::FileWriteError),
            Image::ReadWriteMap(mmap) => Ok(&mut mmap[offset..offset + length]),
            Image::Memory(array) => Ok(&mut array[offset..offset + length]),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Err(IecError::FileWriteError),
            Image::ReadWriteMap(mmap) => mmap.flush().map_err(|_| IecError::FileWriteError),
            Image::Memory(_) => Ok(()),
        }
    }
}
