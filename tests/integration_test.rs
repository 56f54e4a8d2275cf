use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::thread;

use rand::{Rng, SeedableRng, XorShiftRng};

use iec::bus::channel::pipe_pair;
use iec::bus::transport::Transport;
use iec::disk::{DiskImage, DATA_SIZE};
use iec::drive::Drive;
use iec::{IecError, Petscii};

const RNG_SEED: [u8; 16] = [
    0x1E, 0xC0, 0x15, 0x41, 0xD6, 0x4B, 0xA3, 0x11, 0x7F, 0x22, 0x90, 0x0D, 0x5C, 0xE8, 0x31, 0x64,
];

const IMAGE_SIZE: usize = 174848;
const LISTING_PREFIX: [u8; 8] = [0x01, 0x04, 0x01, 0x01, 0x00, 0x00, 0x12, 0x22];

/// A per-test scratch path under the system temp directory.
fn scratch_path(name: &str) -> PathBuf {
    env::temp_dir().join(format!("iec-test-{}-{}", process::id(), name))
}

/// Create a blank, formatted D64 image file.
fn fresh_image(name: &str) -> PathBuf {
    let path = scratch_path(name);
    let _ = fs::remove_file(&path);
    fs::write(&path, vec![0u8; IMAGE_SIZE]).unwrap();
    let mut disk = DiskImage::open(&path).unwrap();
    disk.format(&"testdisk".into(), b"td").unwrap();
    disk.flush().unwrap();
    path
}

/// Run a drive on its own thread against a pipe pair; return the
/// host-side transport and the join handle.
fn start_drive(path: PathBuf) -> (Transport, thread::JoinHandle<iec::Result<()>>) {
    let (host_end, drive_end) = pipe_pair();
    let handle = thread::spawn(move || {
        let mut drive = Drive::new(Transport::new(Box::new(drive_end)), 8)?;
        drive.serve(&path)
    });
    (Transport::new(Box::new(host_end)), handle)
}

fn stop_drive(host: Transport, handle: thread::JoinHandle<iec::Result<()>>) {
    drop(host);
    handle.join().unwrap().unwrap();
}

#[test]
fn test_save_then_load_round_trip() {
    let path = fresh_image("roundtrip.d64");
    let (mut host, handle) = start_drive(path.clone());

    let data = [0x01u8, 0x08, 0xAA, 0xBB];
    let written = host.save(&"hello".into(), 8, &data).unwrap();
    assert_eq!(written, data.len());

    let loaded = host.load(&"hello".into(), 8).unwrap();
    assert_eq!(loaded, data);

    stop_drive(host, handle);

    // The image on disk carries the file as well.
    let disk = DiskImage::open_read_only(&path).unwrap();
    assert_eq!(disk.read_file(&"hello".into()).unwrap(), data);
    assert_eq!(disk.blocks_free().unwrap(), 663);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_wildcard_load() {
    let path = fresh_image("wildcard.d64");
    {
        let mut disk = DiskImage::open(&path).unwrap();
        disk.write_file(&"abc".into(), b"first").unwrap();
        disk.write_file(&"abcd".into(), b"second").unwrap();
        disk.write_file(&"xyz".into(), b"third").unwrap();
    }
    let (mut host, handle) = start_drive(path.clone());

    assert_eq!(host.load(&"a*".into(), 8).unwrap(), b"first");
    assert_eq!(host.load(&"x?z".into(), 8).unwrap(), b"third");

    stop_drive(host, handle);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_directory_listing() {
    let path = fresh_image("listing.d64");
    {
        let mut disk = DiskImage::open(&path).unwrap();
        disk.write_file(&"hello".into(), &[0u8; 600]).unwrap();
    }
    let (mut host, handle) = start_drive(path.clone());

    let listing = host.load(&"$".into(), 8).unwrap();
    assert_eq!(&listing[..8], &LISTING_PREFIX);
    // The quoted disk name on the header line.
    assert_eq!(&listing[8..16], b"TESTDISK");
    // The file line and the footer.
    let name = b"HELLO";
    assert!(listing.windows(name.len()).any(|w| w == name));
    let footer = b"BLOCKS FREE.";
    assert!(listing.windows(footer.len()).any(|w| w == footer));
    assert_eq!(&listing[listing.len() - 3..], &[0x00, 0x00, 0x00]);

    stop_drive(host, handle);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_command_channel_and_status() {
    let path = scratch_path("unformatted.d64");
    let _ = fs::remove_file(&path);
    fs::write(&path, vec![0u8; IMAGE_SIZE]).unwrap();
    let (mut host, handle) = start_drive(path.clone());

    // The first status read returns the power-on banner.
    let mut status = vec![];
    host.receive_data(&mut status, 8, 15).unwrap();
    assert_eq!(&status[..2], b"73");

    // Format the disk through the command channel.
    let command: Petscii = "n:newdisk,nd".into();
    host.send_data(command.as_bytes(), 8, 15).unwrap();
    status.clear();
    host.receive_data(&mut status, 8, 15).unwrap();
    assert_eq!(&status[..2], b"00");

    // An unrecognized command reports a syntax error.
    let command: Petscii = "x".into();
    host.send_data(command.as_bytes(), 8, 15).unwrap();
    status.clear();
    host.receive_data(&mut status, 8, 15).unwrap();
    assert_eq!(&status[..2], b"31");

    // The freshly formatted disk takes files.
    host.save(&"works".into(), 8, b"payload").unwrap();
    assert_eq!(host.load(&"works".into(), 8).unwrap(), b"payload");

    stop_drive(host, handle);

    let disk = DiskImage::open_read_only(&path).unwrap();
    assert_eq!(disk.name().unwrap(), "newdisk".into());
    let _ = fs::remove_file(&path);
}

#[test]
fn test_scratch_command() {
    let path = fresh_image("scratch.d64");
    {
        let mut disk = DiskImage::open(&path).unwrap();
        disk.write_file(&"doomed".into(), b"bytes").unwrap();
    }
    let (mut host, handle) = start_drive(path.clone());

    let command: Petscii = "s:doomed".into();
    host.send_data(command.as_bytes(), 8, 15).unwrap();
    let mut status = vec![];
    host.receive_data(&mut status, 8, 15).unwrap();
    assert_eq!(&status[..2], b"01");
    assert_eq!(&status[4..19], b"FILES SCRATCHED");

    stop_drive(host, handle);

    let disk = DiskImage::open_read_only(&path).unwrap();
    assert!(disk.find_entry(&"doomed".into()).is_err());
    assert_eq!(disk.blocks_free().unwrap(), 664);
    let _ = fs::remove_file(&path);
}

#[test]
fn test_serve_local_directory() {
    let dir = scratch_path("local-dir");
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("game.prg"), b"local file contents").unwrap();

    let (mut host, handle) = start_drive(dir.clone());

    let loaded = host.load(&"game.prg".into(), 8).unwrap();
    assert_eq!(loaded, b"local file contents");

    host.save(&"saved.bin".into(), 8, b"stuff").unwrap();

    let listing = host.load(&"$".into(), 8).unwrap();
    assert_eq!(&listing[..8], &LISTING_PREFIX);

    stop_drive(host, handle);
    assert_eq!(fs::read(dir.join("saved.bin")).unwrap(), b"stuff");
    let _ = fs::remove_dir_all(&dir);
}

fn random_name(rng: &mut XorShiftRng, taken: &HashSet<String>) -> String {
    loop {
        let len = rng.gen_range(1, 17);
        let name: String = (0..len)
            .map(|_| (b'a' + rng.gen_range(0, 26)) as char)
            .collect();
        if !taken.contains(&name) {
            return name;
        }
    }
}

fn expected_blocks(size: usize) -> usize {
    ::std::cmp::max(1, (size + DATA_SIZE - 1) / DATA_SIZE)
}

#[test]
fn test_randomized_disk_round_trips() {
    let mut rng = XorShiftRng::from_seed(RNG_SEED);
    let mut disk = DiskImage::open_memory();
    disk.format(&"random".into(), b"rn").unwrap();

    let mut files: Vec<(String, Vec<u8>)> = vec![];
    let mut taken = HashSet::new();
    for _ in 0..40 {
        if rng.gen_range(0, 3) > 0 || files.is_empty() {
            let name = random_name(&mut rng, &taken);
            let size = rng.gen_range(0, 4000);
            let mut contents = vec![0u8; size];
            rng.fill(&mut contents[..]);
            disk.write_file(&name.as_str().into(), &contents).unwrap();
            taken.insert(name.clone());
            files.push((name, contents));
        } else {
            let index = rng.gen_range(0, files.len());
            let (name, _) = files.remove(index);
            assert_eq!(disk.scratch(&name.as_str().into()).unwrap(), 1);
            taken.remove(&name);
        }

        // Every file reads back intact, and the BAM free count agrees
        // with the directory contents.
        for (name, contents) in files.iter() {
            assert_eq!(&disk.read_file(&name.as_str().into()).unwrap(), contents);
        }
        let used: usize = files.iter().map(|(_, c)| expected_blocks(c.len())).sum();
        assert_eq!(disk.blocks_free().unwrap(), 664 - used);
    }
}

#[test]
#[ignore]
fn test_randomized_disk_until_full() {
    let mut rng = XorShiftRng::from_seed(RNG_SEED);
    let mut disk = DiskImage::open_memory();
    disk.format(&"fill".into(), b"fl").unwrap();

    let mut taken = HashSet::new();
    let mut used = 0usize;
    loop {
        let name = random_name(&mut rng, &taken);
        let size = rng.gen_range(0, 64 * 1024);
        let mut contents = vec![0u8; size];
        rng.fill(&mut contents[..]);
        match disk.write_file(&name.as_str().into(), &contents) {
            Ok(()) => {
                taken.insert(name.clone());
                used += expected_blocks(size);
                assert_eq!(disk.read_file(&name.as_str().into()).unwrap(), contents);
                assert_eq!(disk.blocks_free().unwrap(), 664 - used);
            }
            Err(IecError::NoSpaceLeftOnDevice) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert!(disk.blocks_free().unwrap() < 664);
}
