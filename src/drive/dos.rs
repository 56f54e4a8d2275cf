//! DOS command strings and the drive status channel.
//!
//! Commands arrive in PETSCII on secondary address 15, terminated by CR
//! or CR+LF.  The first letter selects the command; `B` and `M`
//! commands need a `-` and a qualifying letter.  Replies on the status
//! channel follow the 1541 format `NN, MESSAGE,TT,SS`.

use crate::error::IecError;
use crate::petscii::Petscii;

pub const PETSCII_CR: u8 = 0x0D;
pub const PETSCII_LF: u8 = 0x0A;
const PETSCII_COMMA: u8 = 0x2C;
const PETSCII_MINUS: u8 = 0x2D;
const PETSCII_COLON: u8 = 0x3A;

/// Command kinds recognized on the command channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DosCommand {
    None,
    New,
    Scratch,
    Rename,
    Copy,
    UtilLoader,
    Position,
    User,
    BlockAllocate,
    BlockFree,
    BlockRead,
    BlockWrite,
    BlockExecute,
    BufferPointer,
    MemoryRead,
    MemoryWrite,
    MemoryExecute,
    Duplicate,
    Initialize,
    Validate,
}

/// Strip a trailing CR or CR+LF and identify the command from its
/// first letter.  `None` is returned for unrecognized commands (DOS
/// error 31); an empty command identifies as `DosCommand::None`.
pub fn identify(command: &mut Vec<u8>) -> Option<DosCommand> {
    if command.len() > 1 {
        let len = command.len();
        if command[len - 1] == PETSCII_CR {
            command.truncate(len - 1);
        } else if command[len - 2] == PETSCII_CR {
            command.truncate(len - 2);
        }
    }
    if command.is_empty() {
        return Some(DosCommand::None);
    }

    match command[0] {
        b'N' => Some(DosCommand::New),
        b'S' => Some(DosCommand::Scratch),
        b'R' => Some(DosCommand::Rename),
        b'C' => Some(DosCommand::Copy),
        b'&' => Some(DosCommand::UtilLoader),
        b'P' => Some(DosCommand::Position),
        b'U' => Some(DosCommand::User),
        b'B' => {
            // A '-' with a qualifying letter after it, anywhere before
            // the arguments.
            let minus = command.iter().position(|&c| c == PETSCII_MINUS)?;
            match command.get(minus + 1)? {
                b'A' => Some(DosCommand::BlockAllocate),
                b'F' => Some(DosCommand::BlockFree),
                b'R' => Some(DosCommand::BlockRead),
                b'W' => Some(DosCommand::BlockWrite),
                b'E' => Some(DosCommand::BlockExecute),
                b'P' => Some(DosCommand::BufferPointer),
                _ => None,
            }
        }
        b'M' => {
            if command.len() < 3 || command[1] != PETSCII_MINUS {
                return None;
            }
            match command[2] {
                b'R' => Some(DosCommand::MemoryRead),
                b'W' => Some(DosCommand::MemoryWrite),
                b'E' => Some(DosCommand::MemoryExecute),
                _ => None,
            }
        }
        b'D' => Some(DosCommand::Duplicate),
        b'I' => Some(DosCommand::Initialize),
        b'V' => Some(DosCommand::Validate),
        _ => None,
    }
}

/// The argument part of a command string: everything after the first
/// colon, or empty when there is none.
pub fn arguments(command: &[u8]) -> &[u8] {
    match command.iter().position(|&c| c == PETSCII_COLON) {
        Some(colon) => &command[colon + 1..],
        None => &[],
    }
}

/// A file specification from an OPEN name or command argument:
/// `[[drive]:]name[,type][,mode]`.  A drive number prefix before the
/// colon is accepted and dropped.
pub struct FileSpec {
    pub name: Petscii,
    pub file_type: u8,
    pub access: u8,
}

pub fn parse_file_spec(bytes: &[u8]) -> FileSpec {
    let mut name = Vec::new();
    let mut file_type = 0x20;
    let mut access = b'R';
    let mut commas = 0;
    for &c in bytes {
        match c {
            PETSCII_COLON if commas == 0 => name.clear(),
            PETSCII_COMMA => commas += 1,
            _ => match commas {
                0 => name.push(c),
                1 => file_type = c,
                2 => access = c,
                _ => {}
            },
        }
    }
    FileSpec {
        name: Petscii::from_bytes(&name),
        file_type,
        access,
    }
}

/// One entry of the status channel, in 1541 form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DosStatus {
    pub code: u8,
    pub message: &'static str,
    pub track: u8,
    pub sector: u8,
}

impl DosStatus {
    pub fn ok() -> DosStatus {
        DosStatus {
            code: 0,
            message: "OK",
            track: 0,
            sector: 0,
        }
    }

    /// The power-on banner of the drive.
    pub fn power_on() -> DosStatus {
        DosStatus {
            code: 73,
            message: "CBM DOS V2.6 1541",
            track: 0,
            sector: 0,
        }
    }

    pub fn syntax_error() -> DosStatus {
        DosStatus {
            code: 31,
            message: "SYNTAX ERROR",
            track: 0,
            sector: 0,
        }
    }

    pub fn files_scratched(count: usize) -> DosStatus {
        DosStatus {
            code: 1,
            message: "FILES SCRATCHED",
            track: ::std::cmp::min(count, 255) as u8,
            sector: 0,
        }
    }

    pub fn from_error(error: IecError) -> DosStatus {
        let (code, message) = match error {
            IecError::FileNotFound => (62, "FILE NOT FOUND"),
            IecError::FileExists => (63, "FILE EXISTS"),
            IecError::NoSpaceLeftOnDevice => (72, "DISK FULL"),
            IecError::UnknownDiskImage | IecError::DiskImageError => (74, "DRIVE NOT READY"),
            IecError::FileReadError => (20, "READ ERROR"),
            IecError::FileWriteError => (25, "WRITE ERROR"),
            _ => (70, "NO CHANNEL"),
        };
        DosStatus {
            code,
            message,
            track: 0,
            sector: 0,
        }
    }

    /// Render as the PETSCII status line, CR-terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let text = format!(
            "{:02}, {},{:02},{:02}\r",
            self.code, self.message, self.track, self.sector
        );
        text.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identify_str(s: &str) -> Option<DosCommand> {
        let mut bytes = s.as_bytes().to_vec();
        identify(&mut bytes)
    }

    #[test]
    fn test_first_letter_dispatch() {
        assert_eq!(identify_str("N:DISK,ID"), Some(DosCommand::New));
        assert_eq!(identify_str("S:OLDFILE"), Some(DosCommand::Scratch));
        assert_eq!(identify_str("R:NEW=OLD"), Some(DosCommand::Rename));
        assert_eq!(identify_str("C:COPY=FILE"), Some(DosCommand::Copy));
        assert_eq!(identify_str("&LOADER"), Some(DosCommand::UtilLoader));
        assert_eq!(identify_str("P\x61\x01\x00\x00"), Some(DosCommand::Position));
        assert_eq!(identify_str("UI"), Some(DosCommand::User));
        assert_eq!(identify_str("D"), Some(DosCommand::Duplicate));
        assert_eq!(identify_str("I0"), Some(DosCommand::Initialize));
        assert_eq!(identify_str("V"), Some(DosCommand::Validate));
    }

    #[test]
    fn test_block_and_memory_commands() {
        assert_eq!(identify_str("B-A:0,1,0"), Some(DosCommand::BlockAllocate));
        assert_eq!(identify_str("B-F:0,1,0"), Some(DosCommand::BlockFree));
        assert_eq!(identify_str("B-R:2,0,18,0"), Some(DosCommand::BlockRead));
        assert_eq!(identify_str("B-W:2,0,18,0"), Some(DosCommand::BlockWrite));
        assert_eq!(identify_str("B-E:2,0,1,0"), Some(DosCommand::BlockExecute));
        assert_eq!(identify_str("B-P:2,0"), Some(DosCommand::BufferPointer));
        assert_eq!(identify_str("BLOCK-READ:2,0,18,0"), Some(DosCommand::BlockRead));
        assert_eq!(identify_str("M-R\x00\x04"), Some(DosCommand::MemoryRead));
        assert_eq!(identify_str("M-W\x00\x04\x01\x60"), Some(DosCommand::MemoryWrite));
        assert_eq!(identify_str("M-E\x00\x04"), Some(DosCommand::MemoryExecute));
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(identify_str("X"), None);
        assert_eq!(identify_str("B"), None);
        assert_eq!(identify_str("B-X:0"), None);
        assert_eq!(identify_str("M"), None);
        assert_eq!(identify_str("MR"), None);
        assert_eq!(identify_str("M-Q"), None);
    }

    #[test]
    fn test_terminator_stripping() {
        let mut bytes = b"V\r".to_vec();
        assert_eq!(identify(&mut bytes), Some(DosCommand::Validate));
        assert_eq!(bytes, b"V");

        let mut bytes = b"V\r\n".to_vec();
        assert_eq!(identify(&mut bytes), Some(DosCommand::Validate));
        assert_eq!(bytes, b"V");

        let mut bytes = vec![];
        assert_eq!(identify(&mut bytes), Some(DosCommand::None));
    }

    #[test]
    fn test_arguments() {
        assert_eq!(arguments(b"N0:DISK,ID"), b"DISK,ID");
        assert_eq!(arguments(b"V"), b"");
    }

    #[test]
    fn test_file_spec() {
        let spec = parse_file_spec(b"0:GAME,P,W");
        assert_eq!(spec.name, Petscii::from_bytes(b"GAME"));
        assert_eq!(spec.file_type, b'P');
        assert_eq!(spec.access, b'W');

        let spec = parse_file_spec(b"JUSTANAME");
        assert_eq!(spec.name, Petscii::from_bytes(b"JUSTANAME"));
        assert_eq!(spec.file_type, 0x20);
        assert_eq!(spec.access, b'R');
    }

    #[test]
    fn test_status_rendering() {
        assert_eq!(DosStatus::ok().to_bytes(), b"00, OK,00,00\r".to_vec());
        assert_eq!(
            DosStatus::power_on().to_bytes(),
            b"73, CBM DOS V2.6 1541,00,00\r".to_vec()
        );
        assert_eq!(
            DosStatus::files_scratched(3).to_bytes(),
            b"01, FILES SCRATCHED,03,00\r".to_vec()
        );
    }
}
