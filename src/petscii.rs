//! PETSCII strings and conversion to and from ASCII.
//!
//! PETSCII is the Commodore 8-bit character set.  It differs from ASCII
//! in the layout of the letter cases and in its control codes: the
//! unshifted range 0x41..0x5A renders as lower case on a stock C64, the
//! shifted ranges 0x61..0x7A and 0xC1..0xDA as upper case.  Codes
//! 0x60..0x7F and 0xE0..0xFE are shadows of 0xC0..0xDF and 0xA0..0xBE.

use std::fmt;

/// The byte used to pad file names, disk names, and ids on disk.
pub const PADDING_BYTE: u8 = 0xA0;

// PETSCII code points for printable ASCII characters.  Codes with no
// mapping render as a space.
#[rustfmt::skip]
static PETSCII_TO_ASCII: [u8; 256] = [
    /*        _0   _1   _2   _3   _4   _5   _6   _7   _8   _9   _A   _B   _C   _D   _E   _F */
    /*00*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b'\r',b' ',b' ',
    /*10*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
    /*20*/ b' ',b'!',b'"',b'#',b'$',b'%',b'&',b'\'',b'(',b')',b'*',b'+',b',',b'-',b'.',b'/',
    /*30*/ b'0',b'1',b'2',b'3',b'4',b'5',b'6',b'7',b'8',b'9',b':',b';',b'<',b'=',b'>',b'?',
    /*40*/ b'@',b'a',b'b',b'c',b'd',b'e',b'f',b'g',b'h',b'i',b'j',b'k',b'l',b'm',b'n',b'o',
    /*50*/ b'p',b'q',b'r',b's',b't',b'u',b'v',b'w',b'x',b'y',b'z',b'[',b' ',b']',b' ',b' ',
    /*60*/ b' ',b'A',b'B',b'C',b'D',b'E',b'F',b'G',b'H',b'I',b'J',b'K',b'L',b'M',b'N',b'O',
    /*70*/ b'P',b'Q',b'R',b'S',b'T',b'U',b'V',b'W',b'X',b'Y',b'Z',b' ',b' ',b' ',b' ',b' ',
    /*80*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b'\n',b' ',b' ',
    /*90*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
    /*A0*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
    /*B0*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
    /*C0*/ b' ',b'A',b'B',b'C',b'D',b'E',b'F',b'G',b'H',b'I',b'J',b'K',b'L',b'M',b'N',b'O',
    /*D0*/ b'P',b'Q',b'R',b'S',b'T',b'U',b'V',b'W',b'X',b'Y',b'Z',b' ',b' ',b' ',b' ',b' ',
    /*E0*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
    /*F0*/ b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',b' ',
];

/// Convert a single PETSCII code to a printable ASCII character.
/// Unmapped codes become a space.
pub fn petscii_to_ascii(petscii: u8) -> char {
    PETSCII_TO_ASCII[petscii as usize] as char
}

/// Convert a single ASCII character to PETSCII.  The reverse mapping
/// returns the first matching table index; unmapped characters become a
/// space (0x20).
pub fn ascii_to_petscii(ascii: char) -> u8 {
    // Space needs special treatment since it is the filler character of
    // the conversion table.
    if ascii == ' ' {
        return 0x20;
    }
    let ascii = if ascii.is_ascii() { ascii as u8 } else { b' ' };
    for (code, c) in PETSCII_TO_ASCII.iter().enumerate() {
        if *c == ascii {
            return code as u8;
        }
    }
    0x20
}

/// Fold the shadow letter ranges onto their canonical codes so that file
/// names compare case-insensitively: 0x60..0x7F maps onto 0xC0..0xDF and
/// 0xE0..0xFE onto 0xA0..0xBE.
pub fn fold_case(c: u8) -> u8 {
    match c {
        0x60..=0x7F => c + 0x60,
        0xE0..=0xFE => c - 0x40,
        _ => c,
    }
}

/// An owned PETSCII string.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Petscii(Vec<u8>);

impl Petscii {
    pub fn new() -> Petscii {
        Petscii(Vec::new())
    }

    pub fn from_bytes(bytes: &[u8]) -> Petscii {
        Petscii(bytes.to_vec())
    }

    /// Read a fixed-size on-disk field, trimming everything from the
    /// first padding byte onward.
    pub fn from_padded_bytes(bytes: &[u8], padding: u8) -> Petscii {
        let end = bytes.iter().position(|&b| b == padding).unwrap_or(bytes.len());
        Petscii(bytes[..end].to_vec())
    }

    pub fn from_str(string: &str) -> Petscii {
        Petscii(string.chars().map(ascii_to_petscii).collect())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, code: u8) {
        self.0.push(code);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Render this string into a fixed-size on-disk field, filling the
    /// remainder with the padding byte.  Fails when the string does not
    /// fit.
    pub fn write_bytes_with_padding(&self, bytes: &mut [u8], padding: u8) -> Result<(), ()> {
        if self.0.len() > bytes.len() {
            return Err(());
        }
        bytes[..self.0.len()].copy_from_slice(&self.0);
        for b in bytes[self.0.len()..].iter_mut() {
            *b = padding;
        }
        Ok(())
    }

    pub fn to_ascii_string(&self) -> String {
        self.0.iter().map(|&b| petscii_to_ascii(b)).collect()
    }
}

impl From<&str> for Petscii {
    fn from(string: &str) -> Petscii {
        Petscii::from_str(string)
    }
}

impl From<String> for Petscii {
    fn from(string: String) -> Petscii {
        Petscii::from_str(&string)
    }
}

impl<'a> From<&'a String> for Petscii {
    fn from(string: &String) -> Petscii {
        Petscii::from_str(string)
    }
}

impl From<Petscii> for String {
    fn from(petscii: Petscii) -> String {
        petscii.to_ascii_string()
    }
}

impl fmt::Display for Petscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(&self.to_ascii_string())
    }
}

impl fmt::Debug for Petscii {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self.to_ascii_string())
    }
}
