use std::fmt::Write as _;

const BYTES_PER_LINE: usize = 16;

/// Renders `data` as dump lines of 16 bytes: hex on the left, printable ASCII on the right.
pub fn hex_ascii(data: &[u8]) -> Vec<String> {
    data.chunks(BYTES_PER_LINE)
        .map(|chunk| {
            let mut text = String::with_capacity(BYTES_PER_LINE + 1);
            for index in 0..BYTES_PER_LINE {
                match chunk.get(index) {
                    Some(byte) if byte.is_ascii_graphic() => text.push(char::from(*byte)),
                    _ => text.push('.'),
                }
                if index == 7 {
                    text.push(' ');
                }
            }
            format!("    {}    {text}\n", hex_column(chunk))
        })
        .collect()
}

/// Renders `data` as dump lines of 16 bytes: hex on the left, the eight native-endian 16-bit
/// units as characters on the right.
pub fn hex_unicode(data: &[u8]) -> Vec<String> {
    data.chunks(BYTES_PER_LINE)
        .map(|chunk| {
            let text: String = (0..BYTES_PER_LINE / 2)
                .map(|unit| match (chunk.get(unit * 2), chunk.get(unit * 2 + 1)) {
                    (Some(low), Some(high)) => printable_unit(u16::from_ne_bytes([*low, *high])),
                    _ => '.',
                })
                .collect();
            format!("    {}    {text}\n", hex_column(chunk))
        })
        .collect()
}

fn printable_unit(unit: u16) -> char {
    match char::from_u32(u32::from(unit)) {
        Some(c) if c != ' ' && !c.is_control() => c,
        _ => '.',
    }
}

/// Two hex digits and a space per byte, three extra spaces between groups of four; padded out
/// to a full line.
fn hex_column(chunk: &[u8]) -> String {
    let mut hex = String::with_capacity(BYTES_PER_LINE * 3 + 9);
    for index in 0..BYTES_PER_LINE {
        match chunk.get(index) {
            Some(byte) => {
                let _ = write!(hex, "{byte:02X} ");
            }
            None => hex.push_str("   "),
        }
        if index % 4 == 3 && index != BYTES_PER_LINE - 1 {
            hex.push_str("   ");
        }
    }
    hex
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_dump_full_line() {
        let lines = hex_ascii(b"Hello, leakwatch");
        assert_eq!(
            lines,
            vec![
                "    48 65 6C 6C    6F 2C 20 6C    65 61 6B 77    61 74 63 68     Hello,.l eakwatch\n"
            ]
        );
    }

    #[test]
    fn test_should_pad_last_line() {
        let lines = hex_ascii(&[0x41; 20]);
        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[1],
            format!("    41 41 41 41{}    AAAA.... ........\n", " ".repeat(46))
        );
        // every line has the same width
        assert_eq!(lines[0].len(), lines[1].len());
    }

    #[test]
    fn test_should_hide_unprintable_bytes() {
        let lines = hex_ascii(&[0x00, 0x0A, 0x7F, 0xFF, b'~']);
        assert!(lines[0].ends_with("    ....~... ........\n"), "{:?}", lines[0]);
    }

    #[test]
    fn test_should_dump_utf16_units() {
        let data: Vec<u8> = "Leak wat"
            .encode_utf16()
            .flat_map(u16::to_ne_bytes)
            .collect();
        let lines = hex_unicode(&data);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("    Leak.wat\n"), "{:?}", lines[0]);

        // an odd trailing byte has no unit to show
        let lines = hex_unicode(&data[..3]);
        assert!(lines[0].ends_with("    L.......\n"), "{:?}", lines[0]);
    }
}
