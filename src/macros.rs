//! Debug-formatting helpers used by the `--verbose` log lines.

/// Render a byte buffer either as a hex dump (`"X"`) or as a printable-ASCII
/// dump with dots for non-printable bytes (`"C"`), for the one-line
/// `debug!("... {}", format_buffer!("X", &buf))` calls sprinkled through the
/// dispatcher.
#[macro_export]
macro_rules! format_buffer {
    ("X", $buf:expr) => {{
        let mut s = String::with_capacity($buf.len() * 3);
        for b in $buf.iter() {
            s.push_str(&format!("{:02X} ", b));
        }
        s
    }};

    ("C", $buf:expr) => {{
        let mut s = String::with_capacity($buf.len());
        for b in $buf.iter() {
            if b.is_ascii_graphic() {
                s.push(*b as char);
            } else {
                s.push('.');
            }
        }
        s
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn hex_dump() {
        let buf = [0xDEu8, 0xAD, 0xBE, 0xEF];
        assert_eq!(format_buffer!("X", &buf), "DE AD BE EF ");
    }

    #[test]
    fn ascii_dump() {
        let buf = [b'h', b'i', 0x00, b'!'];
        assert_eq!(format_buffer!("C", &buf), "hi.!");
    }
}
