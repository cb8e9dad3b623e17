//! Bounded JSON line reading for stream-backed ports.

use std::io::{self, BufRead};

/// Outcome of reading one line.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum LineRead {
    /// A complete line, including its trailing newline when present.
    Line(Vec<u8>),
    /// A line longer than the limit; its bytes were consumed and discarded.
    Oversize(usize),
    /// The stream ended with no pending bytes.
    Eof,
}

/// Reads the next newline-terminated line, never buffering more than
/// `max_bytes` of it.
pub(super) fn read_line_bounded<R: BufRead>(
    reader: &mut R,
    max_bytes: usize,
) -> io::Result<LineRead> {
    let mut line = Vec::new();
    let mut discarded = 0_usize;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error) => return Err(error),
        };
        if available.is_empty() {
            return Ok(finish_at_end_of_stream(line, discarded));
        }

        let newline = available.iter().position(|byte| *byte == b'\n');
        let take = newline.map_or(available.len(), |pos| pos + 1);
        if discarded == 0 && line.len() + take <= max_bytes {
            line.extend(available.iter().take(take));
        } else {
            discarded += line.len() + take;
            line.clear();
        }
        reader.consume(take);

        if newline.is_some() {
            return Ok(if discarded > 0 {
                LineRead::Oversize(discarded)
            } else {
                LineRead::Line(line)
            });
        }
    }
}

fn finish_at_end_of_stream(line: Vec<u8>, discarded: usize) -> LineRead {
    if discarded > 0 {
        LineRead::Oversize(discarded)
    } else if line.is_empty() {
        LineRead::Eof
    } else {
        LineRead::Line(line)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use rstest::rstest;

    use super::*;

    #[test]
    fn reads_lines_in_order() {
        let mut reader = Cursor::new(b"one\ntwo\n".to_vec());
        assert_eq!(
            read_line_bounded(&mut reader, 64).expect("read"),
            LineRead::Line(b"one\n".to_vec())
        );
        assert_eq!(
            read_line_bounded(&mut reader, 64).expect("read"),
            LineRead::Line(b"two\n".to_vec())
        );
        assert_eq!(read_line_bounded(&mut reader, 64).expect("read"), LineRead::Eof);
    }

    #[test]
    fn returns_unterminated_tail() {
        let mut reader = Cursor::new(b"tail".to_vec());
        assert_eq!(
            read_line_bounded(&mut reader, 64).expect("read"),
            LineRead::Line(b"tail".to_vec())
        );
    }

    #[rstest]
    #[case::single_buffer(64)]
    #[case::tiny_buffer(2)]
    fn skips_oversize_line_and_recovers(#[case] capacity: usize) {
        let input = b"0123456789\nok\n".to_vec();
        let mut reader = BufReader::with_capacity(capacity, Cursor::new(input));
        assert_eq!(
            read_line_bounded(&mut reader, 4).expect("read"),
            LineRead::Oversize(11)
        );
        assert_eq!(
            read_line_bounded(&mut reader, 4).expect("read"),
            LineRead::Line(b"ok\n".to_vec())
        );
    }
}
