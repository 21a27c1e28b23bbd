//! Comma-separated block number lists: free-list blocks and indirect blocks.
//!
//! Lists have no closing delimiter, so they are written at their natural
//! length. Padding them with the `0` filler would extend the last number.

use fdfs_types::{BlockNumber, Layout, ParseError, parse_uint};

/// Content of a block referenced by a file inode's `location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationContent {
    /// Raw payload of a single-block file.
    Direct(Vec<u8>),
    /// Ordered data block numbers of a multi-block file.
    Indirect(Vec<BlockNumber>),
}

fn list_text(raw: &[u8]) -> Option<&str> {
    std::str::from_utf8(raw)
        .ok()
        .map(|text| text.trim_end_matches('\0').trim_ascii())
}

/// Decode a list block into block numbers, validating each against `layout`.
///
/// Empty content is an empty list.
pub fn parse_block_list(raw: &[u8], layout: &Layout) -> Result<Vec<BlockNumber>, ParseError> {
    let text = list_text(raw).ok_or_else(|| ParseError::InvalidInteger {
        field: "block list",
        value: String::from_utf8_lossy(raw).into_owned(),
    })?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|token| {
            let value = parse_uint(token).ok_or_else(|| ParseError::InvalidInteger {
                field: "block list",
                value: token.trim_ascii().to_owned(),
            })?;
            layout.check_block(value)
        })
        .collect()
}

/// Encode block numbers as `<n>, <n>, ...`.
#[must_use]
pub fn encode_block_list(blocks: &[BlockNumber]) -> Vec<u8> {
    blocks
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
        .into_bytes()
}

/// Decide whether a `location` block is an indirect array or direct data.
///
/// Content is an indirect array when every comma-separated token is an
/// integer (see [`parse_uint`]) and there are at least two tokens; anything
/// else is direct data. Two shapes cannot be told apart and are rejected as
/// [`ParseError::Ambiguous`]: an empty block, and a block holding a single
/// integer, which reads equally as a one-entry array or a short payload.
pub fn classify_location(raw: &[u8], layout: &Layout) -> Result<LocationContent, ParseError> {
    let Some(text) = list_text(raw) else {
        return Ok(LocationContent::Direct(raw.to_vec()));
    };
    if text.is_empty() {
        return Err(ParseError::Ambiguous {
            reason: "location block is empty",
        });
    }

    let numbers: Option<Vec<u64>> = text.split(',').map(parse_uint).collect();
    match numbers {
        None => Ok(LocationContent::Direct(raw.to_vec())),
        Some(numbers) if numbers.len() == 1 => Err(ParseError::Ambiguous {
            reason: "single integer could be an index or a payload",
        }),
        Some(numbers) => numbers
            .into_iter()
            .map(|n| layout.check_block(n))
            .collect::<Result<Vec<_>, _>>()
            .map(LocationContent::Indirect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_list_round_trip() {
        let blocks = vec![BlockNumber(27), BlockNumber(28), BlockNumber(400)];
        let bytes = encode_block_list(&blocks);
        assert_eq!(bytes, b"27, 28, 400");
        assert_eq!(
            parse_block_list(&bytes, &Layout::DEFAULT).expect("list"),
            blocks
        );
    }

    #[test]
    fn empty_block_list() {
        assert!(encode_block_list(&[]).is_empty());
        assert!(
            parse_block_list(b"", &Layout::DEFAULT)
                .expect("empty")
                .is_empty()
        );
        assert!(
            parse_block_list(b"\0\0 ", &Layout::DEFAULT)
                .expect("blank")
                .is_empty()
        );
    }

    #[test]
    fn block_list_rejects_garbage() {
        assert!(matches!(
            parse_block_list(b"27, x, 29", &Layout::DEFAULT),
            Err(ParseError::InvalidInteger { .. })
        ));
        assert_eq!(
            parse_block_list(b"27, 10000", &Layout::DEFAULT),
            Err(ParseError::BlockOutOfRange {
                value: 10_000,
                max: 10_000
            })
        );
    }

    #[test]
    fn classify_integer_list_as_indirect() {
        let content = classify_location(b"10, 11, 12", &Layout::DEFAULT).expect("classify");
        assert_eq!(
            content,
            LocationContent::Indirect(vec![BlockNumber(10), BlockNumber(11), BlockNumber(12)])
        );
    }

    #[test]
    fn classify_text_as_direct() {
        let raw = b"hello, world 12";
        assert_eq!(
            classify_location(raw, &Layout::DEFAULT).expect("classify"),
            LocationContent::Direct(raw.to_vec())
        );
        // Signed numbers are not block numbers.
        assert!(matches!(
            classify_location(b"-1, 2", &Layout::DEFAULT),
            Ok(LocationContent::Direct(_))
        ));
        // Non-UTF-8 payloads are direct data.
        assert!(matches!(
            classify_location(&[0xff, 0xfe, b'1'], &Layout::DEFAULT),
            Ok(LocationContent::Direct(_))
        ));
    }

    #[test]
    fn classify_rejects_ambiguous_content() {
        assert!(matches!(
            classify_location(b"", &Layout::DEFAULT),
            Err(ParseError::Ambiguous { .. })
        ));
        assert!(matches!(
            classify_location(b"  42 ", &Layout::DEFAULT),
            Err(ParseError::Ambiguous { .. })
        ));
    }

    #[test]
    fn classify_out_of_range_pointer() {
        assert_eq!(
            classify_location(b"30, 20000", &Layout::DEFAULT),
            Err(ParseError::BlockOutOfRange {
                value: 20_000,
                max: 10_000
            })
        );
    }
}
