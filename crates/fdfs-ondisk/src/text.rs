use fdfs_types::{PAD_BYTE, ParseError, parse_field};
use serde::{Deserialize, Serialize};

/// Structural delimiter counts of a block's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
    pub open: usize,
    pub close: usize,
}

impl Shape {
    #[must_use]
    pub fn detect(text: &str) -> Self {
        Self {
            open: text.matches('{').count(),
            close: text.matches('}').count(),
        }
    }

    pub(crate) fn expect(
        self,
        expected: &'static str,
        accept: impl Fn(Self) -> bool,
    ) -> Result<(), ParseError> {
        if accept(self) {
            Ok(())
        } else {
            Err(ParseError::Shape {
                expected,
                open: self.open,
                close: self.close,
            })
        }
    }
}

/// Block content as text, cut after the final `}`.
///
/// Everything past the closing brace is filler.
pub(crate) fn record_text(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    match text.rfind('}') {
        Some(end) => text[..=end].to_owned(),
        None => text.into_owned(),
    }
}

/// Right-pad an encoded record with the filler byte to exactly `block_size`.
pub fn pad_record(text: &str, block_size: usize) -> Result<Vec<u8>, ParseError> {
    if text.len() > block_size {
        return Err(ParseError::Oversized {
            len: text.len(),
            max: block_size,
        });
    }
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(block_size, PAD_BYTE);
    Ok(bytes)
}

/// `key:value` pairs of a record body.
///
/// Pairs are separated by commas and/or whitespace. A key whose value is
/// separated from its colon by whitespace (`mounted: 50`) is still one pair.
#[derive(Debug, Default)]
pub(crate) struct Fields<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    pub(crate) fn parse(body: &'a str) -> Self {
        let mut pairs = Vec::new();
        for piece in body.split(',') {
            let mut tokens = piece.split_ascii_whitespace().peekable();
            while let Some(token) = tokens.next() {
                let Some((key, value)) = token.split_once(':') else {
                    continue;
                };
                if value.is_empty() {
                    if let Some(next) = tokens.next_if(|t| !t.contains(':')) {
                        pairs.push((key, next));
                        continue;
                    }
                }
                pairs.push((key, value));
            }
        }
        Self { pairs }
    }

    fn find(&self, keys: &[&str]) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(key, _)| keys.contains(key))
            .map(|(_, value)| *value)
    }

    /// Integer value of `field`, also accepting any of `aliases` as its key.
    pub(crate) fn require_any(
        &self,
        field: &'static str,
        aliases: &[&str],
    ) -> Result<u64, ParseError> {
        let value = self
            .find(&[field])
            .or_else(|| self.find(aliases))
            .ok_or(ParseError::MissingField { field })?;
        parse_field(field, value)
    }

    pub(crate) fn require(&self, field: &'static str) -> Result<u64, ParseError> {
        self.require_any(field, &[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_text_cuts_filler() {
        assert_eq!(record_text(b"{a:1}000000"), "{a:1}");
        assert_eq!(record_text(b"{a:1}\0\0"), "{a:1}");
        assert_eq!(record_text(b"1, 2, 3"), "1, 2, 3");
    }

    #[test]
    fn fields_handle_spacing_variants() {
        let fields = Fields::parse("creationTime: 1376483073, mounted: 50,devId:20");
        assert_eq!(fields.require("creationTime"), Ok(1_376_483_073));
        assert_eq!(fields.require("mounted"), Ok(50));
        assert_eq!(fields.require_any("deviceId", &["devId"]), Ok(20));
        assert_eq!(
            fields.require("root"),
            Err(ParseError::MissingField { field: "root" })
        );
    }

    #[test]
    fn fields_split_on_whitespace_inside_a_piece() {
        let fields = Fields::parse(" indirect:0 location:2444");
        assert_eq!(fields.require("indirect"), Ok(0));
        assert_eq!(fields.require("location"), Ok(2444));
    }

    #[test]
    fn pad_record_fills_to_block_size() {
        let padded = pad_record("{x}", 8).expect("fits");
        assert_eq!(padded, b"{x}00000");
        assert_eq!(
            pad_record("123456789", 8),
            Err(ParseError::Oversized { len: 9, max: 8 })
        );
    }

    #[test]
    fn shape_counts_braces() {
        assert_eq!(
            Shape::detect("{a{b}}"),
            Shape { open: 2, close: 2 }
        );
    }
}
