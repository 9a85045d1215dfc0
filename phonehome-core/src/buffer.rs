//! Growable byte buffer with XML-aware append helpers.
//!
//! All message bodies and canonical strings are assembled in a
//! [`DynBuffer`]. Every append returns a [`Result`]; on
//! [`PhoneHomeError::Allocation`] the buffer may hold a partial append and
//! the caller must discard its content for that operation.

use std::fmt;

use crate::error::{PhoneHomeError, Result};

/// Indentation emitted per nesting level by the XML element helpers.
const XML_INDENT: &str = "    ";

/// Owned byte buffer with explicit growth.
///
/// Capacity doubles, or grows to fit the append, whichever is larger.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DynBuffer {
    data: Vec<u8>,
}

impl DynBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| PhoneHomeError::Allocation {
                requested: capacity,
            })?;
        Ok(Self { data })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Buffer contents as text, if they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Sets the length to zero; capacity is kept.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Removes leading and trailing ASCII whitespace.
    pub fn trim(&mut self) {
        let end = self
            .data
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        self.data.truncate(end);
        let start = self
            .data
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(self.data.len());
        self.data.drain(..start);
    }

    fn ensure(&mut self, additional: usize) -> Result<()> {
        let needed = self
            .data
            .len()
            .checked_add(additional)
            .ok_or(PhoneHomeError::Allocation {
                requested: usize::MAX,
            })?;
        if needed <= self.data.capacity() {
            return Ok(());
        }
        let target = needed.max(self.data.capacity().saturating_mul(2));
        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|_| PhoneHomeError::Allocation { requested: target })
    }

    // -----------------------------------------------------------------------
    // Raw appends
    // -----------------------------------------------------------------------

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_str(&mut self, s: &str) -> Result<()> {
        self.append(s.as_bytes())
    }

    pub fn append_char(&mut self, c: char) -> Result<()> {
        let mut utf8 = [0u8; 4];
        self.append(c.encode_utf8(&mut utf8).as_bytes())
    }

    /// Appends formatted text; use with `format_args!`.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<()> {
        struct Adapter<'a> {
            buf: &'a mut DynBuffer,
            err: Option<PhoneHomeError>,
        }

        impl fmt::Write for Adapter<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                self.buf.append_str(s).map_err(|err| {
                    self.err = Some(err);
                    fmt::Error
                })
            }
        }

        let mut adapter = Adapter {
            buf: self,
            err: None,
        };
        match fmt::write(&mut adapter, args) {
            Ok(()) => Ok(()),
            Err(_) => Err(adapter
                .err
                .take()
                .unwrap_or(PhoneHomeError::Allocation { requested: 0 })),
        }
    }

    // -----------------------------------------------------------------------
    // Escaping appends
    // -----------------------------------------------------------------------

    /// Appends `s` with XML text escaping.
    pub fn append_xml(&mut self, s: &str) -> Result<()> {
        for c in s.chars() {
            self.append_str(xml_escape_char(c, &mut [0u8; 4]))?;
        }
        Ok(())
    }

    /// Appends `s` with XML escaping, writing at most `budget` bytes.
    ///
    /// Stops before the first escaped character that would overflow the
    /// budget; entities are never split. Returns the bytes written.
    pub fn append_xml_bounded(&mut self, s: &str, budget: usize) -> Result<usize> {
        let mut written = 0usize;
        for c in s.chars() {
            let mut scratch = [0u8; 4];
            let escaped = xml_escape_char(c, &mut scratch);
            if written + escaped.len() > budget {
                break;
            }
            self.append_str(escaped)?;
            written += escaped.len();
        }
        Ok(written)
    }

    /// Appends `s` restricted to `[A-Za-z0-9._:-]`; anything else becomes `_`.
    pub fn append_xml_token(&mut self, s: &str) -> Result<()> {
        self.ensure(s.len())?;
        for c in s.chars() {
            let keep = c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-');
            self.data.push(if keep { c as u8 } else { b'_' });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // XML element helpers
    // -----------------------------------------------------------------------

    fn append_pad(&mut self, pad: usize) -> Result<()> {
        for _ in 0..pad {
            self.append_str(XML_INDENT)?;
        }
        Ok(())
    }

    /// `<name>` on its own line.
    pub fn xml_elem(&mut self, pad: usize, name: &str) -> Result<()> {
        self.append_pad(pad)?;
        self.append_fmt(format_args!("<{name}>\n"))
    }

    /// `</name>` on its own line.
    pub fn xml_end(&mut self, pad: usize, name: &str) -> Result<()> {
        self.append_pad(pad)?;
        self.append_fmt(format_args!("</{name}>\n"))
    }

    /// `<name>escaped value</name>`.
    pub fn xml_nv(&mut self, pad: usize, name: &str, value: &str) -> Result<()> {
        self.append_pad(pad)?;
        self.append_fmt(format_args!("<{name}>"))?;
        self.append_xml(value)?;
        self.append_fmt(format_args!("</{name}>\n"))
    }

    /// `<name>token</name>` with token escaping.
    pub fn xml_nv_token(&mut self, pad: usize, name: &str, value: &str) -> Result<()> {
        self.append_pad(pad)?;
        self.append_fmt(format_args!("<{name}>"))?;
        self.append_xml_token(value)?;
        self.append_fmt(format_args!("</{name}>\n"))
    }

    /// `<name attr='attr_value'>escaped value</name>`.
    pub fn xml_anv(
        &mut self,
        pad: usize,
        attr: &str,
        attr_value: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.append_pad(pad)?;
        self.append_fmt(format_args!("<{name} {attr}='"))?;
        self.append_xml(attr_value)?;
        self.append_str("'>")?;
        self.append_xml(value)?;
        self.append_fmt(format_args!("</{name}>\n"))
    }

    /// `<name>true|false</name>`.
    pub fn xml_nb(&mut self, pad: usize, name: &str, value: bool) -> Result<()> {
        self.xml_nv(pad, name, if value { "true" } else { "false" })
    }
}

/// Escaped form of a single character. Control characters other than
/// tab, CR and LF are replaced by `.`.
fn xml_escape_char(c: char, scratch: &mut [u8; 4]) -> &str {
    match c {
        '<' => "&lt;",
        '>' => "&gt;",
        '&' => "&amp;",
        '"' => "&quot;",
        '\'' => "&apos;",
        '\t' | '\n' | '\r' => c.encode_utf8(scratch),
        c if c.is_control() => ".",
        c => c.encode_utf8(scratch),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn text(buf: &DynBuffer) -> &str {
        buf.as_str().expect("utf-8")
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("a<b>c", "a&lt;b&gt;c")]
    #[case("Tom & \"Jerry\"", "Tom &amp; &quot;Jerry&quot;")]
    #[case("it's", "it&apos;s")]
    #[case("bell\u{7}char", "bell.char")]
    #[case("line\nbreak", "line\nbreak")]
    #[case("caf\u{e9}", "caf\u{e9}")]
    fn xml_escaping(#[case] input: &str, #[case] expected: &str) {
        let mut buf = DynBuffer::new();
        buf.append_xml(input).unwrap();
        assert_eq!(text(&buf), expected);
    }

    #[rstest]
    #[case("SUNW,Sun-Fire-T200", "SUNW_Sun-Fire-T200")]
    #[case("a.b_c:d-e", "a.b_c:d-e")]
    #[case("has space/slash", "has_space_slash")]
    #[case("\u{e9}t\u{e9}", "_t_")]
    fn token_escaping(#[case] input: &str, #[case] expected: &str) {
        let mut buf = DynBuffer::new();
        buf.append_xml_token(input).unwrap();
        assert_eq!(text(&buf), expected);
    }

    #[test]
    fn bounded_escape_never_splits_entities() {
        let mut buf = DynBuffer::new();
        let written = buf.append_xml_bounded("ab&cd", 5).unwrap();
        // "ab" (2) + "&amp;" (5) would be 7 > 5, so stop after "ab".
        assert_eq!(written, 2);
        assert_eq!(text(&buf), "ab");
    }

    #[test]
    fn bounded_escape_writes_everything_under_budget() {
        let mut buf = DynBuffer::new();
        let written = buf.append_xml_bounded("a<b", 100).unwrap();
        assert_eq!(written, 6);
        assert_eq!(text(&buf), "a&lt;b");
    }

    #[test]
    fn growth_doubles_or_fits() {
        let mut buf = DynBuffer::with_capacity(4).unwrap();
        buf.append(b"abcd").unwrap();
        let before = buf.capacity();
        buf.append(b"e").unwrap();
        assert!(buf.capacity() >= before * 2);

        let big = vec![b'x'; 1000];
        buf.append(&big).unwrap();
        assert!(buf.capacity() >= 1005);
        assert_eq!(buf.len(), 1005);
    }

    #[test]
    fn reset_keeps_capacity() {
        let mut buf = DynBuffer::new();
        buf.append_str("some content").unwrap();
        let cap = buf.capacity();
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn trim_strips_both_ends() {
        let mut buf = DynBuffer::new();
        buf.append_str("  \r\n value with  inner space \n\t").unwrap();
        buf.trim();
        assert_eq!(text(&buf), "value with  inner space");

        let mut blank = DynBuffer::new();
        blank.append_str(" \n ").unwrap();
        blank.trim();
        assert!(blank.is_empty());
    }

    #[test]
    fn append_fmt_and_char() {
        let mut buf = DynBuffer::new();
        buf.append_fmt(format_args!("{}|{}", "POST", 42)).unwrap();
        buf.append_char('|').unwrap();
        buf.append_char('\u{e9}').unwrap();
        assert_eq!(text(&buf), "POST|42|\u{e9}");
    }

    #[test]
    fn element_helpers_indent_and_escape() {
        let mut buf = DynBuffer::new();
        buf.xml_elem(1, "heartbeat").unwrap();
        buf.xml_anv(2, "timezone", "UTC", "time", "2024-01-01T00:00:00")
            .unwrap();
        buf.xml_nb(2, "online", true).unwrap();
        buf.xml_nv(2, "summary", "disk <0> failed").unwrap();
        buf.xml_nv_token(2, "product-id", "SUNW,T5220").unwrap();
        buf.xml_end(1, "heartbeat").unwrap();
        let expected = "    <heartbeat>\n\
                        \x20       <time timezone='UTC'>2024-01-01T00:00:00</time>\n\
                        \x20       <online>true</online>\n\
                        \x20       <summary>disk &lt;0&gt; failed</summary>\n\
                        \x20       <product-id>SUNW_T5220</product-id>\n\
                        \x20   </heartbeat>\n";
        assert_eq!(text(&buf), expected);
    }
}
