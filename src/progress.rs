//! Terminal progress rendering.
//!
//! [`Bar`], [`Bytes`] and [`BytesPerSecond`] are `Display` helpers meant to
//! be composed with `write!`. [`ProgressWriter`] redraws a multi-line frame
//! in place.

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

const DEFAULT_BAR_WIDTH: usize = 40;

/// Progress bar for a fraction in `0.0..=1.0`.
///
/// The formatter width sets the bar width, so `format!("{:20}", Bar(0.5))`
/// renders a 20 column bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar(pub f64);

impl fmt::Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = f.width().unwrap_or(DEFAULT_BAR_WIDTH);
        if width < 3 {
            return f.write_str("[]");
        }
        let inner = width - 2;
        let fraction = if self.0.is_nan() { 0.0 } else { self.0.clamp(0.0, 1.0) };
        let filled = ((inner as f64) * fraction).floor() as usize;
        write!(
            f,
            "[{}{}]",
            "+".repeat(filled),
            "-".repeat(inner - filled)
        )
    }
}

/// Byte count rendered with decimal units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bytes(pub i64);

const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut size = self.0 as f64;
        let mut unit = 0;
        while size.abs() >= 1000.0 && unit < UNITS.len() - 1 {
            size /= 1000.0;
            unit += 1;
        }
        write!(f, "{}{}", significant(size, 4), UNITS[unit])
    }
}

/// Formats `value` with at most `digits` significant digits and no
/// trailing zeros.
fn significant(value: f64, digits: i32) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs().log10().floor() as i32 + 1;
    let decimals = (digits - magnitude).max(0) as usize;
    let rendered = format!("{:.*}", decimals, value);
    if rendered.contains('.') {
        rendered.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        rendered
    }
}

/// Transfer rate rendered as `<bytes>/s`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesPerSecond(pub i64);

impl BytesPerSecond {
    /// Rate of `n` bytes over `elapsed`.
    pub fn new(n: i64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self(0);
        }
        Self((n as f64 / secs) as i64)
    }
}

impl fmt::Display for BytesPerSecond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s", Bytes(self.0))
    }
}

/// Buffers a frame and redraws it over the previous one on flush.
pub struct ProgressWriter<W: Write> {
    out: W,
    buf: Vec<u8>,
    lines: usize,
}

impl<W: Write> ProgressWriter<W> {
    /// Wraps `out`.
    pub fn new(out: W) -> Self {
        Self {
            out,
            buf: Vec::new(),
            lines: 0,
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Write for ProgressWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for _ in 0..self.lines {
            // up one line, clear it
            self.out.write_all(b"\x1b[1A\x1b[2K")?;
        }
        self.lines = self.buf.iter().filter(|&&b| b == b'\n').count();
        self.out.write_all(&self.buf)?;
        self.buf.clear();
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn significant_digits() {
        assert_eq!(significant(1.5, 4), "1.5");
        assert_eq!(significant(123.456, 4), "123.5");
        assert_eq!(significant(10.0, 4), "10");
        assert_eq!(significant(999.99, 4), "1000");
    }
}
