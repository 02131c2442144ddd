//! Filename codec for rotated history files.
//!
//! Every managed file encodes its covered time range directly in its name,
//! `<prefix>.<startMillis>-<endMillis>`, with an empty end section marking
//! the still-active file.

/// Sentinel end timestamp for a file that is still accepting writes.
pub const END_OPEN: i64 = i64::MAX;

/// Time range covered by a managed file, parsed from or built into a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start_millis: i64,
    pub end_millis: i64,
}

impl Span {
    pub fn active(start_millis: i64) -> Self {
        Self {
            start_millis,
            end_millis: END_OPEN,
        }
    }

    pub fn sealed(start_millis: i64, end_millis: i64) -> Self {
        Self {
            start_millis,
            end_millis,
        }
    }

    pub fn is_active(&self) -> bool {
        self.end_millis == END_OPEN
    }

    /// Closed-interval intersection against `[from, to]`.
    pub fn overlaps(&self, from_millis: i64, to_millis: i64) -> bool {
        self.start_millis <= to_millis && from_millis <= self.end_millis
    }
}

/// Attempt parsing a directory entry name. Names that do not carry the
/// expected prefix and time section are not ours and yield `None`.
pub fn parse(prefix: &str, name: &str) -> Option<Span> {
    let dot = name.rfind('.')?;
    let dash = name.rfind('-')?;
    if dash <= dot {
        return None;
    }
    if &name[..dot] != prefix {
        return None;
    }

    let start_millis = name[dot + 1..dash].parse::<i64>().ok()?;
    let rest = &name[dash + 1..];
    let end_millis = if rest.is_empty() {
        END_OPEN
    } else {
        rest.parse::<i64>().ok()?
    };

    Some(Span {
        start_millis,
        end_millis,
    })
}

/// Build the filename for the given span.
pub fn build(prefix: &str, span: Span) -> String {
    let mut name = format!("{}.{}-", prefix, span.start_millis);
    if span.end_millis != END_OPEN {
        name.push_str(&span.end_millis.to_string());
    }
    name
}
