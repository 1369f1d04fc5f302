// SPDX-License-Identifier: Apache-2.0

use crate::PointId;

#[derive(Debug)]
pub enum BmcfuzzError {
    Io {
        context: String,
        source: std::io::Error,
    },
    /// A point ID that does not exist in the point-name table. Indicates the
    /// table and a result file disagree, so the current round is abandoned.
    PointOutOfRange {
        point: PointId,
        total: usize,
    },
    LengthMismatch {
        expected: usize,
        got: usize,
    },
    Parse(String),
    /// Missing tools, failed builds, failed collaborator hooks. Fatal.
    Setup(String),
    Interrupted,
}

impl BmcfuzzError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BmcfuzzError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, BmcfuzzError::Interrupted)
    }
}

impl std::fmt::Display for BmcfuzzError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BmcfuzzError::Io { context, source } => {
                write!(f, "bmcfuzz error: {}: {}", context, source)
            }
            BmcfuzzError::PointOutOfRange { point, total } => write!(
                f,
                "bmcfuzz error: point {} is outside the point universe [0, {})",
                point, total
            ),
            BmcfuzzError::LengthMismatch { expected, got } => write!(
                f,
                "bmcfuzz error: coverage vector has {} entries; expected {}",
                got, expected
            ),
            BmcfuzzError::Parse(msg) => write!(f, "bmcfuzz error: parse: {}", msg),
            BmcfuzzError::Setup(msg) => write!(f, "bmcfuzz error: setup: {}", msg),
            BmcfuzzError::Interrupted => write!(f, "bmcfuzz error: interrupted"),
        }
    }
}

impl std::error::Error for BmcfuzzError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BmcfuzzError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_range() {
        let e = BmcfuzzError::PointOutOfRange { point: 7, total: 4 };
        assert_eq!(
            e.to_string(),
            "bmcfuzz error: point 7 is outside the point universe [0, 4)"
        );
    }

    #[test]
    fn test_io_error_exposes_source() {
        use std::error::Error;
        let e = BmcfuzzError::io(
            "reading cover report",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(e.source().is_some());
        assert!(e.to_string().contains("reading cover report"));
    }
}
