//! Track parameter space for `setParam` / `getParam` / `fadeParam`.

use serde::{Deserialize, Serialize};

/// A per-track parameter.
///
/// The first seven are writable voice parameters; the rest are read-only
/// values derived from the track's playback state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamId {
    Group,
    Priority,
    Volume,
    Pan,
    Detune,
    Transpose,
    Mailbox,
    /// 1 when the track plays from a ring stream.
    HasStream,
    /// Ring buffer category index plus one, 0 without a stream.
    StreamCategory,
    /// Elapsed position in the decoded stream, in milliseconds.
    PositionMs,
}

impl ParamId {
    /// Parameters that `fadeParam` accepts.
    pub const fn is_fadeable(self) -> bool {
        matches!(
            self,
            ParamId::Priority | ParamId::Volume | ParamId::Pan | ParamId::Detune
        )
    }

    pub const fn is_writable(self) -> bool {
        matches!(
            self,
            ParamId::Group
                | ParamId::Priority
                | ParamId::Volume
                | ParamId::Pan
                | ParamId::Detune
                | ParamId::Transpose
                | ParamId::Mailbox
        )
    }

    /// Legal value range for writable parameters. Mailbox accepts anything.
    pub const fn range(self) -> Option<(i32, i32)> {
        match self {
            ParamId::Group => Some((0, 2)),
            ParamId::Priority | ParamId::Volume | ParamId::Pan => Some((0, 127)),
            ParamId::Detune => Some((-9216, 9216)),
            ParamId::Transpose => Some((-12, 12)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fadeable_set_is_exact() {
        let fadeable: Vec<_> = [
            ParamId::Group,
            ParamId::Priority,
            ParamId::Volume,
            ParamId::Pan,
            ParamId::Detune,
            ParamId::Transpose,
            ParamId::Mailbox,
            ParamId::HasStream,
            ParamId::StreamCategory,
            ParamId::PositionMs,
        ]
        .into_iter()
        .filter(|p| p.is_fadeable())
        .collect();
        assert_eq!(
            fadeable,
            [ParamId::Priority, ParamId::Volume, ParamId::Pan, ParamId::Detune]
        );
    }

    #[test]
    fn derived_params_are_read_only() {
        assert!(!ParamId::HasStream.is_writable());
        assert!(!ParamId::PositionMs.is_writable());
        assert!(ParamId::Mailbox.is_writable());
        assert_eq!(ParamId::Mailbox.range(), None);
    }
}
