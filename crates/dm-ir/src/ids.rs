//! Sound, group and buffer-category identifiers.

use serde::{Deserialize, Serialize};

/// External sound handle. Zero is never a valid sound.
pub type SoundId = u32;

/// Bus classification of a track, used for group volume scaling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    #[default]
    Sfx,
    Speech,
    Music,
}

impl Group {
    pub const ALL: [Group; 3] = [Group::Sfx, Group::Speech, Group::Music];

    /// Dense index, used for per-group tables.
    pub const fn index(self) -> usize {
        match self {
            Group::Sfx => 0,
            Group::Speech => 1,
            Group::Music => 2,
        }
    }

    /// Parse the numeric group value carried by `setParam`.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            0 => Some(Group::Sfx),
            1 => Some(Group::Speech),
            2 => Some(Group::Music),
            _ => None,
        }
    }

    pub const fn value(self) -> i32 {
        self.index() as i32
    }
}

/// Which shared ring buffer a streamed sound borrows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferCategory {
    Speech,
    Music,
    Sfx,
}

impl BufferCategory {
    pub const ALL: [BufferCategory; 3] =
        [BufferCategory::Speech, BufferCategory::Music, BufferCategory::Sfx];

    pub const fn index(self) -> usize {
        match self {
            BufferCategory::Speech => 0,
            BufferCategory::Music => 1,
            BufferCategory::Sfx => 2,
        }
    }

    /// The buffer a sound of the given group streams through.
    pub const fn for_group(group: Group) -> Self {
        match group {
            Group::Sfx => BufferCategory::Sfx,
            Group::Speech => BufferCategory::Speech,
            Group::Music => BufferCategory::Music,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_value_round_trips() {
        for group in Group::ALL {
            assert_eq!(Group::from_value(group.value()), Some(group));
        }
        assert_eq!(Group::from_value(3), None);
        assert_eq!(Group::from_value(-1), None);
    }

    #[test]
    fn categories_follow_groups() {
        assert_eq!(BufferCategory::for_group(Group::Music), BufferCategory::Music);
        assert_eq!(BufferCategory::for_group(Group::Speech), BufferCategory::Speech);
        assert_eq!(BufferCategory::for_group(Group::Sfx), BufferCategory::Sfx);
    }
}
