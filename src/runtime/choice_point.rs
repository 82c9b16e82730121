//! Choice Points
//!
//! A choice point is the compiled form of an ink `*` / `+` choice. When the
//! step loop reaches one, it pops any condition and pre-evaluated text off
//! the evaluation stack and materializes a user-facing `Choice`.

use crate::runtime::path::Path;

const FLAG_HAS_CONDITION: i32 = 0x1;
const FLAG_HAS_START_CONTENT: i32 = 0x2;
const FLAG_HAS_CHOICE_ONLY_CONTENT: i32 = 0x4;
const FLAG_IS_INVISIBLE_DEFAULT: i32 = 0x8;
const FLAG_ONCE_ONLY: i32 = 0x10;

#[derive(Debug, Clone, PartialEq)]
pub struct ChoicePoint {
    /// Where choosing this choice diverts to; often relative to the choice
    /// point's own container.
    pub path_on_choice: Path,
    pub has_condition: bool,
    pub has_start_content: bool,
    pub has_choice_only_content: bool,
    pub is_invisible_default: bool,
    pub once_only: bool,
}

impl ChoicePoint {
    pub fn new(path_on_choice: Path) -> ChoicePoint {
        ChoicePoint {
            path_on_choice,
            has_condition: false,
            has_start_content: false,
            has_choice_only_content: false,
            is_invisible_default: false,
            once_only: true,
        }
    }

    pub fn flags(&self) -> i32 {
        let mut flags = 0;
        if self.has_condition {
            flags |= FLAG_HAS_CONDITION;
        }
        if self.has_start_content {
            flags |= FLAG_HAS_START_CONTENT;
        }
        if self.has_choice_only_content {
            flags |= FLAG_HAS_CHOICE_ONLY_CONTENT;
        }
        if self.is_invisible_default {
            flags |= FLAG_IS_INVISIBLE_DEFAULT;
        }
        if self.once_only {
            flags |= FLAG_ONCE_ONLY;
        }
        flags
    }

    pub fn set_flags(&mut self, flags: i32) {
        self.has_condition = flags & FLAG_HAS_CONDITION != 0;
        self.has_start_content = flags & FLAG_HAS_START_CONTENT != 0;
        self.has_choice_only_content = flags & FLAG_HAS_CHOICE_ONLY_CONTENT != 0;
        self.is_invisible_default = flags & FLAG_IS_INVISIBLE_DEFAULT != 0;
        self.once_only = flags & FLAG_ONCE_ONLY != 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_round_trip() {
        for flags in 0..32 {
            let mut point = ChoicePoint::new(Path::default());
            point.set_flags(flags);
            assert_eq!(point.flags(), flags);
        }
    }

    #[test]
    fn test_default_is_once_only() {
        let point = ChoicePoint::new(Path::default());
        assert!(point.once_only);
        assert_eq!(point.flags(), FLAG_ONCE_ONLY);
    }
}
