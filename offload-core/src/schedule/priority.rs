use std::path::Path;
use std::sync::Arc;

use offload_config::{SettingsRegistry, settings};

use crate::filter::extension_of;

const DIRECTORY_BUMP: i32 = 6;
const SMALL_FILE_BONUS: i32 = 2;
const LARGE_FILE_PENALTY: i32 = 2;
const SMALL_FILE_BYTES: u64 = 1024;
const LARGE_FILE_BYTES: u64 = 1024 * 1024 * 1024;

/// Computes a task's priority from its extension mapping, kind, and an
/// optional size hint. Only metadata already in hand is consulted; the
/// enqueue path never touches the filesystem.
pub struct PriorityRule {
    settings: Arc<SettingsRegistry>,
}

impl PriorityRule {
    pub fn new(settings: Arc<SettingsRegistry>) -> Self {
        Self { settings }
    }

    pub fn priority_for(&self, path: &Path, is_dir: bool, size_hint: Option<u64>) -> u8 {
        let default = self.settings.get(&settings::PRIORITY_DEFAULT).clamp(0, 100);

        let mut priority = if is_dir {
            default + DIRECTORY_BUMP
        } else {
            let map = settings::parse_priority_map(&self.settings.get(&settings::PRIORITY_MAP));
            extension_of(path)
                .and_then(|ext| map.get(&ext).copied())
                .map(i32::from)
                .unwrap_or(default)
        };

        if !is_dir {
            match size_hint {
                Some(size) if size < SMALL_FILE_BYTES => priority += SMALL_FILE_BONUS,
                Some(size) if size > LARGE_FILE_BYTES => priority -= LARGE_FILE_PENALTY,
                _ => {}
            }
        }

        priority.clamp(0, 100) as u8
    }
}

impl std::fmt::Debug for PriorityRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityRule").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> (Arc<SettingsRegistry>, PriorityRule) {
        let settings = Arc::new(SettingsRegistry::new());
        (settings.clone(), PriorityRule::new(settings))
    }

    #[test]
    fn unmapped_extension_gets_the_default() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_MAP, Vec::<String>::new());
        assert_eq!(rule.priority_for(Path::new("a.unknown"), false, None), 5);
    }

    #[test]
    fn mapped_extension_wins() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_MAP, vec!["pdf=9".to_string()]);
        assert_eq!(rule.priority_for(Path::new("doc.PDF"), false, None), 9);
    }

    #[test]
    fn directories_get_the_fixed_bump() {
        let (settings, rule) = rule();
        let dir_priority = rule.priority_for(Path::new("folder"), true, None);
        assert_eq!(dir_priority, 11);
        assert!(dir_priority >= settings.get(&settings::PRIORITY_DEFAULT) as u8 + 6);
    }

    #[test]
    fn directory_bump_clamps_at_100() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_DEFAULT, 98);
        assert_eq!(rule.priority_for(Path::new("folder"), true, None), 100);
    }

    #[test]
    fn tiny_files_get_a_bonus_and_huge_files_a_penalty() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_MAP, Vec::<String>::new());
        assert_eq!(rule.priority_for(Path::new("s.bin"), false, Some(100)), 7);
        assert_eq!(
            rule.priority_for(Path::new("l.bin"), false, Some(2 * 1024 * 1024 * 1024)),
            3
        );
        assert_eq!(
            rule.priority_for(Path::new("m.bin"), false, Some(1024 * 1024)),
            5
        );
    }

    #[test]
    fn missing_size_hint_changes_nothing() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_MAP, Vec::<String>::new());
        assert_eq!(rule.priority_for(Path::new("x.bin"), false, None), 5);
    }

    #[test]
    fn never_leaves_the_valid_range() {
        let (settings, rule) = rule();
        settings.set(&settings::PRIORITY_DEFAULT, 0);
        assert_eq!(
            rule.priority_for(Path::new("l.bin"), false, Some(3 * 1024 * 1024 * 1024)),
            0
        );
    }
}
