//! The simple edit-distance-free grouping rule named in §4.9: bucket
//! filenames that share a multi-volume RAR/7z naming convention. Real
//! grouping/deobfuscation heuristics are out of scope (§1) and can replace
//! this default via [`GroupingHeuristic`].

use nzbfs_archive::ArchiveKind;
use regex::Regex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ArchiveGroup {
    pub key: String,
    pub kind: ArchiveKind,
    /// Member filenames, sorted into volume order.
    pub members: Vec<String>,
}

/// Groups filenames sharing a directory/release name into candidate
/// archive volume sets. Non-archive filenames are simply omitted from the
/// result; the caller keeps them as standalone file resources.
pub trait GroupingHeuristic: Send + Sync {
    fn group(&self, filenames: &[String]) -> Vec<ArchiveGroup>;
}

pub struct DefaultGrouping {
    rar_part: Regex,
    rar_old: Regex,
    sevenz: Regex,
}

impl Default for DefaultGrouping {
    fn default() -> Self {
        Self {
            rar_part: Regex::new(r"(?i)^(?P<base>.+)\.part(?P<num>\d+)\.rar$").unwrap(),
            rar_old: Regex::new(r"(?i)^(?P<base>.+)\.r(?:ar|(?P<num>\d{2,3}))$").unwrap(),
            sevenz: Regex::new(r"(?i)^(?P<base>.+)\.7z(?:\.(?P<num>\d+))?$").unwrap(),
        }
    }
}

impl GroupingHeuristic for DefaultGrouping {
    fn group(&self, filenames: &[String]) -> Vec<ArchiveGroup> {
        // Volume index, where present, so members can be sorted in the
        // order the decoder actually needs to read them rather than
        // lexically: `.rar`/`.7z` (no number) always comes first, then
        // ascending by the captured number (`part10` after `part2`).
        let mut buckets: HashMap<String, (ArchiveKind, Vec<(String, Option<u64>)>)> = HashMap::new();
        for name in filenames {
            let (base, kind, num) = if let Some(c) = self.rar_part.captures(name) {
                (c["base"].to_string(), ArchiveKind::Rar, Self::parse_num(&c))
            } else if let Some(c) = self.rar_old.captures(name) {
                (c["base"].to_string(), ArchiveKind::Rar, Self::parse_num(&c))
            } else if let Some(c) = self.sevenz.captures(name) {
                (c["base"].to_string(), ArchiveKind::SevenZ, Self::parse_num(&c))
            } else {
                continue;
            };
            buckets.entry(base).or_insert((kind, Vec::new())).1.push((name.clone(), num));
        }
        let mut groups: Vec<ArchiveGroup> = buckets
            .into_iter()
            .map(|(key, (kind, mut members))| {
                members.sort_by_key(|(_, num)| (num.is_some(), num.unwrap_or(0)));
                let members = members.into_iter().map(|(name, _)| name).collect();
                ArchiveGroup { key, kind, members }
            })
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }
}

impl DefaultGrouping {
    fn parse_num(c: &regex::Captures) -> Option<u64> {
        c.name("num").and_then(|m| m.as_str().parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_new_style_rar_parts() {
        let g = DefaultGrouping::default();
        let files = vec![
            "Movie.part02.rar".to_string(),
            "Movie.part01.rar".to_string(),
            "readme.txt".to_string(),
        ];
        let groups = g.group(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].key, "Movie");
        assert_eq!(groups[0].kind, ArchiveKind::Rar);
        assert_eq!(groups[0].members, vec!["Movie.part01.rar", "Movie.part02.rar"]);
    }

    #[test]
    fn groups_old_style_rar_volumes() {
        let g = DefaultGrouping::default();
        let files = vec!["Show.rar".to_string(), "Show.r00".to_string(), "Show.r01".to_string()];
        let groups = g.group(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec!["Show.rar", "Show.r00", "Show.r01"]);
    }

    #[test]
    fn numeric_sort_handles_ten_or_more_part_volumes() {
        let g = DefaultGrouping::default();
        let files = vec![
            "Movie.part2.rar".to_string(),
            "Movie.part10.rar".to_string(),
            "Movie.part1.rar".to_string(),
        ];
        let groups = g.group(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(
            groups[0].members,
            vec!["Movie.part1.rar", "Movie.part2.rar", "Movie.part10.rar"]
        );
    }

    #[test]
    fn groups_split_sevenz_volumes() {
        let g = DefaultGrouping::default();
        let files = vec!["Pack.7z.002".to_string(), "Pack.7z".to_string(), "Pack.7z.001".to_string()];
        let groups = g.group(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind, ArchiveKind::SevenZ);
        assert_eq!(groups[0].members, vec!["Pack.7z", "Pack.7z.001", "Pack.7z.002"]);
    }

    #[test]
    fn ignores_non_archive_filenames() {
        let g = DefaultGrouping::default();
        let files = vec!["notes.txt".to_string(), "cover.jpg".to_string()];
        assert!(g.group(&files).is_empty());
    }
}
