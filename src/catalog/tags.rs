use crate::client::Child;

use super::{to_virtual, SEP};

/// Number of slots in a tag record. The cache format and every listing
/// operation assume exactly this width.
pub const TAG_SLOTS: usize = 11;

/// Positional slots of a tag record. The discriminants are the on-disk slot
/// indexes, so reordering this enum is a format change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagSlot {
    Url = 0,
    Artist = 1,
    TrackTitle = 2,
    Album = 3,
    Year = 4,
    TrackNo = 5,
    Genre = 6,
    DurationMs = 7,
    Bitrate = 8,
    Size = 9,
    Artwork = 10,
}

impl TagSlot {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Url),
            1 => Some(Self::Artist),
            2 => Some(Self::TrackTitle),
            3 => Some(Self::Album),
            4 => Some(Self::Year),
            5 => Some(Self::TrackNo),
            6 => Some(Self::Genre),
            7 => Some(Self::DurationMs),
            8 => Some(Self::Bitrate),
            9 => Some(Self::Size),
            10 => Some(Self::Artwork),
            _ => None,
        }
    }
}

/// Fixed 11-slot projection of one song. Slot 0 is the virtual path; every
/// other slot is an empty string when the source field is absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TagRecord {
    slots: [String; TAG_SLOTS],
}

impl TagRecord {
    pub fn from_slots(slots: [String; TAG_SLOTS]) -> Self {
        Self { slots }
    }

    pub fn get(&self, slot: TagSlot) -> &str {
        &self.slots[slot as usize]
    }

    pub fn set(&mut self, slot: TagSlot, value: String) {
        self.slots[slot as usize] = value;
    }

    /// Virtual path of the song (slot 0).
    pub fn path(&self) -> &str {
        &self.slots[TagSlot::Url as usize]
    }

    pub fn set_path(&mut self, path: String) {
        self.slots[TagSlot::Url as usize] = path;
    }

    pub fn slots(&self) -> &[String; TAG_SLOTS] {
        &self.slots
    }
}

fn stringify<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Project one remote child into a tag record.
///
/// Videos are excluded outright. With `base_folder` given (the collection
/// name), the path slot is fully qualified; without it the path is the bare
/// translated child path and must be disambiguated before use.
pub fn project(child: &Child, base_folder: Option<&str>) -> Option<TagRecord> {
    if child.is_video {
        return None;
    }
    let relative = to_virtual(&child.path);
    let path = match base_folder {
        Some(base) => format!("{}{}{}", base, SEP, relative),
        None => relative,
    };

    let mut record = TagRecord::default();
    record.set_path(path);
    record.set(TagSlot::Artist, child.artist.clone().unwrap_or_default());
    record.set(TagSlot::TrackTitle, child.title.clone());
    record.set(TagSlot::Album, child.album.clone().unwrap_or_default());
    record.set(TagSlot::Year, stringify(child.year));
    record.set(TagSlot::TrackNo, stringify(child.track));
    record.set(TagSlot::Genre, child.genre.clone().unwrap_or_default());
    record.set(
        TagSlot::DurationMs,
        stringify(child.duration_secs.map(|s| s * 1000)),
    );
    record.set(TagSlot::Bitrate, stringify(child.bit_rate));
    record.set(TagSlot::Size, stringify(child.size));
    record.set(
        TagSlot::Artwork,
        if child.cover_art.is_some() {
            "Y".to_string()
        } else {
            String::new()
        },
    );
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song() -> Child {
        Child {
            id: "100".to_string(),
            title: "Come Together".to_string(),
            is_dir: false,
            path: "Beatles/Abbey Road/01 Come Together.mp3".to_string(),
            artist: Some("The Beatles".to_string()),
            album: Some("Abbey Road".to_string()),
            year: Some(1969),
            track: Some(1),
            genre: Some("Rock".to_string()),
            duration_secs: Some(259),
            bit_rate: Some(320),
            size: Some(10_340_000),
            cover_art: Some("77".to_string()),
            is_video: false,
        }
    }

    #[test]
    fn test_project_full_song() {
        let record = project(&song(), Some("Music")).unwrap();
        assert_eq!(
            record.path(),
            "Music\\Beatles\\Abbey Road\\01 Come Together.mp3"
        );
        assert_eq!(record.get(TagSlot::Artist), "The Beatles");
        assert_eq!(record.get(TagSlot::TrackTitle), "Come Together");
        assert_eq!(record.get(TagSlot::Album), "Abbey Road");
        assert_eq!(record.get(TagSlot::Year), "1969");
        assert_eq!(record.get(TagSlot::TrackNo), "1");
        assert_eq!(record.get(TagSlot::DurationMs), "259000");
        assert_eq!(record.get(TagSlot::Bitrate), "320");
        assert_eq!(record.get(TagSlot::Size), "10340000");
        assert_eq!(record.get(TagSlot::Artwork), "Y");
    }

    #[test]
    fn test_video_is_excluded() {
        let mut child = song();
        child.is_video = true;
        assert!(project(&child, Some("Music")).is_none());
    }

    #[test]
    fn test_absent_fields_are_empty_not_zero() {
        let child = Child {
            id: "5".to_string(),
            title: "Untitled".to_string(),
            path: "X/Untitled.flac".to_string(),
            ..Default::default()
        };
        let record = project(&child, Some("Music")).unwrap();
        assert_eq!(record.get(TagSlot::Year), "");
        assert_eq!(record.get(TagSlot::TrackNo), "");
        assert_eq!(record.get(TagSlot::DurationMs), "");
        assert_eq!(record.get(TagSlot::Bitrate), "");
        assert_eq!(record.get(TagSlot::Size), "");
        assert_eq!(record.get(TagSlot::Artwork), "");
    }

    #[test]
    fn test_zero_duration_stays_zero() {
        let mut child = song();
        child.duration_secs = Some(0);
        let record = project(&child, Some("Music")).unwrap();
        assert_eq!(record.get(TagSlot::DurationMs), "0");
    }

    #[test]
    fn test_without_base_folder_path_is_relative() {
        let record = project(&song(), None).unwrap();
        assert_eq!(record.path(), "Beatles\\Abbey Road\\01 Come Together.mp3");
    }
}
