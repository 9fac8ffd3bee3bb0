use thiserror::Error;

/// One article referenced from an [`NzbFile`].
///
/// `bytes_hint` is the size Usenet indexers put in the NZB, which is the
/// *encoded* (yEnc, plus line overhead) size, not the decoded payload size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: String,
    /// 1-based position within the file.
    pub index: u32,
    pub bytes_hint: u64,
}

impl Segment {
    pub fn new(id: impl Into<String>, index: u32, bytes_hint: u64) -> Result<Self, NzbError> {
        let id = id.into();
        if id.is_empty() {
            return Err(NzbError::Invalid("segment id is empty".into()));
        }
        if bytes_hint == 0 {
            return Err(NzbError::Invalid(format!(
                "segment {id} has a zero bytes hint"
            )));
        }
        Ok(Self {
            id,
            index,
            bytes_hint,
        })
    }
}

/// One file described by an NZB: an ordered sequence of [`Segment`]s that
/// concatenate into the file's bytes once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NzbFile {
    pub display_name: String,
    pub filename: String,
    pub groups: Vec<String>,
    pub segments: Vec<Segment>,
    pub parsed_date: Option<i64>,
}

impl NzbFile {
    pub fn new(
        display_name: impl Into<String>,
        filename: impl Into<String>,
        groups: Vec<String>,
        mut segments: Vec<Segment>,
        parsed_date: Option<i64>,
    ) -> Result<Self, NzbError> {
        if segments.is_empty() {
            return Err(NzbError::Invalid("file has no segments".into()));
        }
        if groups.iter().all(|g| g.trim().is_empty()) {
            return Err(NzbError::Invalid("file has no non-empty group".into()));
        }
        segments.sort_by_key(|s| s.index);
        Ok(Self {
            display_name: display_name.into(),
            filename: filename.into(),
            groups,
            segments,
            parsed_date,
        })
    }

    /// Total encoded size hinted by the NZB, summed across segments.
    pub fn hinted_size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_hint).sum()
    }
}

/// A parsed NZB: a named collection of files, optionally password-protected
/// (for the archives it may describe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NzbData {
    pub name: String,
    pub password: Option<String>,
    pub files: Vec<NzbFile>,
}

impl NzbData {
    pub fn new(
        name: impl Into<String>,
        password: Option<String>,
        files: Vec<NzbFile>,
    ) -> Result<Self, NzbError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(NzbError::Invalid("nzb name is empty".into()));
        }
        if files.is_empty() {
            return Err(NzbError::Invalid("nzb has no files".into()));
        }
        Ok(Self {
            name,
            password,
            files,
        })
    }
}

#[derive(Debug, Error)]
pub enum NzbError {
    #[error("invalid nzb data: {0}")]
    Invalid(String),
    #[error("failed to parse nzb xml: {0}")]
    Xml(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_rejects_empty_id() {
        assert!(Segment::new("", 1, 100).is_err());
    }

    #[test]
    fn segment_rejects_zero_bytes_hint() {
        assert!(Segment::new("a@b", 1, 0).is_err());
    }

    #[test]
    fn file_sorts_segments_by_index() {
        let segs = vec![
            Segment::new("b", 2, 10).unwrap(),
            Segment::new("a", 1, 10).unwrap(),
        ];
        let f = NzbFile::new("d", "f.bin", vec!["alt.bin".into()], segs, None).unwrap();
        assert_eq!(f.segments[0].id, "a");
        assert_eq!(f.segments[1].id, "b");
    }

    #[test]
    fn file_rejects_empty_segments() {
        assert!(NzbFile::new("d", "f.bin", vec!["alt.bin".into()], vec![], None).is_err());
    }

    #[test]
    fn nzb_rejects_empty_name() {
        let segs = vec![Segment::new("a", 1, 10).unwrap()];
        let f = NzbFile::new("d", "f.bin", vec!["alt.bin".into()], segs, None).unwrap();
        assert!(NzbData::new("", None, vec![f]).is_err());
    }
}
