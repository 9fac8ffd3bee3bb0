//! Minimal parser for the subset of the NZB DTD this system cares about:
//! `<head><meta type="password">`, and per-`<file>` `groups`/`segments`.
//!
//! NZB parsing is an external collaborator's concern per the core
//! specification; this parser exists so the CLI binary has a real producer
//! to hand `NzbData` to the assembly service, not because the engine
//! depends on any particular XML shape.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::nzb::{NzbData, NzbError, NzbFile, Segment};

pub fn parse_nzb(xml: &[u8]) -> Result<NzbData, NzbError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut password: Option<String> = None;
    let mut files = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| NzbError::Xml(e.to_string()))?
        {
            Event::Start(ref e) if e.local_name().as_ref() == b"meta" => {
                let is_password = e.attributes().flatten().any(|a| {
                    a.key.as_ref() == b"type" && a.value.as_ref() == b"password"
                });
                if is_password {
                    if let Event::Text(t) = reader
                        .read_event_into(&mut buf)
                        .map_err(|e| NzbError::Xml(e.to_string()))?
                    {
                        password = Some(
                            t.unescape()
                                .map_err(|e| NzbError::Xml(e.to_string()))?
                                .into_owned(),
                        );
                    }
                }
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"file" => {
                files.push(parse_file(&mut reader, e)?);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let name = files
        .first()
        .map(|f: &NzbFile| guess_nzb_name(&f.display_name))
        .unwrap_or_default();

    NzbData::new(name, password, files)
}

fn parse_file(
    reader: &mut Reader<&[u8]>,
    start: &quick_xml::events::BytesStart,
) -> Result<NzbFile, NzbError> {
    let mut display_name = String::new();
    let mut parsed_date = None;
    for attr in start.attributes().flatten() {
        match attr.key.as_ref() {
            b"subject" => {
                display_name = attr
                    .unescape_value()
                    .map_err(|e| NzbError::Xml(e.to_string()))?
                    .into_owned();
            }
            b"date" => {
                parsed_date = std::str::from_utf8(&attr.value).ok().and_then(|s| s.parse().ok());
            }
            _ => {}
        }
    }

    let mut groups = Vec::new();
    let mut segments = Vec::new();
    let mut buf = Vec::new();
    let mut depth = 1u32;
    let mut in_group = false;

    while depth > 0 {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| NzbError::Xml(e.to_string()))?
        {
            Event::Start(ref e) => {
                depth += 1;
                match e.local_name().as_ref() {
                    b"group" => in_group = true,
                    b"segment" => {
                        let mut bytes_hint = 0u64;
                        let mut index = 0u32;
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"bytes" => {
                                    bytes_hint = std::str::from_utf8(&attr.value)
                                        .ok()
                                        .and_then(|s| s.parse().ok())
                                        .unwrap_or(0);
                                }
                                b"number" => {
                                    index = std::str::from_utf8(&attr.value)
                                        .ok()
                                        .and_then(|s| s.parse().ok())
                                        .unwrap_or(0);
                                }
                                _ => {}
                            }
                        }
                        if let Event::Text(t) = reader
                            .read_event_into(&mut buf)
                            .map_err(|e| NzbError::Xml(e.to_string()))?
                        {
                            let id = t
                                .unescape()
                                .map_err(|e| NzbError::Xml(e.to_string()))?
                                .into_owned();
                            segments.push(Segment::new(id, index, bytes_hint.max(1))?);
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(t) if in_group => {
                let text = t.unescape().map_err(|e| NzbError::Xml(e.to_string()))?;
                if !text.trim().is_empty() {
                    groups.push(text.trim().to_string());
                }
            }
            Event::End(ref e) => {
                depth -= 1;
                if e.local_name().as_ref() == b"group" {
                    in_group = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let filename = guess_filename(&display_name);
    NzbFile::new(display_name, filename, groups, segments, parsed_date)
}

/// Heuristic only used when no external grouping helper overrides it:
/// NZB subjects commonly look like `"some release" yEnc (1/20) - "file.bin"`.
fn guess_filename(display_name: &str) -> String {
    if let (Some(start), Some(end)) = (display_name.find('"'), display_name.rfind('"')) {
        if end > start {
            return display_name[start + 1..end].to_string();
        }
    }
    display_name.to_string()
}

fn guess_nzb_name(first_display_name: &str) -> String {
    guess_filename(first_display_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="iso-8859-1"?>
<!DOCTYPE nzb PUBLIC "-//newzBin//DTD NZB 1.1//EN" "http://www.newzbin.com/DTD/nzb/nzb-1.1.dtd">
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
<head>
<meta type="password">sekrit</meta>
</head>
<file subject='"movie.mkv" yEnc (1/2)' date="1700000000" poster="a@b">
<groups>
<group>alt.binaries.test</group>
</groups>
<segments>
<segment bytes="716800" number="1">abc123@example.com</segment>
<segment bytes="716800" number="2">def456@example.com</segment>
</segments>
</file>
</nzb>"#;

    #[test]
    fn parses_sample_nzb() {
        let nzb = parse_nzb(SAMPLE.as_bytes()).unwrap();
        assert_eq!(nzb.password.as_deref(), Some("sekrit"));
        assert_eq!(nzb.files.len(), 1);
        let f = &nzb.files[0];
        assert_eq!(f.filename, "movie.mkv");
        assert_eq!(f.groups, vec!["alt.binaries.test".to_string()]);
        assert_eq!(f.segments.len(), 2);
        assert_eq!(f.segments[0].id, "abc123@example.com");
        assert_eq!(f.segments[1].index, 2);
    }
}
