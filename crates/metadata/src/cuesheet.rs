//! Cue sheet reader.
//!
//! Only the commands that carry tag or timing data are interpreted: `FILE`,
//! `TRACK`, `TITLE`, `PERFORMER`, `INDEX` and `REM`. Anything else is
//! ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use nom::{
    branch::alt,
    bytes::complete::{take_till1, take_until},
    character::complete::{char, digit1, space0, space1},
    combinator::{map, map_res, rest},
    sequence::{delimited, preceded, tuple},
    IResult,
};

const FRAMES_PER_SECOND: u64 = 75;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueSheet {
    pub title: String,
    pub performer: String,
    pub rem: Remarks,
    pub files: Vec<CueFile>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueFile {
    pub name: String,
    pub kind: String,
    pub tracks: Vec<CueTrack>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CueTrack {
    pub number: u32,
    pub title: String,
    pub performer: String,
    pub rem: Remarks,
    /// Start of the track (`INDEX 01`) from the beginning of the file.
    pub start: Duration,
}

impl CueFile {
    /// File name without any directory part; sheets written on Windows use
    /// backslashes.
    pub fn base_name(&self) -> &str {
        self.name
            .rsplit(&['/', '\\'][..])
            .next()
            .unwrap_or(self.name.as_str())
    }
}

/// `REM` entries keyed by upper-cased name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Remarks(BTreeMap<String, String>);

impl Remarks {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(&key.to_ascii_uppercase())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn genre(&self) -> Option<&str> {
        self.get("GENRE")
    }

    pub fn date(&self) -> Option<&str> {
        self.get("DATE")
    }

    pub fn comment(&self) -> Option<&str> {
        self.get("COMMENT")
    }

    pub fn disc_number(&self) -> u32 {
        self.get("DISCNUMBER")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn total_discs(&self) -> u32 {
        self.get("TOTALDISCS")
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn album_gain(&self) -> Option<&str> {
        self.get("REPLAYGAIN_ALBUM_GAIN")
    }

    pub fn album_peak(&self) -> Option<&str> {
        self.get("REPLAYGAIN_ALBUM_PEAK")
    }

    pub fn track_gain(&self) -> Option<&str> {
        self.get("REPLAYGAIN_TRACK_GAIN")
    }

    pub fn track_peak(&self) -> Option<&str> {
        self.get("REPLAYGAIN_TRACK_PEAK")
    }

    fn insert(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_ascii_uppercase(), value.to_string());
    }
}

#[derive(Debug)]
pub enum CueError {
    Io(std::io::Error),
    Syntax { line: usize, message: String },
    NoFiles,
}

impl std::fmt::Display for CueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CueError::Io(err) => write!(f, "io error: {}", err),
            CueError::Syntax { line, message } => {
                write!(f, "cue syntax error on line {}: {}", line, message)
            }
            CueError::NoFiles => write!(f, "cue sheet has no FILE entries"),
        }
    }
}

impl std::error::Error for CueError {}

impl From<std::io::Error> for CueError {
    fn from(err: std::io::Error) -> Self {
        CueError::Io(err)
    }
}

impl CueSheet {
    pub fn read_from_file(path: &Path) -> Result<Self, CueError> {
        let bytes = fs::read(path)?;
        Self::read_from_buffer(&bytes)
    }

    /// Cue sheets in the wild are often not UTF-8; invalid sequences are
    /// replaced rather than rejected.
    pub fn read_from_buffer(bytes: &[u8]) -> Result<Self, CueError> {
        Self::parse(&String::from_utf8_lossy(bytes))
    }

    pub fn parse(input: &str) -> Result<Self, CueError> {
        let input = input.trim_start_matches('\u{feff}');
        let mut sheet = CueSheet::default();

        for (idx, raw_line) in input.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            let syntax = |message: &str| CueError::Syntax {
                line: line_no,
                message: message.to_string(),
            };

            let (args, keyword) = command(line).map_err(|_| syntax("missing command"))?;
            match keyword.to_ascii_uppercase().as_str() {
                "FILE" => {
                    let (_, (name, kind)) =
                        file_args(args).map_err(|_| syntax("malformed FILE"))?;
                    sheet.files.push(CueFile {
                        name: name.to_string(),
                        kind: kind.to_ascii_uppercase(),
                        tracks: Vec::new(),
                    });
                }
                "TRACK" => {
                    let (_, number) = track_args(args).map_err(|_| syntax("malformed TRACK"))?;
                    let file = sheet
                        .files
                        .last_mut()
                        .ok_or_else(|| syntax("TRACK before FILE"))?;
                    file.tracks.push(CueTrack {
                        number,
                        ..CueTrack::default()
                    });
                }
                "INDEX" => {
                    let (_, (number, start)) =
                        index_args(args).map_err(|_| syntax("malformed INDEX"))?;
                    let track = current_track(&mut sheet)
                        .ok_or_else(|| syntax("INDEX outside TRACK"))?;
                    // INDEX 00 is the pregap; it only stands in until INDEX 01 shows up.
                    if number == 1 || (number == 0 && track.start.is_zero()) {
                        track.start = start;
                    }
                }
                "TITLE" => {
                    let value = text_value(args);
                    match current_track(&mut sheet) {
                        Some(track) => track.title = value,
                        None => sheet.title = value,
                    }
                }
                "PERFORMER" => {
                    let value = text_value(args);
                    match current_track(&mut sheet) {
                        Some(track) => track.performer = value,
                        None => sheet.performer = value,
                    }
                }
                "REM" => {
                    let (value, key) = command(args).map_err(|_| syntax("empty REM"))?;
                    let value = text_value(value);
                    match current_track(&mut sheet) {
                        Some(track) => track.rem.insert(key, &value),
                        None => sheet.rem.insert(key, &value),
                    }
                }
                _ => {}
            }
        }

        if sheet.files.is_empty() {
            return Err(CueError::NoFiles);
        }
        Ok(sheet)
    }
}

fn current_track(sheet: &mut CueSheet) -> Option<&mut CueTrack> {
    sheet.files.last_mut().and_then(|file| file.tracks.last_mut())
}

fn command(input: &str) -> IResult<&str, &str> {
    preceded(space0, word)(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_until("\""), char('"'))(input)
}

fn value(input: &str) -> IResult<&str, &str> {
    preceded(space0, alt((quoted, map(rest, str::trim))))(input)
}

fn text_value(input: &str) -> String {
    value(input)
        .map(|(_, value)| value.to_string())
        .unwrap_or_default()
}

fn file_args(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, name) = preceded(space0, alt((quoted, word)))(input)?;
    let (input, kind) = alt((preceded(space1, word), map(space0, |_| "")))(input)?;
    Ok((input, (name, kind)))
}

fn track_args(input: &str) -> IResult<&str, u32> {
    preceded(space0, map_res(digit1, str::parse::<u32>))(input)
}

fn index_args(input: &str) -> IResult<&str, (u32, Duration)> {
    let (input, number) = preceded(space0, map_res(digit1, str::parse::<u32>))(input)?;
    let (input, start) = preceded(space1, timestamp)(input)?;
    Ok((input, (number, start)))
}

/// Parses `MM:SS:FF`, where frames are 1/75 of a second.
pub fn timestamp(input: &str) -> IResult<&str, Duration> {
    map(
        tuple((number, char(':'), number, char(':'), number)),
        |(minutes, _, seconds, _, frames)| {
            Duration::from_millis(minutes * 60_000 + seconds * 1_000)
                + Duration::from_nanos(frames * 1_000_000_000 / FRAMES_PER_SECOND)
        },
    )(input)
}

fn number(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}
