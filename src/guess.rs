//! Initial-guess loading.
//!
//! Guess files are an opaque nested numeric mapping keyed by stringified
//! integers (frame index, then unknown index).  A missing file is the
//! one locally-recovered condition in the crate: it degrades to the
//! all-empty guess set with a logged notice.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use log::warn;

use crate::types::{EpiforceError, Guesses};

/// Load guesses from `path`, filling every frame index in
/// `[min_time, max_time)` not present with an empty seed.
///
/// A nonexistent file yields the all-empty guess set; a file that exists
/// but does not parse is an error.
pub fn load_initial_guess(
    path: impl AsRef<Path>,
    min_time: usize,
    max_time: usize,
) -> Result<Guesses, EpiforceError> {
    let path = path.as_ref();
    let mut guesses = match fs::read_to_string(path) {
        Ok(contents) => parse_guesses(&contents)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!("no guess file at {}, using zero guess", path.display());
            Guesses::new()
        }
        Err(e) => return Err(EpiforceError::Guess(e.to_string())),
    };
    for t in min_time..max_time {
        guesses.entry(t).or_default();
    }
    Ok(guesses)
}

fn parse_guesses(contents: &str) -> Result<Guesses, EpiforceError> {
    let raw: BTreeMap<String, BTreeMap<String, f64>> =
        serde_json::from_str(contents).map_err(|e| EpiforceError::Guess(e.to_string()))?;
    let mut guesses = Guesses::new();
    for (frame_key, seeds) in raw {
        let frame = frame_key
            .parse::<usize>()
            .map_err(|e| EpiforceError::Guess(format!("frame key {frame_key:?}: {e}")))?;
        let mut parsed = BTreeMap::new();
        for (unknown_key, value) in seeds {
            let unknown = unknown_key
                .parse::<usize>()
                .map_err(|e| EpiforceError::Guess(format!("unknown key {unknown_key:?}: {e}")))?;
            parsed.insert(unknown, value);
        }
        guesses.insert(frame, parsed);
    }
    Ok(guesses)
}
