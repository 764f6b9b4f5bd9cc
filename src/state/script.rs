//! The line script: one line of text per take
//!
//! Each line gets its own take directory next to the script file, named
//! `<NNNN> <line text>` with characters that are invalid in file names
//! removed.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Characters stripped from take directory names
const INVALID_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Clone)]
pub struct LineScript {
    path: PathBuf,
    root: PathBuf,
    lines: Vec<String>,
    index: usize,
}

impl LineScript {
    /// Load a script, trimming every line
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read lines file {}", path.display()))?;
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_text(path.to_path_buf(), root, &contents)
    }

    fn from_text(path: PathBuf, root: PathBuf, contents: &str) -> Result<Self> {
        let lines: Vec<String> = contents.lines().map(|l| l.trim().to_string()).collect();
        if lines.is_empty() {
            bail!("Lines file {} is empty", path.display());
        }
        Ok(Self {
            path,
            root,
            lines,
            index: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current(&self) -> &str {
        &self.lines[self.index]
    }

    /// Jump to `index`, wrapping around either end
    pub fn go_to(&mut self, index: isize) {
        let len = self.lines.len() as isize;
        self.index = index.rem_euclid(len) as usize;
    }

    pub fn next(&mut self) {
        self.go_to(self.index as isize + 1);
    }

    pub fn prev(&mut self) {
        self.go_to(self.index as isize - 1);
    }

    /// Take directory of the current line
    pub fn take_dir(&self) -> PathBuf {
        self.root.join(dir_name(self.index, self.current()))
    }

    /// Create the current line's take directory if it is missing
    pub fn ensure_take_dir(&self) -> Result<PathBuf> {
        let dir = self.take_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create take directory {}", dir.display()))?;
        Ok(dir)
    }
}

fn dir_name(index: usize, text: &str) -> String {
    format!("{:04} {}", index, text)
        .chars()
        .filter(|c| !c.is_control() && !INVALID_NAME_CHARS.contains(c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(text: &str) -> LineScript {
        LineScript::from_text(PathBuf::from("/tmp/lines.txt"), PathBuf::from("/tmp"), text).unwrap()
    }

    #[test]
    fn test_lines_are_trimmed() {
        let s = script("  Hello there \n\tGeneral Kenobi\n");
        assert_eq!(s.len(), 2);
        assert_eq!(s.current(), "Hello there");
    }

    #[test]
    fn test_navigation_wraps() {
        let mut s = script("a\nb\nc");
        s.prev();
        assert_eq!(s.current(), "c");
        s.next();
        assert_eq!(s.index(), 0);
        s.go_to(7);
        assert_eq!(s.index(), 1);
    }

    #[test]
    fn test_dir_name_strips_invalid_characters() {
        assert_eq!(dir_name(3, "What? No: \"way\" / here*"), "0003 What No way  here");
        assert_eq!(dir_name(12, "plain line"), "0012 plain line");
    }

    #[test]
    fn test_take_dir_sits_next_to_script() {
        let mut s = script("first\nsecond");
        s.next();
        assert_eq!(s.take_dir(), PathBuf::from("/tmp/0001 second"));
    }

    #[test]
    fn test_empty_script_is_rejected() {
        assert!(LineScript::from_text(PathBuf::from("x"), PathBuf::from("."), "").is_err());
    }

    #[test]
    fn test_load_and_create_take_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lines.txt");
        fs::write(&path, "one\ntwo\n").unwrap();

        let s = LineScript::load(&path).unwrap();
        let take_dir = s.ensure_take_dir().unwrap();
        assert_eq!(take_dir, dir.path().join("0000 one"));
        assert!(take_dir.is_dir());
    }
}
